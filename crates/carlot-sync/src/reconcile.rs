use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use carlot_core::{Listing, Snapshot, VolatileFields};
use carlot_storage::{CatalogStore, CatalogTx, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStep {
    Begin,
    StageSnapshot,
    Diff,
    ArchiveClosed,
    InsertNew,
    UpdateVolatile,
    Commit,
}

impl fmt::Display for ReconcileStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReconcileStep::Begin => "begin",
            ReconcileStep::StageSnapshot => "stage_snapshot",
            ReconcileStep::Diff => "diff",
            ReconcileStep::ArchiveClosed => "archive_closed",
            ReconcileStep::InsertNew => "insert_new",
            ReconcileStep::UpdateVolatile => "update_volatile",
            ReconcileStep::Commit => "commit",
        })
    }
}

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("reconciliation step {step} failed: {source}")]
    Store {
        step: ReconcileStep,
        #[source]
        source: StoreError,
    },
    #[error("reconciliation step {step} touched {actual} rows, expected {expected}")]
    RowCount {
        step: ReconcileStep,
        expected: usize,
        actual: u64,
    },
    #[error("store reported {0} as new but it is absent from the snapshot")]
    MissingFromSnapshot(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub snapshot_size: usize,
    pub new: usize,
    pub updated: usize,
    pub closed: usize,
    pub new_urls: Vec<String>,
    pub closed_urls: Vec<String>,
    /// Snapshot urls already archived in an earlier cycle; left in `Closed`.
    pub retired_urls: Vec<String>,
}

/// Applies one validated snapshot to the catalog as a single transaction.
#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn CatalogStore>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    pub async fn reconcile(
        &self,
        snapshot: &Snapshot,
        closed_at: DateTime<Utc>,
    ) -> Result<ReconcileStats, ReconciliationError> {
        let mut tx = self
            .store
            .begin()
            .await
            .map_err(at_step(ReconcileStep::Begin))?;

        match apply(tx.as_mut(), snapshot, closed_at).await {
            Ok(stats) => {
                tx.commit().await.map_err(at_step(ReconcileStep::Commit))?;
                info!(
                    backend = self.store.backend(),
                    new = stats.new,
                    updated = stats.updated,
                    closed = stats.closed,
                    "snapshot reconciled"
                );
                Ok(stats)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(error = %rollback_err, "rollback after failed reconciliation also failed");
                }
                error!(error = %err, "reconciliation rolled back; catalog unchanged");
                Err(err)
            }
        }
    }
}

fn at_step(step: ReconcileStep) -> impl Fn(StoreError) -> ReconciliationError {
    move |source| ReconciliationError::Store { step, source }
}

fn expect_rows(step: ReconcileStep, expected: usize, actual: u64) -> Result<(), ReconciliationError> {
    if actual == expected as u64 {
        Ok(())
    } else {
        Err(ReconciliationError::RowCount {
            step,
            expected,
            actual,
        })
    }
}

/// Stage, classify, then archive closed before inserting new and refreshing the rest.
async fn apply(
    tx: &mut dyn CatalogTx,
    snapshot: &Snapshot,
    closed_at: DateTime<Utc>,
) -> Result<ReconcileStats, ReconciliationError> {
    tx.replace_temp(snapshot)
        .await
        .map_err(at_step(ReconcileStep::StageSnapshot))?;

    let closed_urls = tx
        .urls_only_in_live()
        .await
        .map_err(at_step(ReconcileStep::Diff))?;
    let new_urls = tx
        .urls_only_in_temp()
        .await
        .map_err(at_step(ReconcileStep::Diff))?;
    let updated_urls = tx
        .urls_in_both()
        .await
        .map_err(at_step(ReconcileStep::Diff))?;

    let archived = tx
        .archive_and_remove(&closed_urls, closed_at)
        .await
        .map_err(at_step(ReconcileStep::ArchiveClosed))?;
    expect_rows(ReconcileStep::ArchiveClosed, closed_urls.len(), archived)?;

    let new_listings = new_urls
        .iter()
        .map(|url| {
            snapshot
                .get(url)
                .cloned()
                .map(|listing| Listing {
                    keywords: None,
                    ..listing
                })
                .ok_or_else(|| ReconciliationError::MissingFromSnapshot(url.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let inserted = tx
        .insert_new(&new_listings)
        .await
        .map_err(at_step(ReconcileStep::InsertNew))?;
    expect_rows(ReconcileStep::InsertNew, new_listings.len(), inserted)?;

    let updates: Vec<VolatileFields> = updated_urls
        .iter()
        .filter_map(|url| snapshot.get(url).map(Listing::volatile))
        .collect();
    let refreshed = tx
        .update_volatile(&updates)
        .await
        .map_err(at_step(ReconcileStep::UpdateVolatile))?;
    expect_rows(ReconcileStep::UpdateVolatile, updates.len(), refreshed)?;

    let placed: BTreeSet<&String> = new_urls.iter().chain(&updated_urls).collect();
    let retired_urls: Vec<String> = snapshot
        .keys()
        .filter(|url| !placed.contains(url))
        .cloned()
        .collect();
    if !retired_urls.is_empty() {
        warn!(count = retired_urls.len(), "archived urls reappeared in snapshot; kept retired");
    }

    Ok(ReconcileStats {
        snapshot_size: snapshot.len(),
        new: new_listings.len(),
        updated: updates.len(),
        closed: closed_urls.len(),
        new_urls,
        closed_urls,
        retired_urls,
    })
}
