use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use carlot_adapters::{AdapterContext, AdapterError, EnrichmentAdapter};
use carlot_core::Source;
use carlot_storage::{CatalogStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("selecting listings without keywords: {0}")]
    Select(#[source] StoreError),
    #[error("writing keywords: {0}")]
    Write(#[source] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainStats {
    pub attempted: usize,
    pub enriched: usize,
    pub failed: usize,
    pub written: u64,
}

/// Fills in keywords for a bounded slice of the backlog, one listing at a time.
#[derive(Clone)]
pub struct EnrichmentDrainer {
    store: Arc<dyn CatalogStore>,
    adapter: Arc<dyn EnrichmentAdapter>,
}

impl EnrichmentDrainer {
    pub fn new(store: Arc<dyn CatalogStore>, adapter: Arc<dyn EnrichmentAdapter>) -> Self {
        Self { store, adapter }
    }

    pub async fn drain(&self, ctx: &AdapterContext, batch_size: usize) -> Result<DrainStats, DrainError> {
        let mut stats = DrainStats::default();
        if batch_size == 0 {
            return Ok(stats);
        }

        let backlog = self
            .store
            .select_missing_keywords(batch_size)
            .await
            .map_err(DrainError::Select)?;

        let mut found = BTreeMap::new();
        for listing in backlog {
            stats.attempted += 1;
            match self
                .adapter
                .fetch_keywords(ctx, listing.source, &listing.url, &listing.title)
                .await
            {
                Ok(keywords) if !keywords.trim().is_empty() => {
                    found.insert(listing.url, keywords.trim().to_string());
                }
                Ok(_) => {
                    stats.failed += 1;
                    warn!(url = %listing.url, "enrichment returned no keywords; will retry next cycle");
                }
                Err(err) => {
                    stats.failed += 1;
                    warn!(url = %listing.url, error = %err, "enrichment failed; will retry next cycle");
                }
            }
        }
        stats.enriched = found.len();

        if !found.is_empty() {
            stats.written = self
                .store
                .update_keywords(&found)
                .await
                .map_err(DrainError::Write)?;
        }
        if stats.attempted > 0 {
            info!(
                attempted = stats.attempted,
                enriched = stats.enriched,
                failed = stats.failed,
                "keyword backlog drained"
            );
        } else {
            debug!("keyword backlog empty");
        }
        Ok(stats)
    }
}

/// Sends each listing to the enrichment adapter configured for its source.
#[derive(Clone, Default)]
pub struct KeywordRouter {
    routes: BTreeMap<Source, Arc<dyn EnrichmentAdapter>>,
}

impl KeywordRouter {
    pub fn route(mut self, source: Source, adapter: Arc<dyn EnrichmentAdapter>) -> Self {
        self.routes.insert(source, adapter);
        self
    }
}

#[async_trait]
impl EnrichmentAdapter for KeywordRouter {
    async fn fetch_keywords(
        &self,
        ctx: &AdapterContext,
        source: Source,
        url: &str,
        title: &str,
    ) -> Result<String, AdapterError> {
        let adapter = self
            .routes
            .get(&source)
            .ok_or_else(|| AdapterError::Message(format!("no enrichment adapter for {source}")))?;
        adapter.fetch_keywords(ctx, source, url, title).await
    }
}
