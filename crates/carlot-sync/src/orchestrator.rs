use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use carlot_adapters::{AdapterContext, AdapterError, SourceAdapter};
use carlot_core::{Listing, Snapshot, Source};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Fetched { count: usize },
    Failed { error: String },
    TimedOut { after_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub source: Source,
    pub min_listings: usize,
    pub elapsed_ms: u64,
    #[serde(flatten)]
    pub outcome: SourceOutcome,
}

impl SourceReport {
    pub fn count(&self) -> usize {
        match self.outcome {
            SourceOutcome::Fetched { count } => count,
            _ => 0,
        }
    }

    pub fn passes_gate(&self) -> bool {
        matches!(self.outcome, SourceOutcome::Fetched { count } if count > 0 && count >= self.min_listings)
    }
}

impl fmt::Display for SourceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            SourceOutcome::Fetched { count } => {
                write!(f, "{}: {count} listings (min {})", self.source, self.min_listings)
            }
            SourceOutcome::Failed { error } => write!(f, "{}: failed ({error})", self.source),
            SourceOutcome::TimedOut { after_secs } => {
                write!(f, "{}: timed out after {after_secs}s", self.source)
            }
        }
    }
}

/// Two listings in one cycle claimed the same url; the earlier one was kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrlCollision {
    pub url: String,
    pub kept: Source,
    pub dropped: Source,
}

/// Every source that ran this cycle, with the ones that failed the gate listed in `failed`.
#[derive(Debug, Clone, Error, Serialize)]
#[error("validation gate failed for {}", describe_failed(.failed))]
pub struct GateFailure {
    pub failed: Vec<Source>,
    pub sources: Vec<SourceReport>,
}

fn describe_failed(failed: &[Source]) -> String {
    if failed.is_empty() {
        return "an empty source registry".to_string();
    }
    failed.iter().map(|s| s.id()).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Clone)]
pub struct MergedSnapshot {
    pub listings: Snapshot,
    pub sources: Vec<SourceReport>,
    pub collisions: Vec<UrlCollision>,
}

struct SourceSlot {
    adapter: Arc<dyn SourceAdapter>,
    min_listings: usize,
}

/// Fans out to every registered source and gates the merged result.
pub struct Orchestrator {
    slots: Vec<SourceSlot>,
    fetch_timeout: Duration,
}

impl Orchestrator {
    pub fn new(fetch_timeout: Duration) -> Self {
        Self {
            slots: Vec::new(),
            fetch_timeout,
        }
    }

    /// Registration order decides which listing wins a url collision.
    pub fn register(mut self, adapter: Arc<dyn SourceAdapter>, min_listings: usize) -> Self {
        self.slots.push(SourceSlot {
            adapter,
            min_listings: min_listings.max(1),
        });
        self
    }

    pub async fn run_cycle(&self, ctx: &AdapterContext) -> Result<MergedSnapshot, GateFailure> {
        if self.slots.is_empty() {
            warn!(cycle_id = %ctx.cycle_id, "no sources registered; refusing to produce an empty snapshot");
            return Err(GateFailure {
                failed: Vec::new(),
                sources: Vec::new(),
            });
        }

        let mut handles = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let adapter = Arc::clone(&slot.adapter);
            let source = adapter.source();
            let ctx = ctx.clone();
            let timeout = self.fetch_timeout;
            let span = info_span!("source_fetch", cycle_id = %ctx.cycle_id, %source);
            let handle = tokio::spawn(
                async move {
                    let started = Instant::now();
                    let result = tokio::time::timeout(timeout, adapter.fetch_snapshot(&ctx)).await;
                    (result, started.elapsed())
                }
                .instrument(span),
            );
            handles.push((source, slot.min_listings, handle));
        }

        let mut reports = Vec::with_capacity(handles.len());
        let mut fetched: Vec<Vec<Listing>> = Vec::new();
        for (source, min_listings, handle) in handles {
            let (outcome, elapsed) = match handle.await {
                Ok((Ok(Ok(listings)), elapsed)) => {
                    let count = listings.len();
                    fetched.push(listings);
                    (SourceOutcome::Fetched { count }, elapsed)
                }
                Ok((Ok(Err(err)), elapsed)) => (failed(source, &err), elapsed),
                Ok((Err(_), elapsed)) => (
                    SourceOutcome::TimedOut {
                        after_secs: self.fetch_timeout.as_secs(),
                    },
                    elapsed,
                ),
                Err(join_err) => (
                    SourceOutcome::Failed {
                        error: format!("fetch task aborted: {join_err}"),
                    },
                    Duration::ZERO,
                ),
            };
            let report = SourceReport {
                source,
                min_listings,
                elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                outcome,
            };
            if report.passes_gate() {
                info!(cycle_id = %ctx.cycle_id, %report, "source snapshot accepted");
            } else {
                warn!(cycle_id = %ctx.cycle_id, %report, "source snapshot rejected");
            }
            reports.push(report);
        }

        let failed_sources: Vec<Source> = reports
            .iter()
            .filter(|r| !r.passes_gate())
            .map(|r| r.source)
            .collect();
        if !failed_sources.is_empty() {
            return Err(GateFailure {
                failed: failed_sources,
                sources: reports,
            });
        }

        let (listings, collisions) = merge(fetched);
        if !collisions.is_empty() {
            warn!(
                cycle_id = %ctx.cycle_id,
                collisions = collisions.len(),
                "duplicate listing urls in snapshot; kept first occurrence"
            );
        }
        Ok(MergedSnapshot {
            listings,
            sources: reports,
            collisions,
        })
    }
}

fn failed(source: Source, err: &AdapterError) -> SourceOutcome {
    warn!(%source, error = %err, "source adapter failed");
    SourceOutcome::Failed {
        error: err.to_string(),
    }
}

/// Union the per-source lists keyed by url. The first listing seen for a url wins.
pub fn merge(fetched: Vec<Vec<Listing>>) -> (Snapshot, Vec<UrlCollision>) {
    let mut merged = Snapshot::new();
    let mut collisions = Vec::new();
    for listings in fetched {
        for listing in listings {
            if let Some(kept) = merged.get(&listing.url) {
                collisions.push(UrlCollision {
                    url: listing.url.clone(),
                    kept: kept.source,
                    dropped: listing.source,
                });
                continue;
            }
            merged.insert(listing.url.clone(), listing);
        }
    }
    (merged, collisions)
}
