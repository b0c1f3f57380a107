//! Cycle driver: fan out to sources, gate, reconcile the catalog, drain the keyword backlog.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use carlot_adapters::{
    source_adapter_for, AdapterContext, AdapterMode, DetailPageKeywordAdapter, EnrichmentAdapter,
    FixtureKeywordAdapter,
};
use carlot_storage::{CatalogStore, HttpClientConfig, HttpFetcher, MemoryStore, PgStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod enrich;
mod orchestrator;
mod reconcile;
mod report;
mod scheduler;

pub use config::{default_min_listings, SourceConfig, SourceRegistry, SyncConfig};
pub use enrich::{DrainError, DrainStats, EnrichmentDrainer, KeywordRouter};
pub use orchestrator::{
    merge, GateFailure, MergedSnapshot, Orchestrator, SourceOutcome, SourceReport, UrlCollision,
};
pub use reconcile::{ReconcileStats, ReconcileStep, ReconciliationEngine, ReconciliationError};
pub use report::{render_summary, write_cycle_report};
pub use scheduler::CycleScheduler;

pub const CRATE_NAME: &str = "carlot-sync";

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("cycle skipped: {0}")]
    Skipped(#[from] GateFailure),
    #[error("cycle failed: {0}")]
    Reconciliation(#[from] ReconciliationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Running,
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub backend: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: CycleStatus,
    pub error: Option<String>,
    pub sources: Vec<SourceReport>,
    pub collisions: Vec<UrlCollision>,
    pub reconcile: Option<ReconcileStats>,
    pub drain: Option<DrainStats>,
    pub drain_error: Option<String>,
}

impl CycleReport {
    fn begin(cycle_id: Uuid, backend: &str) -> Self {
        Self {
            cycle_id,
            backend: backend.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: CycleStatus::Running,
            error: None,
            sources: Vec::new(),
            collisions: Vec::new(),
            reconcile: None,
            drain: None,
            drain_error: None,
        }
    }
}

pub struct SyncPipeline {
    orchestrator: Orchestrator,
    store: Arc<dyn CatalogStore>,
    reconciler: ReconciliationEngine,
    drainer: EnrichmentDrainer,
    enrich_batch_size: usize,
    reports_root: Option<PathBuf>,
}

impl SyncPipeline {
    pub fn new(
        orchestrator: Orchestrator,
        store: Arc<dyn CatalogStore>,
        enrichment: Arc<dyn EnrichmentAdapter>,
    ) -> Self {
        Self {
            orchestrator,
            reconciler: ReconciliationEngine::new(Arc::clone(&store)),
            drainer: EnrichmentDrainer::new(Arc::clone(&store), enrichment),
            store,
            enrich_batch_size: 100,
            reports_root: None,
        }
    }

    pub fn with_enrich_batch_size(mut self, batch_size: usize) -> Self {
        self.enrich_batch_size = batch_size;
        self
    }

    pub fn with_reports_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.reports_root = Some(root.into());
        self
    }

    /// Wire adapters for every enabled source in the registry named by `config`.
    pub fn from_config(config: &SyncConfig, store: Arc<dyn CatalogStore>) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_file)?;
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
            per_source_rpm: config.requests_per_minute,
            ..Default::default()
        })?);
        let fixtures_root = config.fixtures_root();

        let mut orchestrator = Orchestrator::new(config.fetch_timeout);
        for entry in registry.enabled() {
            let adapter = source_adapter_for(
                entry.source,
                entry.mode,
                &fixtures_root,
                &entry.listing_urls,
                &http,
            );
            info!(
                source = %entry.source,
                name = entry.display_name(),
                mode = ?entry.mode,
                minimum = entry.min_listings(),
                "source registered"
            );
            orchestrator = orchestrator.register(adapter, entry.min_listings());
        }

        // Disabled sources keep a route so rows they left in Live can still be enriched.
        let fixture_keywords: Arc<dyn EnrichmentAdapter> =
            Arc::new(FixtureKeywordAdapter::new(fixtures_root.clone()));
        let detail_keywords: Arc<dyn EnrichmentAdapter> =
            Arc::new(DetailPageKeywordAdapter::new(Arc::clone(&http)));
        let mut router = KeywordRouter::default();
        for entry in &registry.sources {
            let adapter = match entry.mode {
                AdapterMode::Fixture => Arc::clone(&fixture_keywords),
                AdapterMode::Http => Arc::clone(&detail_keywords),
            };
            router = router.route(entry.source, adapter);
        }

        let mut pipeline = Self::new(orchestrator, store, Arc::new(router))
            .with_enrich_batch_size(config.enrich_batch_size);
        if config.write_reports {
            pipeline = pipeline.with_reports_root(config.reports_root());
        }
        Ok(pipeline)
    }

    /// Orchestrate, then reconcile and drain only when every source passed the gate.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let ctx = AdapterContext::new(Uuid::new_v4());
        let mut report = CycleReport::begin(ctx.cycle_id, self.store.backend());
        let span = info_span!("cycle", cycle_id = %ctx.cycle_id);
        let result = self.execute(&ctx, &mut report).instrument(span).await;

        report.finished_at = Some(Utc::now());
        match &result {
            Ok(()) => report.status = CycleStatus::Completed,
            Err(err) => {
                report.status = match err {
                    CycleError::Skipped(_) => CycleStatus::Skipped,
                    CycleError::Reconciliation(_) => CycleStatus::Failed,
                };
                report.error = Some(err.to_string());
            }
        }

        if let Some(root) = &self.reports_root {
            if let Err(err) = write_cycle_report(root, &report).await {
                warn!(cycle_id = %report.cycle_id, error = %err, "writing cycle report failed");
            }
        }
        result.map(|()| report)
    }

    async fn execute(&self, ctx: &AdapterContext, report: &mut CycleReport) -> Result<(), CycleError> {
        let merged = match self.orchestrator.run_cycle(ctx).await {
            Ok(merged) => merged,
            Err(gate) => {
                report.sources = gate.sources.clone();
                return Err(gate.into());
            }
        };
        report.sources = merged.sources;
        report.collisions = merged.collisions;
        info!(listings = merged.listings.len(), "validation gate passed");

        report.reconcile = Some(self.reconciler.reconcile(&merged.listings, Utc::now()).await?);

        // The catalog is already committed; a backlog failure is retried next cycle.
        match self.drainer.drain(ctx, self.enrich_batch_size).await {
            Ok(stats) => report.drain = Some(stats),
            Err(err) => {
                warn!(error = %err, "keyword drain failed");
                report.drain_error = Some(err.to_string());
            }
        }
        Ok(())
    }
}

/// Postgres when `DATABASE_URL` is set (migrations applied), otherwise a process-local store.
pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn CatalogStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await.context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; catalog is held in memory and lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
