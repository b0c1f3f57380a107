use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::{CycleError, CycleReport, SyncPipeline};

/// Single-flight periodic driver around a [`SyncPipeline`].
#[derive(Clone)]
pub struct CycleScheduler {
    pipeline: Arc<SyncPipeline>,
    interval: Duration,
    in_flight: Arc<Mutex<()>>,
}

impl CycleScheduler {
    pub fn new(pipeline: Arc<SyncPipeline>, interval: Duration) -> Self {
        Self {
            pipeline,
            interval,
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    /// Run one cycle unless another is still in progress. `None` means the tick was skipped.
    pub async fn run_guarded(&self) -> Option<Result<CycleReport, CycleError>> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!("previous cycle still running; skipping tick");
            return None;
        };
        let result = self.pipeline.run_cycle().await;
        match &result {
            Ok(report) => {
                let (new, updated, closed) = report
                    .reconcile
                    .as_ref()
                    .map(|s| (s.new, s.updated, s.closed))
                    .unwrap_or_default();
                info!(cycle_id = %report.cycle_id, new, updated, closed, "cycle completed");
            }
            Err(err @ CycleError::Skipped(_)) => warn!(error = %err, "cycle skipped; catalog untouched"),
            Err(err @ CycleError::Reconciliation(_)) => error!(error = %err, "cycle failed"),
        }
        Some(result)
    }

    pub async fn build(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let this = self.clone();
        let job = Job::new_repeated_async(self.interval, move |_uuid, _l| {
            let this = this.clone();
            Box::pin(async move {
                this.run_guarded().await;
            })
        })
        .with_context(|| format!("creating cycle job every {:?}", self.interval))?;
        sched.add(job).await.context("adding cycle job")?;
        Ok(sched)
    }

    /// Run immediately, then on every interval until Ctrl-C.
    pub async fn run_until_shutdown(&self) -> Result<()> {
        info!(interval_secs = self.interval.as_secs(), "scheduler starting");
        self.run_guarded().await;

        let mut sched = self.build().await?;
        sched.start().await.context("starting scheduler")?;
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        info!("shutdown requested");
        sched.shutdown().await.context("stopping scheduler")?;
        Ok(())
    }
}
