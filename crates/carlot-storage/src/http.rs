//! Rate-limited HTTP fetching shared by the listing and detail-page adapters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use carlot_core::Source;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    /// Requests per minute to any one site; zero disables pacing.
    pub per_source_rpm: u32,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 1,
            per_source_rpm: 0,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Hands out evenly spaced request slots for one site.
#[derive(Debug)]
struct Pacer {
    spacing: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl Pacer {
    fn per_minute(rpm: u32) -> Option<Self> {
        (rpm > 0).then(|| Self {
            spacing: Duration::from_secs(60) / rpm,
            next_slot: Mutex::new(None),
        })
    }

    async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next.map_or(now, |n| n.max(now));
            *next = Some(slot + self.spacing);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[derive(Debug)]
struct SourceLane {
    in_flight: Arc<Semaphore>,
    pacer: Option<Arc<Pacer>>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_concurrency: usize,
    per_source_rpm: u32,
    lanes: Mutex<HashMap<Source, Arc<SourceLane>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_concurrency: config.per_source_concurrency.max(1),
            per_source_rpm: config.per_source_rpm,
            lanes: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn lane(&self, source: Source) -> Arc<SourceLane> {
        let mut lanes = self.lanes.lock().await;
        lanes
            .entry(source)
            .or_insert_with(|| {
                Arc::new(SourceLane {
                    in_flight: Arc::new(Semaphore::new(self.per_source_concurrency)),
                    pacer: Pacer::per_minute(self.per_source_rpm).map(Arc::new),
                })
            })
            .clone()
    }

    /// GET a page body as text, retrying transient failures with capped exponential backoff.
    pub async fn fetch_page(
        &self,
        cycle_id: Uuid,
        source: Source,
        url: &str,
    ) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", %cycle_id, %source, url);
        self.fetch_page_inner(source, url).instrument(span).await
    }

    async fn fetch_page_inner(&self, source: Source, url: &str) -> Result<String, FetchError> {
        let lane = self.lane(source).await;
        let _in_flight = lane.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut attempt = 0;
        loop {
            // Pace before taking a global slot.
            if let Some(pacer) = &lane.pacer {
                pacer.wait_turn().await;
            }
            let _global = self
                .global_limit
                .acquire()
                .await
                .map_err(|_| FetchError::Closed)?;
            match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp.text().await?),
                Ok(resp) => {
                    let status = resp.status();
                    if !is_transient_status(status) || attempt >= self.backoff.max_retries {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    debug!(status = status.as_u16(), attempt, "retrying after http status");
                }
                Err(err) => {
                    if !is_transient_error(&err) || attempt >= self.backoff.max_retries {
                        return Err(FetchError::Request(err));
                    }
                    debug!(error = %err, attempt, "retrying after request error");
                }
            }

            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}
