//! Catalog persistence (Live / Temp / Closed) + HTTP fetch utilities.

use std::collections::BTreeMap;

use async_trait::async_trait;
use carlot_core::{ClosedListing, Listing, Snapshot, UnknownSource, VolatileFields};
use chrono::{DateTime, Utc};
use thiserror::Error;

mod http;
mod memory;
mod postgres;

pub use http::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "carlot-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt catalog row: {0}")]
    Corrupt(#[from] UnknownSource),
    #[error("{0}")]
    Message(String),
}

/// One atomic unit of catalog mutation. Nothing is visible to readers until
/// [`CatalogTx::commit`]; dropping the handle without committing discards every change.
#[async_trait]
pub trait CatalogTx: Send {
    /// Truncate `Temp` and bulk insert the snapshot.
    async fn replace_temp(&mut self, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// `urls(Live) - urls(Temp)`.
    async fn urls_only_in_live(&mut self) -> Result<Vec<String>, StoreError>;

    /// `urls(Temp) - urls(Live) - urls(Closed)`. An archived url stays retired.
    async fn urls_only_in_temp(&mut self) -> Result<Vec<String>, StoreError>;

    /// `urls(Temp) ∩ urls(Live)`.
    async fn urls_in_both(&mut self) -> Result<Vec<String>, StoreError>;

    /// Copy the Live rows into `Closed` (existing archive rows win) and delete them
    /// from `Live`. Returns the number of rows removed from `Live`.
    async fn archive_and_remove(
        &mut self,
        urls: &[String],
        closed_at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Insert brand-new Live rows. Keywords are always stored as absent.
    async fn insert_new(&mut self, listings: &[Listing]) -> Result<u64, StoreError>;

    /// Refresh `end_time`, `price` and `scraped_at` of existing Live rows.
    async fn update_volatile(&mut self, updates: &[VolatileFields]) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// The persisted catalog as seen by the sync pipeline and the read API.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn begin(&self) -> Result<Box<dyn CatalogTx>, StoreError>;

    async fn live_listings(&self) -> Result<Vec<Listing>, StoreError>;

    async fn closed_listings(&self) -> Result<Vec<ClosedListing>, StoreError>;

    async fn temp_listings(&self) -> Result<Vec<Listing>, StoreError>;

    /// Up to `limit` Live rows whose keywords are absent, in no particular order.
    async fn select_missing_keywords(&self, limit: usize) -> Result<Vec<Listing>, StoreError>;

    /// Set keywords on Live rows that do not have any yet. Rows that already carry
    /// keywords, or that left `Live` meanwhile, are untouched. Returns rows written.
    async fn update_keywords(&self, keywords: &BTreeMap<String, String>) -> Result<u64, StoreError>;
}

fn non_empty_keywords(keywords: &BTreeMap<String, String>) -> impl Iterator<Item = (&String, &str)> {
    keywords
        .iter()
        .map(|(url, kw)| (url, kw.trim()))
        .filter(|(_, kw)| !kw.is_empty())
}

pub fn has_keywords(listing: &Listing) -> bool {
    listing
        .keywords
        .as_deref()
        .is_some_and(|kw| !kw.trim().is_empty())
}
