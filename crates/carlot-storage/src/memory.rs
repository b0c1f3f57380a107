//! In-process catalog used when no database is configured, and by the test suites.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use carlot_core::{ClosedListing, Listing, Snapshot, VolatileFields};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{has_keywords, non_empty_keywords, CatalogStore, CatalogTx, StoreError};

#[derive(Debug, Clone, Default)]
struct CatalogState {
    live: BTreeMap<String, Listing>,
    temp: Snapshot,
    closed: BTreeMap<String, ClosedListing>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<CatalogState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose `Live` collection starts with the given rows.
    pub fn with_live(listings: impl IntoIterator<Item = Listing>) -> Self {
        let live = listings
            .into_iter()
            .map(|l| (l.url.clone(), l))
            .collect::<BTreeMap<_, _>>();
        Self {
            state: Arc::new(Mutex::new(CatalogState {
                live,
                ..Default::default()
            })),
        }
    }
}

/// Copy-on-write transaction: mutations go to a private working set that replaces the
/// shared state on commit. The lock is held for the whole transaction, so a second
/// writer waits instead of interleaving.
struct MemoryTx {
    guard: OwnedMutexGuard<CatalogState>,
    working: CatalogState,
}

#[async_trait]
impl CatalogTx for MemoryTx {
    async fn replace_temp(&mut self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.working.temp = snapshot.clone();
        Ok(())
    }

    async fn urls_only_in_live(&mut self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .working
            .live
            .keys()
            .filter(|url| !self.working.temp.contains_key(*url))
            .cloned()
            .collect())
    }

    async fn urls_only_in_temp(&mut self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .working
            .temp
            .keys()
            .filter(|url| {
                !self.working.live.contains_key(*url) && !self.working.closed.contains_key(*url)
            })
            .cloned()
            .collect())
    }

    async fn urls_in_both(&mut self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .working
            .temp
            .keys()
            .filter(|url| self.working.live.contains_key(*url))
            .cloned()
            .collect())
    }

    async fn archive_and_remove(
        &mut self,
        urls: &[String],
        closed_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut removed = 0;
        for url in urls {
            let Some(listing) = self.working.live.remove(url) else {
                continue;
            };
            self.working
                .closed
                .entry(url.clone())
                .or_insert_with(|| listing.close(closed_at));
            removed += 1;
        }
        Ok(removed)
    }

    async fn insert_new(&mut self, listings: &[Listing]) -> Result<u64, StoreError> {
        let mut inserted = 0;
        for listing in listings {
            if self.working.live.contains_key(&listing.url) {
                return Err(StoreError::Message(format!(
                    "duplicate live listing {}",
                    listing.url
                )));
            }
            let mut row = listing.clone();
            row.keywords = None;
            self.working.live.insert(row.url.clone(), row);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn update_volatile(&mut self, updates: &[VolatileFields]) -> Result<u64, StoreError> {
        let mut updated = 0;
        for update in updates {
            if let Some(row) = self.working.live.get_mut(&update.url) {
                row.end_time = update.end_time;
                row.price = update.price.clone();
                row.scraped_at = update.scraped_at;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> Result<Box<dyn CatalogTx>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }

    async fn live_listings(&self) -> Result<Vec<Listing>, StoreError> {
        Ok(self.state.lock().await.live.values().cloned().collect())
    }

    async fn closed_listings(&self) -> Result<Vec<ClosedListing>, StoreError> {
        Ok(self.state.lock().await.closed.values().cloned().collect())
    }

    async fn temp_listings(&self) -> Result<Vec<Listing>, StoreError> {
        Ok(self.state.lock().await.temp.values().cloned().collect())
    }

    async fn select_missing_keywords(&self, limit: usize) -> Result<Vec<Listing>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .live
            .values()
            .filter(|l| !has_keywords(l))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_keywords(&self, keywords: &BTreeMap<String, String>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut written = 0;
        for (url, kw) in non_empty_keywords(keywords) {
            if let Some(row) = state.live.get_mut(url) {
                if !has_keywords(row) {
                    row.keywords = Some(kw.to_string());
                    written += 1;
                }
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carlot_core::{EndTime, Source};
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn listing(url: &str) -> Listing {
        Listing::observed(
            Source::BringATrailer,
            url,
            "1995 Porsche 993 Carrera",
            None,
            EndTime::At(at(20)),
            "$90,000",
            at(8),
        )
    }

    #[tokio::test]
    async fn uncommitted_transaction_is_discarded() {
        let store = MemoryStore::with_live([listing("a")]);
        let mut tx = store.begin().await.unwrap();
        tx.archive_and_remove(&["a".to_string()], at(9)).await.unwrap();
        tx.insert_new(&[listing("b")]).await.unwrap();
        drop(tx);

        let live = store.live_listings().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].url, "a");
        assert!(store.closed_listings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn archive_keeps_first_closed_row() {
        let store = MemoryStore::with_live([listing("a")]);
        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.archive_and_remove(&["a".to_string()], at(9)).await.unwrap(), 1);
        tx.insert_new(&[listing("a")]).await.unwrap();
        assert_eq!(tx.archive_and_remove(&["a".to_string()], at(10)).await.unwrap(), 1);
        tx.commit().await.unwrap();

        let closed = store.closed_listings().await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].closed_at, at(9));
        assert!(store.live_listings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn archived_urls_are_never_new_again() {
        let store = MemoryStore::with_live([listing("a")]);
        let mut tx = store.begin().await.unwrap();
        tx.archive_and_remove(&["a".to_string()], at(9)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let snapshot: Snapshot = [listing("a"), listing("b")]
            .into_iter()
            .map(|l| (l.url.clone(), l))
            .collect();
        tx.replace_temp(&snapshot).await.unwrap();
        assert_eq!(tx.urls_only_in_temp().await.unwrap(), vec!["b".to_string()]);
        assert!(tx.urls_in_both().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_queries_follow_temp_and_live() {
        let store = MemoryStore::with_live([listing("a"), listing("b")]);
        let mut tx = store.begin().await.unwrap();
        let snapshot: Snapshot = [listing("b"), listing("c")]
            .into_iter()
            .map(|l| (l.url.clone(), l))
            .collect();
        tx.replace_temp(&snapshot).await.unwrap();

        assert_eq!(tx.urls_only_in_live().await.unwrap(), vec!["a".to_string()]);
        assert_eq!(tx.urls_only_in_temp().await.unwrap(), vec!["c".to_string()]);
        assert_eq!(tx.urls_in_both().await.unwrap(), vec!["b".to_string()]);
        tx.rollback().await.unwrap();
        assert!(store.temp_listings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keywords_are_written_once() {
        let store = MemoryStore::with_live([listing("a"), listing("b")]);
        let first = BTreeMap::from([
            ("a".to_string(), "Porsche 993".to_string()),
            ("b".to_string(), "   ".to_string()),
            ("gone".to_string(), "Ferrari".to_string()),
        ]);
        assert_eq!(store.update_keywords(&first).await.unwrap(), 1);

        let second = BTreeMap::from([("a".to_string(), "overwritten".to_string())]);
        assert_eq!(store.update_keywords(&second).await.unwrap(), 0);

        let missing = store.select_missing_keywords(10).await.unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].url, "b");
        let live = store.live_listings().await.unwrap();
        assert_eq!(live[0].keywords.as_deref(), Some("Porsche 993"));
    }
}
