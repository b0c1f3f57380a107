//! Postgres-backed catalog. Every reconciliation runs inside one `sqlx` transaction.

use std::collections::BTreeMap;

use async_trait::async_trait;
use carlot_core::{ClosedListing, EndTime, Listing, Snapshot, Source, VolatileFields};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;

use crate::{non_empty_keywords, CatalogStore, CatalogTx, StoreError};

const LISTING_COLUMNS: &str = "url, title, image, end_time, price, year, keywords, scraped_at, source";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("catalog migrations applied");
        Ok(())
    }
}

fn listing_from_row(row: &PgRow) -> Result<Listing, StoreError> {
    let source: String = row.try_get("source")?;
    let end_time: Option<DateTime<Utc>> = row.try_get("end_time")?;
    Ok(Listing {
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        image: row.try_get("image")?,
        end_time: EndTime::from(end_time),
        price: row.try_get("price")?,
        year: row.try_get("year")?,
        keywords: row.try_get("keywords")?,
        scraped_at: row.try_get("scraped_at")?,
        source: source.parse::<Source>()?,
    })
}

fn closed_from_row(row: &PgRow) -> Result<ClosedListing, StoreError> {
    let source: String = row.try_get("source")?;
    Ok(ClosedListing {
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        image: row.try_get("image")?,
        price: row.try_get("price")?,
        year: row.try_get("year")?,
        source: source.parse::<Source>()?,
        closed_at: row.try_get("closed_at")?,
    })
}

/// Column-wise arrays for `UNNEST` bulk inserts.
#[derive(Default)]
struct ListingColumns {
    urls: Vec<String>,
    titles: Vec<String>,
    images: Vec<Option<String>>,
    end_times: Vec<Option<DateTime<Utc>>>,
    prices: Vec<String>,
    years: Vec<Option<i32>>,
    scraped_ats: Vec<DateTime<Utc>>,
    sources: Vec<String>,
}

impl<'a> FromIterator<&'a Listing> for ListingColumns {
    fn from_iter<I: IntoIterator<Item = &'a Listing>>(iter: I) -> Self {
        let mut cols = ListingColumns::default();
        for l in iter {
            cols.urls.push(l.url.clone());
            cols.titles.push(l.title.clone());
            cols.images.push(l.image.clone());
            cols.end_times.push(l.end_time.as_option());
            cols.prices.push(l.price.clone());
            cols.years.push(l.year);
            cols.scraped_ats.push(l.scraped_at);
            cols.sources.push(l.source.id().to_string());
        }
        cols
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl PgTx {
    async fn urls(&mut self, sql: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(sql).fetch_all(&mut *self.tx).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("url").map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl CatalogTx for PgTx {
    async fn replace_temp(&mut self, snapshot: &Snapshot) -> Result<(), StoreError> {
        sqlx::query("TRUNCATE temp_listings")
            .execute(&mut *self.tx)
            .await?;
        if snapshot.is_empty() {
            return Ok(());
        }
        let cols: ListingColumns = snapshot.values().collect();
        sqlx::query(
            r#"
            INSERT INTO temp_listings (url, title, image, end_time, price, year, scraped_at, source)
            SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::timestamptz[],
                                 $5::text[], $6::int4[], $7::timestamptz[], $8::text[])
            "#,
        )
        .bind(&cols.urls)
        .bind(&cols.titles)
        .bind(&cols.images)
        .bind(&cols.end_times)
        .bind(&cols.prices)
        .bind(&cols.years)
        .bind(&cols.scraped_ats)
        .bind(&cols.sources)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn urls_only_in_live(&mut self) -> Result<Vec<String>, StoreError> {
        self.urls(
            r#"
            SELECT l.url
              FROM live_listings l
              LEFT JOIN temp_listings t ON t.url = l.url
             WHERE t.url IS NULL
             ORDER BY l.url
            "#,
        )
        .await
    }

    async fn urls_only_in_temp(&mut self) -> Result<Vec<String>, StoreError> {
        self.urls(
            r#"
            SELECT t.url
              FROM temp_listings t
              LEFT JOIN live_listings l ON l.url = t.url
              LEFT JOIN closed_listings c ON c.url = t.url
             WHERE l.url IS NULL
               AND c.url IS NULL
             ORDER BY t.url
            "#,
        )
        .await
    }

    async fn urls_in_both(&mut self) -> Result<Vec<String>, StoreError> {
        self.urls(
            r#"
            SELECT t.url
              FROM temp_listings t
              JOIN live_listings l ON l.url = t.url
             ORDER BY t.url
            "#,
        )
        .await
    }

    async fn archive_and_remove(
        &mut self,
        urls: &[String],
        closed_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if urls.is_empty() {
            return Ok(0);
        }
        sqlx::query(
            r#"
            INSERT INTO closed_listings (url, title, image, price, year, source, closed_at)
            SELECT url, title, image, price, year, source, $2
              FROM live_listings
             WHERE url = ANY($1)
            ON CONFLICT (url) DO NOTHING
            "#,
        )
        .bind(urls)
        .bind(closed_at)
        .execute(&mut *self.tx)
        .await?;
        let deleted = sqlx::query("DELETE FROM live_listings WHERE url = ANY($1)")
            .bind(urls)
            .execute(&mut *self.tx)
            .await?;
        Ok(deleted.rows_affected())
    }

    async fn insert_new(&mut self, listings: &[Listing]) -> Result<u64, StoreError> {
        if listings.is_empty() {
            return Ok(0);
        }
        let cols: ListingColumns = listings.iter().collect();
        let inserted = sqlx::query(
            r#"
            INSERT INTO live_listings (url, title, image, end_time, price, year, scraped_at, source)
            SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::timestamptz[],
                                 $5::text[], $6::int4[], $7::timestamptz[], $8::text[])
            "#,
        )
        .bind(&cols.urls)
        .bind(&cols.titles)
        .bind(&cols.images)
        .bind(&cols.end_times)
        .bind(&cols.prices)
        .bind(&cols.years)
        .bind(&cols.scraped_ats)
        .bind(&cols.sources)
        .execute(&mut *self.tx)
        .await?;
        Ok(inserted.rows_affected())
    }

    async fn update_volatile(&mut self, updates: &[VolatileFields]) -> Result<u64, StoreError> {
        if updates.is_empty() {
            return Ok(0);
        }
        let urls = updates.iter().map(|u| u.url.clone()).collect::<Vec<_>>();
        let end_times = updates
            .iter()
            .map(|u| u.end_time.as_option())
            .collect::<Vec<_>>();
        let prices = updates.iter().map(|u| u.price.clone()).collect::<Vec<_>>();
        let scraped_ats = updates.iter().map(|u| u.scraped_at).collect::<Vec<_>>();
        let updated = sqlx::query(
            r#"
            UPDATE live_listings l
               SET end_time = u.end_time,
                   price = u.price,
                   scraped_at = u.scraped_at
              FROM UNNEST($1::text[], $2::timestamptz[], $3::text[], $4::timestamptz[])
                   AS u(url, end_time, price, scraped_at)
             WHERE l.url = u.url
            "#,
        )
        .bind(&urls)
        .bind(&end_times)
        .bind(&prices)
        .bind(&scraped_ats)
        .execute(&mut *self.tx)
        .await?;
        Ok(updated.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self) -> Result<Box<dyn CatalogTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn live_listings(&self) -> Result<Vec<Listing>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM live_listings ORDER BY end_time NULLS LAST, url"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn closed_listings(&self) -> Result<Vec<ClosedListing>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT url, title, image, price, year, source, closed_at
              FROM closed_listings
             ORDER BY closed_at DESC, url
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(closed_from_row).collect()
    }

    async fn temp_listings(&self) -> Result<Vec<Listing>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM temp_listings ORDER BY url"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn select_missing_keywords(&self, limit: usize) -> Result<Vec<Listing>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM live_listings \
             WHERE keywords IS NULL OR btrim(keywords) = '' ORDER BY url LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn update_keywords(&self, keywords: &BTreeMap<String, String>) -> Result<u64, StoreError> {
        let (urls, values): (Vec<String>, Vec<String>) = non_empty_keywords(keywords)
            .map(|(url, kw)| (url.clone(), kw.to_string()))
            .unzip();
        if urls.is_empty() {
            return Ok(0);
        }
        let written = sqlx::query(
            r#"
            UPDATE live_listings l
               SET keywords = u.keywords
              FROM UNNEST($1::text[], $2::text[]) AS u(url, keywords)
             WHERE l.url = u.url
               AND (l.keywords IS NULL OR btrim(l.keywords) = '')
            "#,
        )
        .bind(&urls)
        .bind(&values)
        .execute(&self.pool)
        .await?;
        Ok(written.rows_affected())
    }
}
