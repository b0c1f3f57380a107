//! Read-only JSON API over the live and closed catalog.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use carlot_core::{ClosedListing, Listing, Source};
use carlot_storage::{has_keywords, CatalogStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "carlot-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CatalogStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ListingsQuery {
    source: Option<String>,
    year_min: Option<i32>,
    year_max: Option<i32>,
    q: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Serialize)]
struct Page<T> {
    page: usize,
    per_page: usize,
    total: usize,
    total_pages: usize,
    items: Vec<T>,
}

#[derive(Debug, Serialize)]
struct CatalogStats {
    backend: &'static str,
    live: BTreeMap<Source, usize>,
    closed: BTreeMap<Source, usize>,
    total_live: usize,
    total_closed: usize,
    keyword_backlog: usize,
}

enum ApiError {
    BadRequest(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Store(err) => {
                error!(error = %err, "catalog read failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "catalog unavailable".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/listings", get(listings_handler))
        .route("/listings/closed", get(closed_handler))
        .route("/listings/stats", get(stats_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(store: Arc<dyn CatalogStore>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, backend = store.backend(), "read api listening");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

pub fn port_from_env() -> u16 {
    std::env::var("CARLOT_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "backend": state.store.backend() }))
}

async fn listings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingsQuery>,
) -> Result<Json<Page<Listing>>, ApiError> {
    let source = parse_source(query.source.as_deref())?;
    let needle = query
        .q
        .as_deref()
        .map(|q| q.trim().to_lowercase())
        .filter(|q| !q.is_empty());

    let rows = state
        .store
        .live_listings()
        .await?
        .into_iter()
        .filter(|l| source.map_or(true, |s| l.source == s))
        .filter(|l| query.year_min.map_or(true, |min| l.year.is_some_and(|y| y >= min)))
        .filter(|l| query.year_max.map_or(true, |max| l.year.is_some_and(|y| y <= max)))
        .filter(|l| needle.as_deref().map_or(true, |n| matches_text(l, n)))
        .collect();
    Ok(Json(paginate(rows, query.page, query.per_page)))
}

async fn closed_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingsQuery>,
) -> Result<Json<Page<ClosedListing>>, ApiError> {
    let source = parse_source(query.source.as_deref())?;
    let rows = state
        .store
        .closed_listings()
        .await?
        .into_iter()
        .filter(|l| source.map_or(true, |s| l.source == s))
        .collect();
    Ok(Json(paginate(rows, query.page, query.per_page)))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Result<Json<CatalogStats>, ApiError> {
    let live = state.store.live_listings().await?;
    let closed = state.store.closed_listings().await?;

    let mut live_counts = BTreeMap::<Source, usize>::new();
    for listing in &live {
        *live_counts.entry(listing.source).or_default() += 1;
    }
    let mut closed_counts = BTreeMap::<Source, usize>::new();
    for listing in &closed {
        *closed_counts.entry(listing.source).or_default() += 1;
    }
    Ok(Json(CatalogStats {
        backend: state.store.backend(),
        total_live: live.len(),
        total_closed: closed.len(),
        keyword_backlog: live.iter().filter(|l| !has_keywords(l)).count(),
        live: live_counts,
        closed: closed_counts,
    }))
}

fn parse_source(raw: Option<&str>) -> Result<Option<Source>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(id) => id
            .parse::<Source>()
            .map(Some)
            .map_err(|err| ApiError::BadRequest(err.to_string())),
    }
}

fn matches_text(listing: &Listing, needle: &str) -> bool {
    listing.title.to_lowercase().contains(needle)
        || listing
            .keywords
            .as_deref()
            .is_some_and(|k| k.to_lowercase().contains(needle))
}

fn paginate<T>(rows: Vec<T>, page: Option<usize>, per_page: Option<usize>) -> Page<T> {
    let per_page = per_page.unwrap_or(50).clamp(1, 500);
    let total = rows.len();
    let total_pages = total.max(1).div_ceil(per_page);
    let page = page.unwrap_or(1).clamp(1, total_pages);
    let items = rows
        .into_iter()
        .skip((page - 1) * per_page)
        .take(per_page)
        .collect();
    Page {
        page,
        per_page,
        total,
        total_pages,
        items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use carlot_core::EndTime;
    use carlot_storage::MemoryStore;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    fn listing(source: Source, url: &str, title: &str, keywords: Option<&str>) -> Listing {
        let mut listing =
            Listing::observed(source, url, title, None, EndTime::Open, "$10,000", Utc::now());
        listing.keywords = keywords.map(str::to_string);
        listing
    }

    fn test_app() -> Router {
        let store = MemoryStore::with_live([
            listing(Source::BringATrailer, "https://b/1", "1967 Ford Mustang Fastback", Some("ford mustang")),
            listing(Source::BringATrailer, "https://b/2", "2008 Porsche Cayman S", None),
            listing(Source::CarsAndBids, "https://c/1", "2015 BMW M3 Sedan", Some("bmw m3 f80")),
        ]);
        app(AppState::new(Arc::new(store)))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn healthz_reports_backend() {
        let (status, body) = get_json(test_app(), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backend"], "memory");
    }

    #[tokio::test]
    async fn listings_filter_by_source_year_and_text() {
        let (status, body) = get_json(test_app(), "/listings?source=bat").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);

        let (_, body) = get_json(test_app(), "/listings?year_min=2000&year_max=2010").await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["items"][0]["url"], "https://b/2");

        let (_, body) = get_json(test_app(), "/listings?q=F80").await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["items"][0]["title"], "C&B: 2015 BMW M3 Sedan");
    }

    #[tokio::test]
    async fn listings_paginate() {
        let (_, body) = get_json(test_app(), "/listings?per_page=2&page=2").await;
        assert_eq!(body["total"], 3);
        assert_eq!(body["total_pages"], 2);
        assert_eq!(body["items"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_source_is_a_bad_request() {
        let (status, body) = get_json(test_app(), "/listings?source=ebay").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("ebay"));
    }

    #[tokio::test]
    async fn stats_count_sources_and_backlog() {
        let (status, body) = get_json(test_app(), "/listings/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["live"]["bat"], 2);
        assert_eq!(body["live"]["cab"], 1);
        assert_eq!(body["keyword_backlog"], 1);
        assert_eq!(body["total_closed"], 0);
    }

    #[tokio::test]
    async fn closed_listings_start_empty() {
        let (status, body) = get_json(test_app(), "/listings/closed").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 0);
        assert_eq!(body["page"], 1);
    }
}
