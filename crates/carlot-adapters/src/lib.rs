//! Source + enrichment adapter contracts, fixture-first and HTML implementations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use carlot_core::{EndTime, Listing, Source};
use carlot_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, TimeDelta, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "carlot-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterMode {
    Fixture,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub cycle_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(cycle_id: Uuid) -> Self {
        Self {
            cycle_id,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{site} page did not parse: {detail}")]
    Parse { site: Source, detail: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Runs concurrently with the other sources under the orchestrator's timeout.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    async fn fetch_snapshot(&self, ctx: &AdapterContext) -> Result<Vec<Listing>, AdapterError>;
}

#[async_trait]
pub trait EnrichmentAdapter: Send + Sync {
    async fn fetch_keywords(
        &self,
        ctx: &AdapterContext,
        source: Source,
        url: &str,
        title: &str,
    ) -> Result<String, AdapterError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureSnapshot {
    pub source: Source,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub listings: Vec<FixtureListing>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureListing {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub price: String,
}

async fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T, AdapterError> {
    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AdapterError::Message(format!("reading {}: {e}", path.display())))?;
    serde_json::from_str(&data)
        .map_err(|e| AdapterError::Message(format!("parsing {}: {e}", path.display())))
}

pub async fn load_fixture_snapshot(path: impl AsRef<Path>) -> Result<FixtureSnapshot, AdapterError> {
    read_json_file(path.as_ref()).await
}

pub fn fixture_snapshot_path(fixtures_root: &Path, source: Source) -> PathBuf {
    fixtures_root.join(source.id()).join("snapshot.json")
}

pub fn fixture_keywords_path(fixtures_root: &Path, source: Source) -> PathBuf {
    fixtures_root.join(source.id()).join("keywords.json")
}

/// Replays a captured snapshot, stamping every listing with the current observation time.
#[derive(Debug, Clone)]
pub struct FixtureSourceAdapter {
    source: Source,
    path: PathBuf,
}

impl FixtureSourceAdapter {
    pub fn new(source: Source, fixtures_root: &Path) -> Self {
        Self {
            source,
            path: fixture_snapshot_path(fixtures_root, source),
        }
    }
}

#[async_trait]
impl SourceAdapter for FixtureSourceAdapter {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch_snapshot(&self, ctx: &AdapterContext) -> Result<Vec<Listing>, AdapterError> {
        let snapshot = load_fixture_snapshot(&self.path).await?;
        if snapshot.source != self.source {
            return Err(AdapterError::Message(format!(
                "{} holds a {} snapshot, expected {}",
                self.path.display(),
                snapshot.source,
                self.source
            )));
        }
        Ok(snapshot
            .listings
            .into_iter()
            .filter(|l| !l.url.trim().is_empty() && !l.title.trim().is_empty())
            .map(|l| {
                Listing::observed(
                    self.source,
                    l.url,
                    &l.title,
                    l.image,
                    EndTime::from(l.end_time),
                    l.price,
                    ctx.fetched_at,
                )
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct FixtureKeywordAdapter {
    fixtures_root: PathBuf,
}

impl FixtureKeywordAdapter {
    pub fn new(fixtures_root: impl Into<PathBuf>) -> Self {
        Self {
            fixtures_root: fixtures_root.into(),
        }
    }
}

#[async_trait]
impl EnrichmentAdapter for FixtureKeywordAdapter {
    async fn fetch_keywords(
        &self,
        _ctx: &AdapterContext,
        source: Source,
        url: &str,
        _title: &str,
    ) -> Result<String, AdapterError> {
        let path = fixture_keywords_path(&self.fixtures_root, source);
        let keywords: BTreeMap<String, String> = read_json_file(&path).await?;
        keywords
            .get(url)
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AdapterError::Message(format!("no captured keywords for {url}")))
    }
}

#[derive(Debug, Clone)]
pub struct HtmlListingAdapter {
    source: Source,
    listing_urls: Vec<String>,
    http: Arc<HttpFetcher>,
}

impl HtmlListingAdapter {
    pub fn new(source: Source, listing_urls: Vec<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            source,
            listing_urls,
            http,
        }
    }
}

#[async_trait]
impl SourceAdapter for HtmlListingAdapter {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch_snapshot(&self, ctx: &AdapterContext) -> Result<Vec<Listing>, AdapterError> {
        if self.listing_urls.is_empty() {
            return Err(AdapterError::Message(format!(
                "no listing urls configured for {}",
                self.source
            )));
        }
        let mut out = Vec::new();
        for url in &self.listing_urls {
            let page = self.http.fetch_page(ctx.cycle_id, self.source, url).await?;
            let parsed = parse_listing_page(self.source, &page, ctx.fetched_at)?;
            debug!(source = %self.source, url, count = parsed.len(), "parsed listing page");
            out.extend(parsed);
        }
        Ok(out)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("invalid selector `{css}`: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(el: ElementRef<'_>) -> Option<String> {
    text_or_none(el.text().collect::<String>())
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope.select(sel).next().and_then(element_text)
}

fn first_attr(scope: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

fn absolutize(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), href.trim_start_matches('/'))
    }
}

/// Bids arrive as e.g. `USD $45,000`; the currency code prefix is dropped.
pub fn normalize_price(raw: Option<String>) -> String {
    let Some(raw) = raw else {
        return "No bids".to_string();
    };
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix("USD")
        .map(str::trim_start)
        .unwrap_or(trimmed);
    if stripped.is_empty() {
        "No bids".to_string()
    } else {
        stripped.to_string()
    }
}

/// Convert a site countdown (`2 days`, `1:23:45`, `23:45`, `45s`, `Ended`) into an
/// absolute end time relative to `now`. Out-of-range values yield `None`.
pub fn parse_countdown(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let lower = text.trim().to_ascii_lowercase();
    if lower.is_empty() {
        return None;
    }
    let delta = if lower.contains("day") {
        TimeDelta::try_days(lower.split_whitespace().next()?.parse().ok()?)?
    } else if lower.contains(':') {
        let parts = lower
            .split(':')
            .map(|p| p.trim().parse::<i64>().ok())
            .collect::<Option<Vec<_>>>()?;
        match parts.as_slice() {
            [h, m, s] => TimeDelta::try_hours(*h)?
                .checked_add(&TimeDelta::try_minutes(*m)?)?
                .checked_add(&TimeDelta::try_seconds(*s)?)?,
            [m, s] => TimeDelta::try_minutes(*m)?.checked_add(&TimeDelta::try_seconds(*s)?)?,
            _ => return None,
        }
    } else if lower.contains("ended") {
        TimeDelta::seconds(2)
    } else {
        TimeDelta::try_seconds(lower.trim_end_matches('s').trim().parse().ok()?)?
    };
    now.checked_add_signed(delta)
}

/// `data-ends-at` carries unix seconds; some pages use RFC 3339 instead.
pub fn parse_ends_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn parse_listing_page(
    source: Source,
    html: &str,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<Listing>, AdapterError> {
    let document = Html::parse_document(html);
    match source {
        Source::BringATrailer => parse_bat_cards(&document, fetched_at),
        Source::PcarMarket => parse_pcar_cards(&document, fetched_at),
        Source::CarsAndBids => parse_cab_cards(&document, fetched_at),
    }
}

fn parse_bat_cards(document: &Html, fetched_at: DateTime<Utc>) -> Result<Vec<Listing>, AdapterError> {
    let card = selector("a.listing-card")?;
    let title = selector("h3")?;
    let image = selector(".thumbnail img")?;
    let bid = selector(".bidding-bid .bid-formatted")?;
    let countdown = selector(".countdown-text")?;

    let mut out = Vec::new();
    for item in document.select(&card) {
        let (Some(t), Some(href)) = (
            first_text(item, &title),
            item.value().attr("href").and_then(|h| text_or_none(h.to_string())),
        ) else {
            continue;
        };
        let end_time = first_attr(item, &countdown, "data-ends-at")
            .and_then(|raw| parse_ends_at(&raw))
            .or_else(|| first_text(item, &countdown).and_then(|c| parse_countdown(&c, fetched_at)));
        out.push(Listing::observed(
            Source::BringATrailer,
            absolutize("https://bringatrailer.com", &href),
            &t,
            first_attr(item, &image, "src"),
            EndTime::from(end_time),
            normalize_price(first_text(item, &bid)),
            fetched_at,
        ));
    }
    Ok(out)
}

fn parse_pcar_cards(document: &Html, fetched_at: DateTime<Utc>) -> Result<Vec<Listing>, AdapterError> {
    let card = selector(".post.car")?;
    let link = selector("h2 a")?;
    let bid = selector(".auction-bid .pushed_bid_amount")?;
    let countdown = selector(".countdownTimer")?;
    let image = selector("img.featured")?;

    let mut out = Vec::new();
    for item in document.select(&card) {
        let (Some(t), Some(href)) = (first_text(item, &link), first_attr(item, &link, "href")) else {
            continue;
        };
        // Cards without a countdown are not running auctions.
        let Some(end_time) =
            first_attr(item, &countdown, "data-ends-at").and_then(|raw| parse_ends_at(&raw))
        else {
            continue;
        };
        out.push(Listing::observed(
            Source::PcarMarket,
            absolutize("https://pcarmarket.com", &href),
            &t,
            first_attr(item, &image, "src"),
            EndTime::At(end_time),
            normalize_price(first_text(item, &bid)),
            fetched_at,
        ));
    }
    Ok(out)
}

fn parse_cab_cards(document: &Html, fetched_at: DateTime<Utc>) -> Result<Vec<Listing>, AdapterError> {
    let card = selector("ul.auctions-list li.auction-item")?;
    let link = selector(".auction-title a")?;
    let bid = selector(".high-bid .bid-value")?;
    let time_left = selector(".time-left .value span")?;
    let image = selector("img")?;

    let mut out = Vec::new();
    for item in document.select(&card) {
        let (Some(t), Some(href)) = (first_attr(item, &link, "title"), first_attr(item, &link, "href"))
        else {
            continue;
        };
        let Some(end_time) = first_text(item, &time_left).and_then(|c| parse_countdown(&c, fetched_at))
        else {
            continue;
        };
        out.push(Listing::observed(
            Source::CarsAndBids,
            absolutize("https://carsandbids.com", &href),
            &t,
            first_attr(item, &image, "src"),
            EndTime::At(end_time),
            normalize_price(first_text(item, &bid)),
            fetched_at,
        ));
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct DetailPageKeywordAdapter {
    http: Arc<HttpFetcher>,
}

impl DetailPageKeywordAdapter {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl EnrichmentAdapter for DetailPageKeywordAdapter {
    async fn fetch_keywords(
        &self,
        ctx: &AdapterContext,
        source: Source,
        url: &str,
        title: &str,
    ) -> Result<String, AdapterError> {
        let page = self.http.fetch_page(ctx.cycle_id, source, url).await?;
        parse_detail_keywords(source, &page, title)
    }
}

/// Extract the keyword blob from a detail page: the make/model facts followed by the
/// title without its source tag.
pub fn parse_detail_keywords(source: Source, html: &str, title: &str) -> Result<String, AdapterError> {
    let document = Html::parse_document(html);
    let facts = match source {
        Source::BringATrailer => bat_detail_facts(&document)?,
        Source::PcarMarket => pcar_detail_facts(&document)?,
        Source::CarsAndBids => cab_detail_facts(&document)?,
    };
    if facts.is_empty() {
        return Err(AdapterError::Parse {
            site: source,
            detail: "no make/model facts on detail page".to_string(),
        });
    }

    let bare_title = title.strip_prefix(source.title_tag()).unwrap_or(title);
    let bare_title = match source {
        Source::PcarMarket => bare_title.replace('.', " "),
        Source::BringATrailer | Source::CarsAndBids => bare_title.to_string(),
    };
    let mut parts = facts;
    parts.extend(text_or_none(bare_title));
    Ok(parts.join(" "))
}

fn bat_detail_facts(document: &Html) -> Result<Vec<String>, AdapterError> {
    let item = selector(".group-item-wrap .group-item")?;
    let label = selector(".group-title-label")?;
    Ok(document
        .select(&item)
        .take(2)
        .filter_map(|el| {
            let full = el.text().collect::<String>();
            let value = match el.select(&label).next() {
                Some(l) => full.replacen(&l.text().collect::<String>(), "", 1),
                None => full,
            };
            let before_paren = value.split('(').next().unwrap_or_default().to_string();
            text_or_none(before_paren)
        })
        .collect())
}

fn pcar_detail_facts(document: &Html) -> Result<Vec<String>, AdapterError> {
    let item = selector("#auction-details-list li")?;
    let strong = selector("strong")?;
    let mut facts = BTreeMap::new();
    for li in document.select(&item) {
        let Some(key_el) = li.select(&strong).next() else {
            continue;
        };
        let key_text = key_el.text().collect::<String>();
        let key = key_text.replace(':', "").trim().to_string();
        let value = li
            .text()
            .collect::<String>()
            .replacen(&key_text, "", 1)
            .replace(':', "");
        if let Some(value) = text_or_none(value) {
            facts.insert(key, value);
        }
    }
    Ok(make_and_model(facts))
}

fn cab_detail_facts(document: &Html) -> Result<Vec<String>, AdapterError> {
    let dt = selector(".quick-facts dt")?;
    let link = selector("a")?;
    let mut facts = BTreeMap::new();
    for term in document.select(&dt) {
        let Some(key) = element_text(term) else {
            continue;
        };
        let Some(dd) = term.next_siblings().find_map(ElementRef::wrap) else {
            continue;
        };
        let value = first_text(dd, &link).or_else(|| element_text(dd));
        if let Some(value) = value {
            facts.insert(key, value);
        }
    }
    Ok(make_and_model(facts))
}

fn make_and_model(mut facts: BTreeMap<String, String>) -> Vec<String> {
    ["Make", "Model"]
        .into_iter()
        .filter_map(|k| facts.remove(k))
        .collect()
}

pub fn source_adapter_for(
    source: Source,
    mode: AdapterMode,
    fixtures_root: &Path,
    listing_urls: &[String],
    http: &Arc<HttpFetcher>,
) -> Arc<dyn SourceAdapter> {
    match mode {
        AdapterMode::Fixture => Arc::new(FixtureSourceAdapter::new(source, fixtures_root)),
        AdapterMode::Http => Arc::new(HtmlListingAdapter::new(
            source,
            listing_urls.to_vec(),
            Arc::clone(http),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn countdowns_become_absolute_times() {
        let n = now();
        assert_eq!(parse_countdown("2 days", n), Some(n + TimeDelta::days(2)));
        assert_eq!(
            parse_countdown("1:23:45", n),
            Some(n + TimeDelta::hours(1) + TimeDelta::minutes(23) + TimeDelta::seconds(45))
        );
        assert_eq!(parse_countdown("23:45", n), Some(n + TimeDelta::minutes(23) + TimeDelta::seconds(45)));
        assert_eq!(parse_countdown("45s", n), Some(n + TimeDelta::seconds(45)));
        assert_eq!(parse_countdown("Ended", n), Some(n + TimeDelta::seconds(2)));
        assert_eq!(parse_countdown("soon", n), None);
        assert_eq!(parse_countdown("", n), None);
    }

    #[test]
    fn absurd_countdowns_are_dropped() {
        let n = now();
        assert_eq!(parse_countdown("9999999999999 days", n), None);
        assert_eq!(parse_countdown("9999999999999:00:00", n), None);
        assert_eq!(parse_countdown("99999999999999999s", n), None);
    }

    #[test]
    fn card_with_absurd_countdown_is_skipped() {
        let html = r#"
            <ul class="auctions-list">
              <li class="auction-item">
                <div class="auction-title"><a href="/auctions/bad" title="2004 BMW M3 Coupe">2004 BMW M3</a></div>
                <div class="time-left"><span class="value"><span>9999999999999 days</span></span></div>
              </li>
              <li class="auction-item">
                <div class="auction-title"><a href="/auctions/good" title="2011 Audi R8 V10">2011 Audi R8</a></div>
                <div class="time-left"><span class="value"><span>1:00:00</span></span></div>
              </li>
            </ul>"#;
        let listings = parse_listing_page(Source::CarsAndBids, html, now()).unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].url, "https://carsandbids.com/auctions/good");
    }

    #[test]
    fn ends_at_accepts_unix_seconds_and_rfc3339() {
        assert_eq!(parse_ends_at("1772366400"), Some(now()));
        assert_eq!(parse_ends_at("2026-03-01T12:00:00Z"), Some(now()));
        assert_eq!(parse_ends_at("tomorrow"), None);
    }

    #[test]
    fn price_drops_currency_code() {
        assert_eq!(normalize_price(Some("USD $45,000".into())), "$45,000");
        assert_eq!(normalize_price(Some("$12,500".into())), "$12,500");
        assert_eq!(normalize_price(Some("  ".into())), "No bids");
        assert_eq!(normalize_price(None), "No bids");
    }

    #[test]
    fn bat_cards_parse() {
        let html = r#"
            <div>
              <a class="listing-card" href="https://bringatrailer.com/listing/1991-porsche-964/">
                <div class="thumbnail"><img src="https://cdn.example/964.jpg"></div>
                <h3>1991 Porsche 911 Carrera 4 Coupe</h3>
                <div class="bidding-bid"><span class="bid-formatted">USD $61,000</span></div>
                <span class="countdown-text">1:00:00</span>
              </a>
              <a class="listing-card" href="https://bringatrailer.com/listing/no-title/"></a>
            </div>"#;
        let listings = parse_listing_page(Source::BringATrailer, html, now()).unwrap();
        assert_eq!(listings.len(), 1);
        let l = &listings[0];
        assert_eq!(l.title, "BaT: 1991 Porsche 911 Carrera 4 Coupe");
        assert_eq!(l.year, Some(1991));
        assert_eq!(l.price, "$61,000");
        assert_eq!(l.end_time, EndTime::At(now() + TimeDelta::hours(1)));
        assert_eq!(l.image.as_deref(), Some("https://cdn.example/964.jpg"));
    }

    #[test]
    fn pcar_cards_require_countdown_and_absolutize_urls() {
        let html = r#"
            <div class="post car">
              <h2><a href="/auction/2018-porsche-911-gt3-touring-13/">3,300-Mile 2018 Porsche 991.2 GT3 Touring</a></h2>
              <div class="auction-bid"><span class="pushed_bid_amount">$150,000</span></div>
              <span class="countdownTimer" data-ends-at="1772366400"></span>
              <img class="featured" src="/media/gt3.jpg">
            </div>
            <div class="post car">
              <h2><a href="/auction/buy-now-only/">2001 Porsche Boxster S</a></h2>
            </div>"#;
        let listings = parse_listing_page(Source::PcarMarket, html, now()).unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(
            listings[0].url,
            "https://pcarmarket.com/auction/2018-porsche-911-gt3-touring-13/"
        );
        assert_eq!(listings[0].end_time, EndTime::At(now()));
        assert_eq!(listings[0].year, Some(2018));
    }

    #[test]
    fn cab_cards_use_title_attribute() {
        let html = r#"
            <ul class="auctions-list">
              <li class="auction-item">
                <img src="https://media.example/m3.jpg">
                <div class="auction-title"><a href="/auctions/abc/2004-bmw-m3" title="2004 BMW M3 Coupe">2004 BMW M3</a></div>
                <div class="high-bid"><span class="bid-value">$21,000</span></div>
                <div class="time-left"><span class="value"><span>2 days</span></span></div>
              </li>
            </ul>"#;
        let listings = parse_listing_page(Source::CarsAndBids, html, now()).unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].title, "C&B: 2004 BMW M3 Coupe");
        assert_eq!(listings[0].url, "https://carsandbids.com/auctions/abc/2004-bmw-m3");
        assert_eq!(listings[0].end_time, EndTime::At(now() + TimeDelta::days(2)));
    }

    #[test]
    fn detail_keywords_per_source() {
        let bat = r#"
            <div class="group-item-wrap">
              <button class="group-item"><strong class="group-title-label">Make</strong> Porsche</button>
              <button class="group-item"><strong class="group-title-label">Model</strong> 964 911 (1989-1994)</button>
              <button class="group-item"><strong class="group-title-label">Era</strong> 1990s</button>
            </div>"#;
        assert_eq!(
            parse_detail_keywords(Source::BringATrailer, bat, "BaT: 1991 Porsche 911 Carrera 4").unwrap(),
            "Porsche 964 911 1991 Porsche 911 Carrera 4"
        );

        let pcar = r#"
            <ul id="auction-details-list">
              <li><strong>Make:</strong> Porsche</li>
              <li><strong>Model:</strong> 911 GT3</li>
              <li><strong>Mileage:</strong> 3,300</li>
            </ul>"#;
        assert_eq!(
            parse_detail_keywords(Source::PcarMarket, pcar, "PCAR: 2018 Porsche 991.2 GT3").unwrap(),
            "Porsche 911 GT3 2018 Porsche 991 2 GT3"
        );

        let cab = r#"
            <dl class="quick-facts">
              <dt>Make</dt><dd><a href="/search/bmw">BMW</a></dd>
              <dt>Model</dt><dd>M3</dd>
            </dl>"#;
        assert_eq!(
            parse_detail_keywords(Source::CarsAndBids, cab, "C&B: 2004 BMW M3").unwrap(),
            "BMW M3 2004 BMW M3"
        );
    }

    #[test]
    fn detail_page_without_facts_is_an_error() {
        let err = parse_detail_keywords(Source::CarsAndBids, "<html></html>", "C&B: x").unwrap_err();
        assert!(matches!(err, AdapterError::Parse { site: Source::CarsAndBids, .. }));
    }

    #[tokio::test]
    async fn fixture_adapter_restamps_observation_time() {
        let dir = tempdir().expect("tempdir");
        let path = fixture_snapshot_path(dir.path(), Source::CarsAndBids);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(
            &path,
            r#"{
              "source": "cab",
              "captured_at": "2026-02-01T00:00:00Z",
              "listings": [
                {"url": "https://carsandbids.com/auctions/a", "title": "2004 BMW M3", "end_time": "2026-03-02T12:00:00Z", "price": "$21,000"},
                {"url": "", "title": "broken", "price": "$1"}
              ]
            }"#,
        )
        .await
        .unwrap();

        let adapter = FixtureSourceAdapter::new(Source::CarsAndBids, dir.path());
        let ctx = AdapterContext {
            cycle_id: Uuid::new_v4(),
            fetched_at: now(),
        };
        let listings = adapter.fetch_snapshot(&ctx).await.unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].scraped_at, now());
        assert_eq!(listings[0].title, "C&B: 2004 BMW M3");

        let wrong = FixtureSourceAdapter::new(Source::BringATrailer, dir.path());
        assert!(wrong.fetch_snapshot(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn fixture_keywords_miss_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = fixture_keywords_path(dir.path(), Source::PcarMarket);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, r#"{"https://pcarmarket.com/auction/a/": "Porsche 911"}"#)
            .await
            .unwrap();

        let adapter = FixtureKeywordAdapter::new(dir.path());
        let ctx = AdapterContext::new(Uuid::new_v4());
        let hit = adapter
            .fetch_keywords(&ctx, Source::PcarMarket, "https://pcarmarket.com/auction/a/", "PCAR: a")
            .await
            .unwrap();
        assert_eq!(hit, "Porsche 911");
        assert!(adapter
            .fetch_keywords(&ctx, Source::PcarMarket, "https://pcarmarket.com/auction/b/", "PCAR: b")
            .await
            .is_err());
    }
}
