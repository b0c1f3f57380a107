//! Core domain model for the live auction catalog.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "carlot-core";

/// Auction site a listing was scraped from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Source {
    #[serde(rename = "bat")]
    BringATrailer,
    #[serde(rename = "pcar")]
    PcarMarket,
    #[serde(rename = "cab")]
    CarsAndBids,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::BringATrailer, Source::PcarMarket, Source::CarsAndBids];

    pub fn id(self) -> &'static str {
        match self {
            Source::BringATrailer => "bat",
            Source::PcarMarket => "pcar",
            Source::CarsAndBids => "cab",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Source::BringATrailer => "Bring a Trailer",
            Source::PcarMarket => "PCARMARKET",
            Source::CarsAndBids => "Cars & Bids",
        }
    }

    /// Prefix carried in every listing title produced by this source.
    pub fn title_tag(self) -> &'static str {
        match self {
            Source::BringATrailer => "BaT: ",
            Source::PcarMarket => "PCAR: ",
            Source::CarsAndBids => "C&B: ",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.id().eq_ignore_ascii_case(id.trim()))
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown auction source `{0}`")]
pub struct UnknownSource(pub String);

impl FromStr for Source {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_id(s).ok_or_else(|| UnknownSource(s.to_string()))
    }
}

/// When an auction ends. `Open` marks listings that are not time-boxed (buy-now, make-offer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<DateTime<Utc>>", into = "Option<DateTime<Utc>>")]
pub enum EndTime {
    At(DateTime<Utc>),
    Open,
}

impl EndTime {
    pub fn as_option(self) -> Option<DateTime<Utc>> {
        match self {
            EndTime::At(at) => Some(at),
            EndTime::Open => None,
        }
    }
}

impl From<Option<DateTime<Utc>>> for EndTime {
    fn from(value: Option<DateTime<Utc>>) -> Self {
        value.map_or(EndTime::Open, EndTime::At)
    }
}

impl From<EndTime> for Option<DateTime<Utc>> {
    fn from(value: EndTime) -> Self {
        value.as_option()
    }
}

/// One active auction listing, keyed by its url.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub url: String,
    pub title: String,
    pub image: Option<String>,
    pub end_time: EndTime,
    pub price: String,
    pub year: Option<i32>,
    #[serde(default)]
    pub keywords: Option<String>,
    pub scraped_at: DateTime<Utc>,
    pub source: Source,
}

impl Listing {
    /// Build a freshly observed listing. The title is tagged with the source prefix
    /// unless the adapter already did so, and the model year is pulled from it.
    pub fn observed(
        source: Source,
        url: impl Into<String>,
        raw_title: &str,
        image: Option<String>,
        end_time: EndTime,
        price: impl Into<String>,
        scraped_at: DateTime<Utc>,
    ) -> Self {
        let raw_title = raw_title.trim();
        let title = if raw_title.starts_with(source.title_tag()) {
            raw_title.to_string()
        } else {
            format!("{}{}", source.title_tag(), raw_title)
        };
        Self {
            url: url.into(),
            year: extract_year(&title),
            title,
            image: image.filter(|i| !i.trim().is_empty()),
            end_time,
            price: price.into(),
            keywords: None,
            scraped_at,
            source,
        }
    }

    pub fn volatile(&self) -> VolatileFields {
        VolatileFields {
            url: self.url.clone(),
            end_time: self.end_time,
            price: self.price.clone(),
            scraped_at: self.scraped_at,
        }
    }

    pub fn close(&self, closed_at: DateTime<Utc>) -> ClosedListing {
        ClosedListing {
            url: self.url.clone(),
            title: self.title.clone(),
            image: self.image.clone(),
            price: self.price.clone(),
            year: self.year,
            source: self.source,
            closed_at,
        }
    }
}

/// Fields refreshed on every cycle a listing is still observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolatileFields {
    pub url: String,
    pub end_time: EndTime,
    pub price: String,
    pub scraped_at: DateTime<Utc>,
}

/// Archived listing; the price is the last observed bid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedListing {
    pub url: String,
    pub title: String,
    pub image: Option<String>,
    pub price: String,
    pub year: Option<i32>,
    pub source: Source,
    pub closed_at: DateTime<Utc>,
}

/// Point-in-time view of listings keyed by url.
pub type Snapshot = BTreeMap<String, Listing>;

/// First standalone 19xx/20xx token in a title.
pub fn extract_year(title: &str) -> Option<i32> {
    title
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| token.len() == 4 && token.chars().all(|c| c.is_ascii_digit()))
        .find(|token| token.starts_with("19") || token.starts_with("20"))
        .and_then(|token| token.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn source_ids_round_trip() {
        for source in Source::ALL {
            assert_eq!(source.id().parse::<Source>().unwrap(), source);
        }
        assert_eq!(Source::from_id(" PCAR "), Some(Source::PcarMarket));
        assert!("ebay".parse::<Source>().is_err());
    }

    #[test]
    fn year_extraction_ignores_mileage_and_model_numbers() {
        assert_eq!(extract_year("BaT: 1973 Porsche 911 Carrera RS"), Some(1973));
        assert_eq!(extract_year("PCAR: 3,300-MILE 2018 PORSCHE 991.2 GT3"), Some(2018));
        assert_eq!(extract_year("C&B: Porsche 9110 Prototype"), None);
        assert_eq!(extract_year("no year here"), None);
    }

    #[test]
    fn observed_tags_title_once() {
        let a = Listing::observed(
            Source::CarsAndBids,
            "https://carsandbids.com/auctions/x",
            "2004 BMW M3",
            Some(String::new()),
            EndTime::Open,
            "$21,000",
            ts(),
        );
        assert_eq!(a.title, "C&B: 2004 BMW M3");
        assert_eq!(a.year, Some(2004));
        assert_eq!(a.image, None);
        assert_eq!(a.keywords, None);

        let b = Listing::observed(
            Source::CarsAndBids,
            "https://carsandbids.com/auctions/x",
            "C&B: 2004 BMW M3",
            None,
            EndTime::Open,
            "$21,000",
            ts(),
        );
        assert_eq!(b.title, a.title);
    }

    #[test]
    fn end_time_serializes_as_nullable_timestamp() {
        let open = serde_json::to_value(EndTime::Open).unwrap();
        assert!(open.is_null());
        let at: EndTime = serde_json::from_str("\"2026-03-01T12:00:00Z\"").unwrap();
        assert_eq!(at, EndTime::At(ts()));
        let source = serde_json::to_value(Source::BringATrailer).unwrap();
        assert_eq!(source, "bat");
    }
}
