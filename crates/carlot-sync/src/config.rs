use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use carlot_adapters::AdapterMode;
use carlot_core::Source;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source: Source,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub mode: AdapterMode,
    /// Smallest snapshot accepted from this source before the whole cycle is skipped.
    #[serde(default)]
    pub min_listings: Option<usize>,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

/// Expected steady-state volume below which a scrape is treated as broken.
pub fn default_min_listings(source: Source) -> usize {
    match source {
        Source::BringATrailer => 500,
        Source::PcarMarket | Source::CarsAndBids => 1,
    }
}

impl SourceConfig {
    /// Never below one: an empty snapshot is always a failed scrape.
    pub fn min_listings(&self) -> usize {
        self.min_listings
            .unwrap_or_else(|| default_min_listings(self.source))
            .max(1)
    }

    pub fn display_name(&self) -> &str {
        self.display_name
            .as_deref()
            .unwrap_or_else(|| self.source.display_name())
    }
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text).context("parsing source registry")?;
        let mut seen = HashSet::new();
        for entry in &registry.sources {
            if !seen.insert(entry.source) {
                bail!("source `{}` is listed more than once", entry.source);
            }
            if entry.enabled && entry.mode == AdapterMode::Http && entry.listing_urls.is_empty() {
                bail!("source `{}` uses http mode without listing_urls", entry.source);
            }
        }
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub sources_file: PathBuf,
    pub cycle_interval: Duration,
    pub fetch_timeout: Duration,
    pub enrich_batch_size: usize,
    pub user_agent: String,
    pub http_timeout: Duration,
    pub requests_per_minute: u32,
    pub write_reports: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let secs = |key: &str, default: u64| {
            Duration::from_secs(
                lookup(key)
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(default),
            )
        };
        let workspace_root = lookup("CARLOT_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let sources_file = lookup("CARLOT_SOURCES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace_root.join("sources.yaml"));
        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            sources_file,
            cycle_interval: secs("CARLOT_CYCLE_INTERVAL_SECS", 120),
            fetch_timeout: secs("CARLOT_FETCH_TIMEOUT_SECS", 90),
            enrich_batch_size: lookup("CARLOT_ENRICH_BATCH_SIZE")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(100),
            user_agent: lookup("CARLOT_USER_AGENT").unwrap_or_else(|| "carlot-bot/0.1".to_string()),
            http_timeout: secs("CARLOT_HTTP_TIMEOUT_SECS", 20),
            requests_per_minute: lookup("CARLOT_HTTP_REQUESTS_PER_MINUTE")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(30),
            write_reports: lookup("CARLOT_WRITE_REPORTS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            workspace_root,
        }
    }

    pub fn fixtures_root(&self) -> PathBuf {
        self.workspace_root.join("fixtures")
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_without_environment() {
        let config = SyncConfig::default();
        assert_eq!(config.database_url, None);
        assert_eq!(config.cycle_interval, Duration::from_secs(120));
        assert_eq!(config.enrich_batch_size, 100);
        assert_eq!(config.requests_per_minute, 30);
        assert_eq!(config.sources_file, PathBuf::from("./sources.yaml"));
        assert!(!config.write_reports);
    }

    #[test]
    fn lookup_overrides_defaults() {
        let env = HashMap::from([
            ("DATABASE_URL", "postgres://carlot@localhost/carlot"),
            ("CARLOT_WORKSPACE_ROOT", "/srv/carlot"),
            ("CARLOT_CYCLE_INTERVAL_SECS", "30"),
            ("CARLOT_ENRICH_BATCH_SIZE", "25"),
            ("CARLOT_WRITE_REPORTS", "1"),
            ("CARLOT_HTTP_REQUESTS_PER_MINUTE", "0"),
            ("CARLOT_FETCH_TIMEOUT_SECS", "not-a-number"),
        ]);
        let config = SyncConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.database_url.as_deref(), Some("postgres://carlot@localhost/carlot"));
        assert_eq!(config.cycle_interval, Duration::from_secs(30));
        assert_eq!(config.fetch_timeout, Duration::from_secs(90));
        assert_eq!(config.enrich_batch_size, 25);
        assert_eq!(config.sources_file, PathBuf::from("/srv/carlot/sources.yaml"));
        assert_eq!(config.fixtures_root(), PathBuf::from("/srv/carlot/fixtures"));
        assert!(config.write_reports);
        assert_eq!(config.requests_per_minute, 0);
    }

    #[test]
    fn registry_applies_per_source_minimums() {
        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - source: bat
    mode: fixture
  - source: pcar
    mode: fixture
    min_listings: 0
  - source: cab
    mode: http
    enabled: false
"#,
        )
        .unwrap();
        assert_eq!(registry.sources[0].min_listings(), 500);
        assert_eq!(registry.sources[1].min_listings(), 1);
        assert_eq!(registry.sources[1].display_name(), "PCARMARKET");
        assert_eq!(registry.enabled().count(), 2);
    }

    #[test]
    fn registry_rejects_duplicates_and_urlless_http_sources() {
        let dup = "sources:\n  - {source: bat, mode: fixture}\n  - {source: bat, mode: fixture}\n";
        assert!(SourceRegistry::from_yaml_str(dup).is_err());
        let urlless = "sources:\n  - {source: cab, mode: http}\n";
        assert!(SourceRegistry::from_yaml_str(urlless).is_err());
    }

    #[test]
    fn repository_registries_parse() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        for name in ["sources.yaml", "sources.fixtures.yaml"] {
            let registry = SourceRegistry::load(&root.join(name)).unwrap();
            assert_eq!(registry.enabled().count(), Source::ALL.len(), "{name}");
        }
    }
}
