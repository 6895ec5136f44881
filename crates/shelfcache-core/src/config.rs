//! Configuration for the shelfcache store.
//!
//! Settings are read from an optional JSON file and then overridden from
//! `CACHE_*` environment variables. Well-known namespace names used by the
//! metadata clients live in [`Namespaces`].

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Namespace names shared by the library, catalog, and enrichment clients.
pub struct Namespaces;

impl Namespaces {
    pub const LIBRARY: &'static str = "library";
    pub const CATALOG: &'static str = "catalog";
    pub const SEARCH: &'static str = "search";
    pub const STATS: &'static str = "stats";
    pub const ACCOUNT: &'static str = "account";
    pub const ENRICHMENT: &'static str = "audible_enrichment";
    pub const PRICING: &'static str = "pricing";
    pub const ABS_ITEMS: &'static str = "abs_items";
    pub const ABS_LIBRARIES: &'static str = "abs_libraries";
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct CacheSettings {
    /// When false no storage file is opened and every read misses.
    pub enabled: bool,
    /// Path to the SQLite storage file.
    pub db_path: PathBuf,
    /// TTL used when neither the caller nor the namespace supplies one.
    pub default_ttl_secs: u64,
    /// Per-namespace default TTLs.
    pub namespace_ttl_secs: HashMap<String, u64>,
    /// Namespaces whose TTL never crosses the next month boundary.
    pub calendar_sensitive: Vec<String>,
    /// Namespaces wiped by `clear_pricing`.
    pub pricing_namespaces: Vec<String>,
    /// Minimum TTL handed out for calendar-sensitive namespaces.
    pub ttl_floor_secs: u64,
    /// Entry bound of the in-process memory tier (0 disables it).
    pub max_memory_entries: usize,
    /// Bounded wait on the single write path, in milliseconds.
    pub write_timeout_ms: u64,
    /// SQLite busy timeout applied to every connection, in milliseconds.
    pub busy_timeout_ms: u64,
    /// Number of read-only connections.
    pub reader_connections: usize,
}

impl CacheSettings {
    /// Default TTL (2 hours).
    pub const DEFAULT_TTL_SECS: u64 = 2 * 60 * 60;
    /// TTL for marketplace library and catalog data (10 days).
    pub const MARKETPLACE_TTL_SECS: u64 = 10 * 24 * 60 * 60;
    /// TTL for enrichment results, which carry prices (6 hours).
    pub const ENRICHMENT_TTL_SECS: u64 = 6 * 60 * 60;
    /// Floor for calendar-capped TTLs.
    pub const DEFAULT_TTL_FLOOR_SECS: u64 = 60;
    pub const DEFAULT_MAX_MEMORY_ENTRIES: usize = 500;
    pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5_000;
    pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;
    pub const DEFAULT_READER_CONNECTIONS: usize = 4;
    pub const DEFAULT_DB_PATH: &'static str = "./data/cache/cache.db";

    /// Settings rooted at the given storage file, otherwise default.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Load settings from a JSON file, then apply environment overrides.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| CacheError::Io {
                message: format!("Failed to read cache settings: {}", e),
                path: Some(path.to_path_buf()),
                source: Some(e),
            })?;
            serde_json::from_str(&content).map_err(|e| CacheError::Json {
                message: format!("Failed to parse cache settings from {}: {}", path.display(), e),
                source: Some(e),
            })?
        } else {
            debug!("No cache settings at {}, using defaults", path.display());
            Self::default()
        };

        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `CACHE_ENABLED`, `CACHE_DB_PATH`, `CACHE_DEFAULT_TTL_HOURS` and
    /// `CACHE_MAX_MEMORY_ENTRIES`.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup("CACHE_ENABLED") {
            self.enabled = parse_bool(&value).ok_or_else(|| CacheError::Config {
                message: format!("CACHE_ENABLED must be a boolean, got '{}'", value),
            })?;
        }
        if let Some(value) = lookup("CACHE_DB_PATH") {
            self.db_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("CACHE_DEFAULT_TTL_HOURS") {
            let hours: f64 = value.parse().map_err(|_| CacheError::Config {
                message: format!("CACHE_DEFAULT_TTL_HOURS must be a number, got '{}'", value),
            })?;
            if !hours.is_finite() || hours <= 0.0 {
                return Err(CacheError::Config {
                    message: format!("CACHE_DEFAULT_TTL_HOURS must be positive, got {}", hours),
                });
            }
            self.default_ttl_secs = ((hours * 3600.0).round() as u64).max(1);
        }
        if let Some(value) = lookup("CACHE_MAX_MEMORY_ENTRIES") {
            self.max_memory_entries = value.parse().map_err(|_| CacheError::Config {
                message: format!("CACHE_MAX_MEMORY_ENTRIES must be an integer, got '{}'", value),
            })?;
        }
        Ok(())
    }

    /// Reject settings that would break the write path or TTL invariants.
    pub fn validate(&self) -> Result<()> {
        if self.reader_connections == 0 {
            return Err(CacheError::Config {
                message: "reader_connections must be at least 1".to_string(),
            });
        }
        if self.write_timeout_ms == 0 {
            return Err(CacheError::Config {
                message: "write_timeout_ms must be positive".to_string(),
            });
        }
        if self.ttl_floor_secs == 0 {
            return Err(CacheError::Config {
                message: "ttl_floor_secs must be positive".to_string(),
            });
        }
        if self.default_ttl_secs == 0 {
            return Err(CacheError::Config {
                message: "default_ttl_secs must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        let namespace_ttl_secs = [
            (Namespaces::LIBRARY, Self::MARKETPLACE_TTL_SECS),
            (Namespaces::CATALOG, Self::MARKETPLACE_TTL_SECS),
            (Namespaces::SEARCH, Self::MARKETPLACE_TTL_SECS),
            (Namespaces::STATS, Self::MARKETPLACE_TTL_SECS),
            (Namespaces::ACCOUNT, Self::MARKETPLACE_TTL_SECS),
            (Namespaces::ABS_ITEMS, Self::DEFAULT_TTL_SECS),
            (Namespaces::ABS_LIBRARIES, Self::DEFAULT_TTL_SECS),
            (Namespaces::ENRICHMENT, Self::ENRICHMENT_TTL_SECS),
        ]
        .into_iter()
        .map(|(ns, ttl)| (ns.to_string(), ttl))
        .collect();

        let pricing = vec![
            Namespaces::ENRICHMENT.to_string(),
            Namespaces::PRICING.to_string(),
        ];

        Self {
            enabled: true,
            db_path: PathBuf::from(Self::DEFAULT_DB_PATH),
            default_ttl_secs: Self::DEFAULT_TTL_SECS,
            namespace_ttl_secs,
            calendar_sensitive: pricing.clone(),
            pricing_namespaces: pricing,
            ttl_floor_secs: Self::DEFAULT_TTL_FLOOR_SECS,
            max_memory_entries: Self::DEFAULT_MAX_MEMORY_ENTRIES,
            write_timeout_ms: Self::DEFAULT_WRITE_TIMEOUT_MS,
            busy_timeout_ms: Self::DEFAULT_BUSY_TIMEOUT_MS,
            reader_connections: Self::DEFAULT_READER_CONNECTIONS,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = CacheSettings::default();
        assert!(settings.enabled);
        assert_eq!(settings.default_ttl_secs, 7200);
        assert_eq!(settings.max_memory_entries, 500);
        assert_eq!(
            settings.namespace_ttl_secs.get(Namespaces::ENRICHMENT),
            Some(&21_600)
        );
        assert!(settings
            .calendar_sensitive
            .contains(&Namespaces::ENRICHMENT.to_string()));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_partial_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.json");
        std::fs::write(
            &path,
            r#"{"db_path": "/tmp/other.db", "max_memory_entries": 10, "unknown_field": 1}"#,
        )
        .unwrap();

        let settings = CacheSettings::load(&path).unwrap();
        assert_eq!(settings.max_memory_entries, 10);
        assert_eq!(settings.default_ttl_secs, CacheSettings::DEFAULT_TTL_SECS);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let settings = CacheSettings::load(temp.path().join("absent.json")).unwrap();
        assert_eq!(settings.reader_connections, 4);
    }

    #[test]
    fn test_load_invalid_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            CacheSettings::load(&path),
            Err(CacheError::Json { .. })
        ));
    }

    #[test]
    fn test_overrides() {
        let mut settings = CacheSettings::default();
        settings
            .apply_overrides(|name| match name {
                "CACHE_ENABLED" => Some("false".to_string()),
                "CACHE_DEFAULT_TTL_HOURS" => Some("0.5".to_string()),
                "CACHE_MAX_MEMORY_ENTRIES" => Some("42".to_string()),
                _ => None,
            })
            .unwrap();

        assert!(!settings.enabled);
        assert_eq!(settings.default_ttl_secs, 1800);
        assert_eq!(settings.max_memory_entries, 42);
    }

    #[test]
    fn test_bad_override_is_config_error() {
        let mut settings = CacheSettings::default();
        let result = settings.apply_overrides(|name| {
            (name == "CACHE_ENABLED").then(|| "maybe".to_string())
        });
        assert!(matches!(result, Err(CacheError::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_readers() {
        let settings = CacheSettings {
            reader_connections: 0,
            ..CacheSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
