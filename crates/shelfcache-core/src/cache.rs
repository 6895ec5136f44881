//! The cache handle shared by every metadata client.
//!
//! Construct one [`ShelfCache`] at startup and pass it (usually in an `Arc`)
//! to whatever needs it. Reads check the memory tier, fall through to the
//! persistent store and warm the tier; storage failures on reads are logged
//! and reported as a miss. Writes go through the single write path and
//! surface their errors.

use crate::codec::{self, DecodedBatch};
use crate::config::CacheSettings;
use crate::error::{CacheError, Result};
use crate::invalidation::{InvalidationController, InvalidationReport};
use crate::memory::{MemoryStats, MemoryTier};
use crate::pattern::KeyPattern;
use crate::search::{self, SearchFields, SearchHit};
use crate::store::{self, entries, CacheEntry, NamespaceStats, PersistentStore};
use crate::ttl::TtlPolicy;
use crate::xref::{self, ItemMapping};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Result cap for [`ShelfCache::search`].
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

/// Optional parts of a `set`.
///
/// Omitted parts are cleared: an entry written without `external_id` loses
/// its old links, and one written without `searchable` leaves the index.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Requested TTL; the namespace default applies when `None`.
    pub ttl_secs: Option<u64>,
    pub external_id: Option<String>,
    pub searchable: Option<SearchFields>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }

    pub fn external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn searchable(mut self, fields: SearchFields) -> Self {
        self.searchable = Some(fields);
        self
    }
}

/// Snapshot of cache contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub db_path: PathBuf,
    pub db_size_bytes: u64,
    pub total_entries: usize,
    pub expired_entries: usize,
    pub memory_entries: usize,
    pub search_documents: usize,
    pub cross_references: usize,
    pub item_mappings: usize,
    pub matched_items: usize,
    pub namespaces: Vec<NamespaceStats>,
}

struct CacheCore {
    store: PersistentStore,
    memory: MemoryTier,
    ttl: TtlPolicy,
}

/// Unified cache over the memory tier, persistent store, search index and
/// cross-reference map.
pub struct ShelfCache {
    settings: CacheSettings,
    /// `None` when caching is disabled.
    core: Option<CacheCore>,
}

impl ShelfCache {
    /// Open the cache described by `settings`.
    ///
    /// With `enabled = false` no file is touched; reads miss and writes are
    /// accepted and dropped.
    pub fn open(settings: CacheSettings) -> Result<Self> {
        settings.validate()?;
        if !settings.enabled {
            info!("Cache disabled by configuration");
            return Ok(Self {
                settings,
                core: None,
            });
        }

        let core = CacheCore {
            store: PersistentStore::open(&settings)?,
            memory: MemoryTier::new(settings.max_memory_entries),
            ttl: TtlPolicy::from_settings(&settings),
        };
        Ok(Self {
            settings,
            core: Some(core),
        })
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self {
            settings: CacheSettings {
                enabled: false,
                ..CacheSettings::default()
            },
            core: None,
        }
    }

    /// Remove the storage file and its WAL side files.
    ///
    /// The recovery path for [`CacheError::SchemaMismatch`]; call it only
    /// when no cache is open on `db_path`.
    pub fn reset_storage(db_path: impl AsRef<Path>) -> Result<()> {
        store::remove_storage_files(db_path)
    }

    pub fn is_enabled(&self) -> bool {
        self.core.is_some()
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// The invalidation surface, or `None` when disabled.
    pub fn invalidation(&self) -> Option<InvalidationController<'_>> {
        self.core.as_ref().map(|core| {
            InvalidationController::new(
                &core.store,
                &core.memory,
                &core.ttl,
                &self.settings.pricing_namespaces,
            )
        })
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Cached value, or `None` on a miss.
    pub fn get(&self, namespace: &str, key: &str) -> Option<Vec<u8>> {
        self.get_at(namespace, key, Utc::now())
    }

    fn get_at(&self, namespace: &str, key: &str, now: DateTime<Utc>) -> Option<Vec<u8>> {
        let core = self.core.as_ref()?;
        if let Some(value) = core.memory.get(namespace, key, now) {
            return Some(value);
        }

        let generation = core.memory.generation();
        let entry = self.read_or_miss("get", |conn| entries::get_live(conn, namespace, key, now))??;
        core.memory.warm(
            namespace,
            key,
            entry.value.clone(),
            entry.expires_at,
            generation,
            now,
        );
        Some(entry.value)
    }

    /// Full entry with timestamps, read from the persistent store.
    pub fn get_entry(&self, namespace: &str, key: &str) -> Option<CacheEntry> {
        let now = Utc::now();
        self.read_or_miss("get_entry", |conn| entries::get_live(conn, namespace, key, now))?
    }

    /// Cached value decoded as JSON.
    ///
    /// A payload that fails to decode yields [`CacheError::CorruptEntry`];
    /// the caller should `delete` it and re-fetch from origin.
    pub fn get_json<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<Option<T>> {
        self.get(namespace, key)
            .map(|bytes| codec::decode(namespace, key, &bytes))
            .transpose()
    }

    /// Values for many keys of one namespace; missing keys are absent.
    pub fn get_many(&self, namespace: &str, keys: &[&str]) -> HashMap<String, Vec<u8>> {
        self.get_many_at(namespace, keys, Utc::now())
    }

    fn get_many_at(&self, namespace: &str, keys: &[&str], now: DateTime<Utc>) -> HashMap<String, Vec<u8>> {
        let mut found = HashMap::new();
        let Some(core) = self.core.as_ref() else {
            return found;
        };

        let mut pending = Vec::new();
        for key in keys {
            match core.memory.get(namespace, key, now) {
                Some(value) => {
                    found.insert(key.to_string(), value);
                }
                None => pending.push(*key),
            }
        }
        if pending.is_empty() {
            return found;
        }

        let generation = core.memory.generation();
        let fetched = self
            .read_or_miss("get_many", |conn| entries::get_live_many(conn, namespace, &pending, now))
            .map(|(rows, _skipped)| rows)
            .unwrap_or_default();
        for entry in fetched {
            core.memory.warm(
                namespace,
                &entry.key,
                entry.value.clone(),
                entry.expires_at,
                generation,
                now,
            );
            found.insert(entry.key, entry.value);
        }
        found
    }

    /// Decode many JSON payloads, skipping corrupt ones.
    pub fn get_many_json<T: DeserializeOwned>(&self, namespace: &str, keys: &[&str]) -> DecodedBatch<T> {
        codec::decode_batch(namespace, self.get_many(namespace, keys))
    }

    /// Live entries of a namespace whose key matches a shell-style glob.
    pub fn scan(&self, namespace: &str, glob: &str) -> Result<Vec<CacheEntry>> {
        let pattern = KeyPattern::new(glob)?;
        let now = Utc::now();
        Ok(self
            .read_or_miss("scan", |conn| {
                entries::scan_pattern(conn, namespace, pattern.as_glob(), now)
            })
            .map(|(rows, _skipped)| rows)
            .unwrap_or_default())
    }

    /// Full-text search over indexed titles and authors.
    pub fn search(&self, query: &str, namespace: Option<&str>) -> Vec<SearchHit> {
        self.search_with_limit(query, namespace, DEFAULT_SEARCH_LIMIT)
    }

    pub fn search_with_limit(&self, query: &str, namespace: Option<&str>, limit: usize) -> Vec<SearchHit> {
        let now = Utc::now();
        self.read_or_miss("search", |conn| search::search(conn, query, namespace, limit, now))
            .map(|outcome| outcome.hits)
            .unwrap_or_default()
    }

    /// Live entries linked to an external id, optionally within one namespace.
    pub fn search_by_external_id(&self, external_id: &str, namespace: Option<&str>) -> Vec<CacheEntry> {
        let now = Utc::now();
        self.read_or_miss("search_by_external_id", |conn| {
            let mut found = Vec::new();
            for (ns, key) in xref::resolve(conn, external_id)? {
                if namespace.is_some_and(|wanted| wanted != ns) {
                    continue;
                }
                if let Some(entry) = entries::get_live(conn, &ns, &key, now)? {
                    found.push(entry);
                }
            }
            Ok(found)
        })
        .unwrap_or_default()
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Store a value.
    ///
    /// The entry, its search document and its cross-reference are written in
    /// one transaction; the memory tier is updated before the write path is
    /// released, so a following `get` sees this value.
    pub fn set(&self, namespace: &str, key: &str, value: impl Into<Vec<u8>>, options: &SetOptions) -> Result<()> {
        self.set_at(namespace, key, value.into(), options, Utc::now())
    }

    fn set_at(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        options: &SetOptions,
        now: DateTime<Utc>,
    ) -> Result<()> {
        validate_name("namespace", namespace)?;
        validate_name("key", key)?;
        let Some(core) = self.core.as_ref() else {
            return Ok(());
        };

        let entry = CacheEntry {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value,
            created_at: now,
            expires_at: core.ttl.expires_at(namespace, options.ttl_secs, now),
        };

        core.store.write_then(
            |tx| {
                entries::upsert(tx, &entry)?;
                match &options.searchable {
                    Some(fields) => {
                        search::index(tx, namespace, key, fields)?;
                    }
                    None => {
                        search::remove(tx, namespace, key)?;
                    }
                }
                xref::replace_for_entry(tx, namespace, key, options.external_id.as_deref())
            },
            |_| {
                core.memory
                    .put(namespace, key, entry.value.clone(), entry.expires_at, now);
            },
        )?;

        debug!(
            "Cached {}/{} ({} bytes, expires {})",
            namespace,
            key,
            entry.size_bytes(),
            entry.expires_at
        );
        Ok(())
    }

    /// Store a serde value as JSON.
    pub fn set_json<T: Serialize>(&self, namespace: &str, key: &str, value: &T, options: &SetOptions) -> Result<()> {
        self.set(namespace, key, codec::encode(value)?, options)
    }

    /// Link an existing entry to an additional external id.
    ///
    /// Returns false if the entry does not exist.
    pub fn associate(&self, namespace: &str, key: &str, external_id: &str) -> Result<bool> {
        let Some(core) = self.core.as_ref() else {
            return Ok(false);
        };
        core.store
            .write(|tx| xref::associate(tx, namespace, key, external_id))
    }

    // ---------------------------------------------------------------------
    // Invalidation
    // ---------------------------------------------------------------------

    pub fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        self.invalidation()
            .map_or(Ok(false), |inv| inv.delete(namespace, key))
    }

    pub fn delete_by_pattern(&self, namespace: &str, glob: &str) -> Result<usize> {
        self.invalidation()
            .map_or(Ok(0), |inv| inv.delete_by_pattern(namespace, glob))
    }

    pub fn delete_by_external_id(&self, external_id: &str) -> Result<InvalidationReport> {
        self.invalidation()
            .map_or(Ok(InvalidationReport::default()), |inv| {
                inv.delete_by_external_id(external_id)
            })
    }

    pub fn invalidate_related(
        &self,
        namespace: &str,
        key: &str,
        related_namespaces: &[&str],
    ) -> Result<InvalidationReport> {
        self.invalidation()
            .map_or(Ok(InvalidationReport::default()), |inv| {
                inv.invalidate_related(namespace, key, related_namespaces)
            })
    }

    /// Extend a live entry's expiry. Returns false if it was not found.
    pub fn touch(&self, namespace: &str, key: &str, ttl_secs: Option<u64>) -> Result<bool> {
        self.touch_at(namespace, key, ttl_secs, Utc::now())
    }

    fn touch_at(&self, namespace: &str, key: &str, ttl_secs: Option<u64>, now: DateTime<Utc>) -> Result<bool> {
        self.invalidation()
            .map_or(Ok(false), |inv| inv.touch(namespace, key, ttl_secs, now))
    }

    pub fn clear_namespace(&self, namespace: &str) -> Result<usize> {
        self.invalidation()
            .map_or(Ok(0), |inv| inv.clear_namespace(namespace))
    }

    /// Clear every configured pricing namespace, regardless of marketplace.
    pub fn clear_pricing(&self) -> Result<InvalidationReport> {
        self.invalidation()
            .map_or(Ok(InvalidationReport::default()), |inv| inv.clear_pricing())
    }

    pub fn clear_all(&self) -> Result<usize> {
        self.invalidation().map_or(Ok(0), |inv| inv.clear_all())
    }

    pub fn cleanup_expired(&self) -> Result<usize> {
        self.cleanup_expired_at(Utc::now())
    }

    fn cleanup_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        self.invalidation()
            .map_or(Ok(0), |inv| inv.cleanup_expired(now))
    }

    // ---------------------------------------------------------------------
    // Item mappings
    // ---------------------------------------------------------------------

    pub fn set_item_mapping(&self, mapping: &ItemMapping) -> Result<()> {
        let Some(core) = self.core.as_ref() else {
            return Ok(());
        };
        let now = Utc::now();
        core.store.write(|tx| xref::upsert_mapping(tx, mapping, now))
    }

    pub fn get_item_mapping(&self, external_id: &str) -> Option<ItemMapping> {
        self.read_or_miss("get_item_mapping", |conn| xref::get_mapping(conn, external_id))?
    }

    pub fn get_mapping_by_local_id(&self, local_id: &str) -> Option<ItemMapping> {
        self.read_or_miss("get_mapping_by_local_id", |conn| {
            xref::get_mapping_by_local_id(conn, local_id)
        })?
    }

    /// Keys of live entries in `namespace` with no marketplace match.
    pub fn unmapped_local_ids(&self, namespace: &str) -> Vec<String> {
        let now = Utc::now();
        self.read_or_miss("unmapped_local_ids", |conn| {
            xref::unmapped_local_ids(conn, namespace, now)
        })
        .unwrap_or_default()
    }

    pub fn delete_item_mapping(&self, external_id: &str) -> Result<bool> {
        let Some(core) = self.core.as_ref() else {
            return Ok(false);
        };
        core.store.write(|tx| xref::delete_mapping(tx, external_id))
    }

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    pub fn stats(&self) -> Result<CacheStats> {
        let Some(core) = self.core.as_ref() else {
            return Ok(CacheStats {
                enabled: false,
                db_path: self.settings.db_path.clone(),
                ..CacheStats::default()
            });
        };

        let now = Utc::now();
        let mut stats = core.store.read(|conn| {
            let (total_entries, expired_entries) = entries::counts(conn, now)?;
            let (item_mappings, matched_items) = xref::mapping_counts(conn)?;
            Ok(CacheStats {
                enabled: true,
                db_path: core.store.db_path().to_path_buf(),
                db_size_bytes: 0,
                total_entries,
                expired_entries,
                memory_entries: 0,
                search_documents: search::count(conn)?,
                cross_references: xref::count(conn)?,
                item_mappings,
                matched_items,
                namespaces: entries::namespace_stats(conn)?,
            })
        })?;
        stats.db_size_bytes = core.store.file_size();
        stats.memory_entries = core.memory.len();
        Ok(stats)
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.core
            .as_ref()
            .map(|core| core.memory.stats())
            .unwrap_or_default()
    }

    /// Number of reads that reached the persistent store.
    pub fn store_reads(&self) -> u64 {
        self.core
            .as_ref()
            .map(|core| core.store.read_count())
            .unwrap_or(0)
    }

    /// Empty the memory tier. Later reads fall through to the store.
    pub fn drop_memory_tier(&self) {
        if let Some(core) = &self.core {
            let dropped = core.memory.clear();
            debug!("Dropped {} entries from the memory tier", dropped);
        }
    }

    /// Run a store read, logging a failure and reporting it as a miss.
    fn read_or_miss<T>(&self, operation: &str, f: impl FnOnce(&Connection) -> Result<T>) -> Option<T> {
        let core = self.core.as_ref()?;
        match core.store.read(f) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Cache {} failed, treating as a miss: {}", operation, e);
                None
            }
        }
    }
}

fn validate_name(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(CacheError::Validation {
            field: field.to_string(),
            message: format!("{} must not be empty", field),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn create_test_cache() -> (TempDir, ShelfCache) {
        let temp = TempDir::new().unwrap();
        let settings = CacheSettings::with_db_path(temp.path().join("cache.db"));
        let cache = ShelfCache::open(settings).unwrap();
        (temp, cache)
    }

    #[test]
    fn test_expired_entry_is_miss() {
        let (_temp, cache) = create_test_cache();
        let now = Utc::now();
        cache
            .set_at("catalog", "B01", b"v".to_vec(), &SetOptions::new().ttl_secs(10), now)
            .unwrap();

        assert!(cache.get_at("catalog", "B01", now + Duration::seconds(9)).is_some());
        assert!(cache.get_at("catalog", "B01", now + Duration::seconds(10)).is_none());

        // Also a miss once the memory copy is gone.
        cache.drop_memory_tier();
        assert!(cache.get_at("catalog", "B01", now + Duration::seconds(10)).is_none());
    }

    #[test]
    fn test_month_boundary_cap_applied_on_set() {
        let (_temp, cache) = create_test_cache();
        let now = DateTime::parse_from_rfc3339("2026-01-31T23:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        cache
            .set_at(
                "audible_enrichment",
                "B01",
                b"deal".to_vec(),
                &SetOptions::new().ttl_secs(21_600),
                now,
            )
            .unwrap();

        let boundary = now + Duration::hours(1);
        assert!(cache.get_at("audible_enrichment", "B01", boundary - Duration::seconds(1)).is_some());
        assert!(cache.get_at("audible_enrichment", "B01", boundary).is_none());
    }

    #[test]
    fn test_touch_expired_reports_not_found() {
        let (_temp, cache) = create_test_cache();
        let now = Utc::now();
        cache
            .set_at("catalog", "B01", b"v".to_vec(), &SetOptions::new().ttl_secs(5), now)
            .unwrap();

        let later = now + Duration::seconds(6);
        assert!(!cache.touch_at("catalog", "B01", Some(3600), later).unwrap());
        assert!(cache.get_at("catalog", "B01", later).is_none());
    }

    #[test]
    fn test_cleanup_expired_sweeps_rows() {
        let (_temp, cache) = create_test_cache();
        let now = Utc::now();
        let opts = SetOptions::new()
            .ttl_secs(5)
            .external_id("B01")
            .searchable(SearchFields::new("Dune"));
        cache.set_at("catalog", "B01", b"v".to_vec(), &opts, now).unwrap();
        cache
            .set_at("catalog", "B02", b"v".to_vec(), &SetOptions::new().ttl_secs(3600), now)
            .unwrap();

        assert_eq!(cache.cleanup_expired_at(now + Duration::seconds(5)).unwrap(), 1);
        let stats = cache.stats().unwrap();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.search_documents, 0);
        assert_eq!(stats.cross_references, 0);
    }

    #[test]
    fn test_set_replaces_links_and_document() {
        let (_temp, cache) = create_test_cache();
        let opts = SetOptions::new()
            .external_id("B01")
            .searchable(SearchFields::new("Dune"));
        cache.set("catalog", "B01", b"v1".to_vec(), &opts).unwrap();
        cache.set("catalog", "B01", b"v2".to_vec(), &SetOptions::new()).unwrap();

        assert!(cache.search("dune", None).is_empty());
        assert!(cache.search_by_external_id("B01", None).is_empty());
        assert_eq!(cache.get("catalog", "B01"), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_empty_names_rejected() {
        let (_temp, cache) = create_test_cache();
        assert!(matches!(
            cache.set("", "k", b"v".to_vec(), &SetOptions::new()),
            Err(CacheError::Validation { .. })
        ));
        assert!(cache.set("ns", "", b"v".to_vec(), &SetOptions::new()).is_err());
    }
}
