//! Coordinated removal across the memory tier, entries, search documents
//! and cross-references.
//!
//! Every operation runs as one write transaction. The memory tier is only
//! updated after the commit and before the write path is released, so a
//! rolled-back operation leaves memory untouched and memory never holds a
//! row the store no longer has.

use crate::error::Result;
use crate::memory::MemoryTier;
use crate::pattern::KeyPattern;
use crate::store::{entries, PersistentStore};
use crate::ttl::TtlPolicy;
use crate::xref;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Entries removed by one invalidation, per namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationReport {
    pub removed: BTreeMap<String, usize>,
}

impl InvalidationReport {
    fn record(&mut self, namespace: &str, count: usize) {
        if count > 0 {
            *self.removed.entry(namespace.to_string()).or_insert(0) += count;
        }
    }

    pub fn total(&self) -> usize {
        self.removed.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }

    /// Entries removed from one namespace.
    pub fn count_for(&self, namespace: &str) -> usize {
        self.removed.get(namespace).copied().unwrap_or(0)
    }
}

/// The mutating surface of the cache apart from `set`.
pub struct InvalidationController<'a> {
    store: &'a PersistentStore,
    memory: &'a MemoryTier,
    ttl: &'a TtlPolicy,
    pricing_namespaces: &'a [String],
}

impl<'a> InvalidationController<'a> {
    pub fn new(
        store: &'a PersistentStore,
        memory: &'a MemoryTier,
        ttl: &'a TtlPolicy,
        pricing_namespaces: &'a [String],
    ) -> Self {
        Self {
            store,
            memory,
            ttl,
            pricing_namespaces,
        }
    }

    /// Remove one entry. Returns false if it did not exist.
    pub fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        self.store.write_then(
            |tx| entries::delete(tx, namespace, key),
            |_| {
                self.memory.delete(namespace, key);
            },
        )
    }

    /// Remove every key in `namespace` matching a shell-style glob.
    pub fn delete_by_pattern(&self, namespace: &str, glob: &str) -> Result<usize> {
        let pattern = KeyPattern::new(glob)?;
        let removed = self.store.write_then(
            |tx| entries::delete_matching(tx, namespace, pattern.as_glob()),
            |removed| {
                self.memory
                    .delete_many(removed.iter().map(|key| (namespace, key.as_str())));
            },
        )?;
        debug!("Removed {} entries matching {}/{}", removed.len(), namespace, glob);
        Ok(removed.len())
    }

    /// Remove every entry linked to an external id, in any namespace.
    pub fn delete_by_external_id(&self, external_id: &str) -> Result<InvalidationReport> {
        let removed = self.store.write_then(
            |tx| {
                let linked = xref::resolve(tx, external_id)?;
                let mut removed = Vec::with_capacity(linked.len());
                for (namespace, key) in linked {
                    if entries::delete(tx, &namespace, &key)? {
                        removed.push((namespace, key));
                    }
                }
                Ok(removed)
            },
            |removed| self.evict(removed),
        )?;

        let report = report_for(&removed);
        debug!("Invalidated {} entries for external id {}", report.total(), external_id);
        Ok(report)
    }

    /// Remove an entry and, in each of `related_namespaces`, every entry
    /// sharing one of its external ids.
    ///
    /// Without a cross-reference only the primary entry is removed.
    pub fn invalidate_related(
        &self,
        namespace: &str,
        key: &str,
        related_namespaces: &[&str],
    ) -> Result<InvalidationReport> {
        let removed = self.store.write_then(
            |tx| {
                // Read links first; deleting the entry cascades them away.
                let external_ids = xref::external_ids_for(tx, namespace, key)?;
                let mut removed = Vec::new();
                if entries::delete(tx, namespace, key)? {
                    removed.push((namespace.to_string(), key.to_string()));
                }

                for external_id in &external_ids {
                    for (ns, k) in xref::resolve(tx, external_id)? {
                        if related_namespaces.contains(&ns.as_str()) && entries::delete(tx, &ns, &k)? {
                            removed.push((ns, k));
                        }
                    }
                }
                Ok(removed)
            },
            |removed| {
                self.memory.delete(namespace, key);
                self.evict(removed);
            },
        )?;

        let report = report_for(&removed);
        debug!("Invalidated {}/{}: {} entries removed", namespace, key, report.total());
        Ok(report)
    }

    /// Recompute the expiry of a live entry without changing its value.
    ///
    /// Returns false if the entry is missing or already expired.
    pub fn touch(&self, namespace: &str, key: &str, ttl_secs: Option<u64>, now: DateTime<Utc>) -> Result<bool> {
        let expires_at = self.ttl.expires_at(namespace, ttl_secs, now);
        self.store.write_then(
            |tx| entries::update_expiry(tx, namespace, key, expires_at, now),
            |touched| {
                if *touched {
                    self.memory.touch(namespace, key, expires_at);
                } else {
                    self.memory.delete(namespace, key);
                }
            },
        )
    }

    /// Remove every entry, search document and cross-reference of a namespace.
    pub fn clear_namespace(&self, namespace: &str) -> Result<usize> {
        let removed = self.store.write_then(
            |tx| entries::delete_namespace(tx, namespace),
            |_| {
                self.memory.delete_namespace(namespace);
            },
        )?;
        info!("Cleared {} entries from namespace {}", removed, namespace);
        Ok(removed)
    }

    /// Clear every configured pricing namespace.
    ///
    /// Not scoped to a marketplace or locale.
    pub fn clear_pricing(&self) -> Result<InvalidationReport> {
        let report = self.store.write_then(
            |tx| {
                let mut report = InvalidationReport::default();
                for namespace in self.pricing_namespaces {
                    report.record(namespace, entries::delete_namespace(tx, namespace)?);
                }
                Ok(report)
            },
            |_| {
                for namespace in self.pricing_namespaces {
                    self.memory.delete_namespace(namespace);
                }
            },
        )?;
        info!("Cleared {} pricing entries", report.total());
        Ok(report)
    }

    /// Remove every cached entry. Item mappings are kept.
    pub fn clear_all(&self) -> Result<usize> {
        let removed = self.store.write_then(
            |tx| entries::delete_all(tx),
            |_| {
                self.memory.clear();
            },
        )?;
        info!("Cleared {} cache entries", removed);
        Ok(removed)
    }

    /// Delete every expired entry with its dependent rows.
    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.store.write_then(
            |tx| entries::delete_expired(tx, now),
            |removed| {
                self.evict(removed);
                self.memory.purge_expired(now);
            },
        )?;
        if !removed.is_empty() {
            info!("Cleaned up {} expired cache entries", removed.len());
        }
        Ok(removed.len())
    }

    fn evict(&self, removed: &[(String, String)]) {
        self.memory
            .delete_many(removed.iter().map(|(ns, key)| (ns.as_str(), key.as_str())));
    }
}

fn report_for(removed: &[(String, String)]) -> InvalidationReport {
    let mut report = InvalidationReport::default();
    for (namespace, _) in removed {
        report.record(namespace, 1);
    }
    report
}
