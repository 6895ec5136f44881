//! Durable on-disk storage for cache entries.
//!
//! One SQLite file holds the entry table, the cross-reference table, the
//! full-text index and the item mapping table. Writes go through a single
//! connection guarded by a bounded-wait lock; reads use a small pool of
//! read-only connections so they never queue behind a writer.

pub(crate) mod entries;
mod schema;
mod sqlite;

pub(crate) use schema::ensure_schema;
pub use schema::{remove_storage_files, SCHEMA_VERSION};
pub use sqlite::{PersistentStore, WriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A stored cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub namespace: String,
    pub key: String,
    /// Opaque payload; the cache never interprets it.
    pub value: Vec<u8>,
    pub created_at: DateTime<Utc>,
    /// Always later than `created_at`.
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn size_bytes(&self) -> u64 {
        self.value.len() as u64
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Per-namespace counts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceStats {
    pub namespace: String,
    pub entry_count: usize,
    pub total_size_bytes: u64,
}

/// Timestamps are stored as unix epoch milliseconds.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// Collect mapped rows, logging and counting the ones that fail to decode
/// instead of aborting the whole batch.
pub(crate) fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    what: &str,
) -> (Vec<T>, usize) {
    let mut items = Vec::new();
    let mut skipped = 0;
    for row in rows {
        match row {
            Ok(item) => items.push(item),
            Err(e) => {
                skipped += 1;
                warn!("Skipping unreadable {} row: {}", what, e);
            }
        }
    }
    if skipped > 0 {
        warn!("Skipped {} unreadable {} rows", skipped, what);
    }
    (items, skipped)
}
