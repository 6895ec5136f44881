//! Match records between local library items and marketplace listings.
//!
//! Mappings are match knowledge rather than cached data: they carry no TTL
//! and no invalidation path removes them.

use crate::error::{CacheError, Result};
use crate::store::{collect_rows, from_millis, to_millis};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// One local item matched (or partially matched) to a marketplace listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMapping {
    /// Primary id, usually the id found in the item's own metadata.
    pub external_id: String,
    /// Local server item id.
    pub local_id: Option<String>,
    pub local_path: Option<String>,
    /// Marketplace id, which may differ from `external_id`.
    pub remote_id: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    /// In `[0, 1]`.
    pub match_confidence: f64,
    pub matched_at: Option<DateTime<Utc>>,
}

impl ItemMapping {
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            local_id: None,
            local_path: None,
            remote_id: None,
            title: None,
            author: None,
            match_confidence: 1.0,
            matched_at: None,
        }
    }

    pub fn with_local(mut self, local_id: impl Into<String>, local_path: Option<String>) -> Self {
        self.local_id = Some(local_id.into());
        self.local_path = local_path;
        self
    }

    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.match_confidence = confidence;
        self
    }

    /// Whether the item is matched to a marketplace listing.
    pub fn is_matched(&self) -> bool {
        self.remote_id.is_some()
    }
}

const MAPPING_COLUMNS: &str =
    "external_id, local_id, local_path, remote_id, title, author, match_confidence, matched_at";

fn mapping_from_row(row: &Row<'_>) -> rusqlite::Result<ItemMapping> {
    let matched_ms: Option<i64> = row.get(7)?;
    Ok(ItemMapping {
        external_id: row.get(0)?,
        local_id: row.get(1)?,
        local_path: row.get(2)?,
        remote_id: row.get(3)?,
        title: row.get(4)?,
        author: row.get(5)?,
        match_confidence: row.get(6)?,
        matched_at: matched_ms.and_then(from_millis),
    })
}

/// Insert or update a mapping, stamping it with `now`.
///
/// Optional fields left as `None` keep their stored value; confidence is
/// clamped to `[0, 1]`.
pub fn upsert_mapping(conn: &Connection, mapping: &ItemMapping, now: DateTime<Utc>) -> Result<()> {
    if mapping.external_id.is_empty() {
        return Err(CacheError::Validation {
            field: "external_id".to_string(),
            message: "mapping needs an external id".to_string(),
        });
    }
    if !mapping.match_confidence.is_finite() {
        return Err(CacheError::Validation {
            field: "match_confidence".to_string(),
            message: format!("{} is not a valid confidence", mapping.match_confidence),
        });
    }

    conn.execute(
        "INSERT INTO item_mapping
             (external_id, local_id, local_path, remote_id, title, author, match_confidence, matched_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(external_id) DO UPDATE SET
             local_id = COALESCE(excluded.local_id, item_mapping.local_id),
             local_path = COALESCE(excluded.local_path, item_mapping.local_path),
             remote_id = COALESCE(excluded.remote_id, item_mapping.remote_id),
             title = COALESCE(excluded.title, item_mapping.title),
             author = COALESCE(excluded.author, item_mapping.author),
             match_confidence = excluded.match_confidence,
             matched_at = excluded.matched_at",
        params![
            mapping.external_id,
            mapping.local_id,
            mapping.local_path,
            mapping.remote_id,
            mapping.title,
            mapping.author,
            mapping.match_confidence.clamp(0.0, 1.0),
            to_millis(now),
        ],
    )
    .map_err(|e| CacheError::storage("Failed to store item mapping", e))?;
    Ok(())
}

pub fn get_mapping(conn: &Connection, external_id: &str) -> Result<Option<ItemMapping>> {
    let sql = format!("SELECT {} FROM item_mapping WHERE external_id = ?1", MAPPING_COLUMNS);
    conn.query_row(&sql, params![external_id], mapping_from_row)
        .optional()
        .map_err(|e| CacheError::storage("Failed to read item mapping", e))
}

pub fn get_mapping_by_local_id(conn: &Connection, local_id: &str) -> Result<Option<ItemMapping>> {
    let sql = format!("SELECT {} FROM item_mapping WHERE local_id = ?1", MAPPING_COLUMNS);
    conn.query_row(&sql, params![local_id], mapping_from_row)
        .optional()
        .map_err(|e| CacheError::storage("Failed to read item mapping", e))
}

pub fn delete_mapping(conn: &Connection, external_id: &str) -> Result<bool> {
    let deleted = conn
        .execute(
            "DELETE FROM item_mapping WHERE external_id = ?1",
            params![external_id],
        )
        .map_err(|e| CacheError::storage("Failed to delete item mapping", e))?;
    Ok(deleted > 0)
}

/// Keys of live entries in `namespace` not yet matched to a listing.
pub fn unmapped_local_ids(conn: &Connection, namespace: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT e.key FROM cache_entries e
             LEFT JOIN item_mapping m ON m.local_id = e.key
             WHERE e.namespace = ?1 AND e.expires_at > ?2 AND m.remote_id IS NULL
             ORDER BY e.key",
        )
        .map_err(|e| CacheError::storage("Failed to prepare unmapped lookup", e))?;
    let rows = stmt
        .query_map(params![namespace, to_millis(now)], |row| row.get(0))
        .map_err(|e| CacheError::storage("Failed to list unmapped items", e))?;
    Ok(collect_rows(rows, "cache entry").0)
}

/// Total mappings and how many of them are matched.
pub fn mapping_counts(conn: &Connection) -> Result<(usize, usize)> {
    conn.query_row(
        "SELECT COUNT(*), COUNT(remote_id) FROM item_mapping",
        [],
        |row| Ok((row.get::<_, i64>(0)? as usize, row.get::<_, i64>(1)? as usize)),
    )
    .map_err(|e| CacheError::storage("Failed to count item mappings", e))
}
