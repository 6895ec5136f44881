//! Cross-references from external identifiers to cache entries.
//!
//! A row links an upstream id (a marketplace catalog id, a local server item
//! id) to one `(namespace, key)` entry. Rows reference `cache_entries`
//! through a cascading foreign key, so deleting an entry always drops its
//! links; nothing here needs to clean up after entry deletion.

mod mapping;

pub use mapping::{
    delete_mapping, get_mapping, get_mapping_by_local_id, mapping_counts, unmapped_local_ids,
    upsert_mapping, ItemMapping,
};

use crate::error::{CacheError, Result};
use crate::store::collect_rows;
use rusqlite::{params, Connection, OptionalExtension};

/// Link an entry to an external id.
///
/// Returns false if the entry does not exist; links to missing entries are
/// never created.
pub fn associate(conn: &Connection, namespace: &str, key: &str, external_id: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM cache_entries WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
            |_| Ok(()),
        )
        .optional()
        .map_err(|e| CacheError::storage("Failed to look up cache entry", e))?
        .is_some();
    if !exists {
        return Ok(false);
    }

    conn.execute(
        "INSERT OR IGNORE INTO cache_xref (external_id, namespace, key) VALUES (?1, ?2, ?3)",
        params![external_id, namespace, key],
    )
    .map_err(|e| CacheError::storage("Failed to associate external id", e))?;
    Ok(true)
}

/// Replace every link of an entry with at most one new link.
pub fn replace_for_entry(
    conn: &Connection,
    namespace: &str,
    key: &str,
    external_id: Option<&str>,
) -> Result<()> {
    conn.execute(
        "DELETE FROM cache_xref WHERE namespace = ?1 AND key = ?2",
        params![namespace, key],
    )
    .map_err(|e| CacheError::storage("Failed to clear cross-references", e))?;
    if let Some(external_id) = external_id {
        associate(conn, namespace, key, external_id)?;
    }
    Ok(())
}

/// Every `(namespace, key)` linked to an external id.
pub fn resolve(conn: &Connection, external_id: &str) -> Result<Vec<(String, String)>> {
    let mut stmt = conn
        .prepare(
            "SELECT namespace, key FROM cache_xref WHERE external_id = ?1 ORDER BY namespace, key",
        )
        .map_err(|e| CacheError::storage("Failed to prepare cross-reference lookup", e))?;
    let rows = stmt
        .query_map(params![external_id], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| CacheError::storage("Failed to resolve external id", e))?;
    Ok(collect_rows(rows, "cross-reference").0)
}

/// External ids linked to one entry.
pub fn external_ids_for(conn: &Connection, namespace: &str, key: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT external_id FROM cache_xref
             WHERE namespace = ?1 AND key = ?2 ORDER BY external_id",
        )
        .map_err(|e| CacheError::storage("Failed to prepare cross-reference lookup", e))?;
    let rows = stmt
        .query_map(params![namespace, key], |row| row.get(0))
        .map_err(|e| CacheError::storage("Failed to read cross-references", e))?;
    Ok(collect_rows(rows, "cross-reference").0)
}

/// Drop every link of an external id, leaving the entries in place.
pub fn disassociate_all(conn: &Connection, external_id: &str) -> Result<usize> {
    conn.execute(
        "DELETE FROM cache_xref WHERE external_id = ?1",
        params![external_id],
    )
    .map_err(|e| CacheError::storage("Failed to drop cross-references", e))
}

pub fn count(conn: &Connection) -> Result<usize> {
    conn.query_row("SELECT COUNT(*) FROM cache_xref", [], |row| row.get::<_, i64>(0))
        .map(|n| n as usize)
        .map_err(|e| CacheError::storage("Failed to count cross-references", e))
}
