//! Row-level operations on `cache_entries`.
//!
//! Everything here takes a plain connection so it composes inside a write
//! transaction or runs on a read-only connection. Deleting an entry also
//! drops its search document; cross-references go with it through the
//! foreign key cascade.

use super::{collect_rows, from_millis, to_millis, CacheEntry, NamespaceStats};
use crate::error::{CacheError, Result};
use crate::search;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const ENTRY_COLUMNS: &str = "namespace, key, value, created_at, expires_at";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    let created_ms: i64 = row.get(3)?;
    let expires_ms: i64 = row.get(4)?;
    let created_at = from_millis(created_ms).ok_or_else(|| bad_timestamp(3, created_ms))?;
    let expires_at = from_millis(expires_ms).ok_or_else(|| bad_timestamp(4, expires_ms))?;
    Ok(CacheEntry {
        namespace: row.get(0)?,
        key: row.get(1)?,
        value: row.get(2)?,
        created_at,
        expires_at,
    })
}

fn bad_timestamp(column: usize, value: i64) -> rusqlite::Error {
    rusqlite::Error::IntegralValueOutOfRange(column, value)
}

/// Insert or overwrite an entry.
///
/// Uses an upsert rather than `INSERT OR REPLACE`, which would delete the
/// old row first and cascade away its cross-references.
pub fn upsert(conn: &Connection, entry: &CacheEntry) -> Result<()> {
    if entry.expires_at <= entry.created_at {
        return Err(CacheError::Validation {
            field: "expires_at".to_string(),
            message: format!(
                "{}/{} would expire before it was created",
                entry.namespace, entry.key
            ),
        });
    }

    conn.execute(
        "INSERT INTO cache_entries
             (namespace, key, value, created_at, expires_at, size_bytes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(namespace, key) DO UPDATE SET
             value = excluded.value,
             created_at = excluded.created_at,
             expires_at = excluded.expires_at,
             size_bytes = excluded.size_bytes",
        params![
            entry.namespace,
            entry.key,
            entry.value,
            to_millis(entry.created_at),
            to_millis(entry.expires_at),
            entry.size_bytes() as i64,
        ],
    )
    .map_err(|e| CacheError::storage("Failed to write cache entry", e))?;
    Ok(())
}

/// Fetch an entry that has not expired at `now`.
pub fn get_live(
    conn: &Connection,
    namespace: &str,
    key: &str,
    now: DateTime<Utc>,
) -> Result<Option<CacheEntry>> {
    let sql = format!(
        "SELECT {} FROM cache_entries
         WHERE namespace = ?1 AND key = ?2 AND expires_at > ?3",
        ENTRY_COLUMNS
    );
    conn.query_row(&sql, params![namespace, key, to_millis(now)], entry_from_row)
        .optional()
        .map_err(|e| CacheError::storage("Failed to read cache entry", e))
}

/// Live entries of one namespace whose key is in `keys`.
pub fn get_live_many(
    conn: &Connection,
    namespace: &str,
    keys: &[&str],
    now: DateTime<Utc>,
) -> Result<(Vec<CacheEntry>, usize)> {
    let sql = format!(
        "SELECT {} FROM cache_entries
         WHERE namespace = ?1 AND key = ?2 AND expires_at > ?3",
        ENTRY_COLUMNS
    );
    let mut stmt = conn
        .prepare_cached(&sql)
        .map_err(|e| CacheError::storage("Failed to prepare batch read", e))?;

    let now_ms = to_millis(now);
    let mut found = Vec::new();
    for key in keys {
        let row = stmt
            .query_row(params![namespace, key, now_ms], entry_from_row)
            .optional();
        match row {
            Ok(Some(entry)) => found.push(Ok(entry)),
            Ok(None) => {}
            Err(e @ rusqlite::Error::IntegralValueOutOfRange(..))
            | Err(e @ rusqlite::Error::InvalidColumnType(..)) => found.push(Err(e)),
            Err(e) => return Err(CacheError::storage("Failed to read cache entries", e)),
        }
    }
    Ok(collect_rows(found.into_iter(), "cache entry"))
}

/// Live entries of a namespace whose key matches a `GLOB` pattern.
pub fn scan_pattern(
    conn: &Connection,
    namespace: &str,
    glob: &str,
    now: DateTime<Utc>,
) -> Result<(Vec<CacheEntry>, usize)> {
    let sql = format!(
        "SELECT {} FROM cache_entries
         WHERE namespace = ?1 AND key GLOB ?2 AND expires_at > ?3
         ORDER BY key",
        ENTRY_COLUMNS
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| CacheError::storage("Failed to prepare pattern scan", e))?;
    let rows = stmt
        .query_map(params![namespace, glob, to_millis(now)], entry_from_row)
        .map_err(|e| CacheError::storage("Failed to scan cache entries", e))?;
    Ok(collect_rows(rows, "cache entry"))
}

/// Whether a live entry exists.
pub fn exists_live(conn: &Connection, namespace: &str, key: &str, now: DateTime<Utc>) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM cache_entries
             WHERE namespace = ?1 AND key = ?2 AND expires_at > ?3",
            params![namespace, key, to_millis(now)],
            |row| row.get(0),
        )
        .map_err(|e| CacheError::storage("Failed to check cache entry", e))?;
    Ok(count > 0)
}

/// Delete one entry with its search document. Returns whether a row existed.
pub fn delete(conn: &Connection, namespace: &str, key: &str) -> Result<bool> {
    search::remove(conn, namespace, key)?;
    let deleted = conn
        .execute(
            "DELETE FROM cache_entries WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        )
        .map_err(|e| CacheError::storage("Failed to delete cache entry", e))?;
    Ok(deleted > 0)
}

/// Delete every entry of a namespace whose key matches a `GLOB` pattern.
///
/// Returns the deleted keys, expired rows included.
pub fn delete_matching(conn: &Connection, namespace: &str, glob: &str) -> Result<Vec<String>> {
    let keys = {
        let mut stmt = conn
            .prepare("SELECT key FROM cache_entries WHERE namespace = ?1 AND key GLOB ?2")
            .map_err(|e| CacheError::storage("Failed to prepare pattern delete", e))?;
        let rows = stmt
            .query_map(params![namespace, glob], |row| row.get::<_, String>(0))
            .map_err(|e| CacheError::storage("Failed to scan cache keys", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CacheError::storage("Failed to scan cache keys", e))?
    };

    for key in &keys {
        delete(conn, namespace, key)?;
    }
    Ok(keys)
}

/// Delete a whole namespace. Returns the number of entries removed.
pub fn delete_namespace(conn: &Connection, namespace: &str) -> Result<usize> {
    search::remove_namespace(conn, namespace)?;
    conn.execute(
        "DELETE FROM cache_entries WHERE namespace = ?1",
        params![namespace],
    )
    .map_err(|e| CacheError::storage("Failed to clear namespace", e))
}

/// Delete every entry.
pub fn delete_all(conn: &Connection) -> Result<usize> {
    search::clear(conn)?;
    conn.execute("DELETE FROM cache_entries", [])
        .map_err(|e| CacheError::storage("Failed to clear cache", e))
}

/// Move the expiry of a live entry. Returns false for missing or expired rows.
pub fn update_expiry(
    conn: &Connection,
    namespace: &str,
    key: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let updated = conn
        .execute(
            "UPDATE cache_entries SET expires_at = ?3
             WHERE namespace = ?1 AND key = ?2 AND expires_at > ?4 AND created_at < ?3",
            params![namespace, key, to_millis(expires_at), to_millis(now)],
        )
        .map_err(|e| CacheError::storage("Failed to extend cache entry", e))?;
    Ok(updated > 0)
}

/// Delete expired entries. Returns the `(namespace, key)` pairs removed.
pub fn delete_expired(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<(String, String)>> {
    let expired = {
        let mut stmt = conn
            .prepare("SELECT namespace, key FROM cache_entries WHERE expires_at <= ?1")
            .map_err(|e| CacheError::storage("Failed to prepare expiry sweep", e))?;
        let rows = stmt
            .query_map(params![to_millis(now)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| CacheError::storage("Failed to scan expired entries", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CacheError::storage("Failed to scan expired entries", e))?
    };

    for (namespace, key) in &expired {
        delete(conn, namespace, key)?;
    }
    Ok(expired)
}

/// Total and expired row counts.
pub fn counts(conn: &Connection, now: DateTime<Utc>) -> Result<(usize, usize)> {
    conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN expires_at <= ?1 THEN 1 ELSE 0 END), 0)
         FROM cache_entries",
        params![to_millis(now)],
        |row| Ok((row.get::<_, i64>(0)? as usize, row.get::<_, i64>(1)? as usize)),
    )
    .map_err(|e| CacheError::storage("Failed to count cache entries", e))
}

/// Entry counts and payload sizes per namespace.
pub fn namespace_stats(conn: &Connection) -> Result<Vec<NamespaceStats>> {
    let mut stmt = conn
        .prepare(
            "SELECT namespace, COUNT(*), COALESCE(SUM(size_bytes), 0)
             FROM cache_entries GROUP BY namespace ORDER BY namespace",
        )
        .map_err(|e| CacheError::storage("Failed to prepare namespace stats", e))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(NamespaceStats {
                namespace: row.get(0)?,
                entry_count: row.get::<_, i64>(1)? as usize,
                total_size_bytes: row.get::<_, i64>(2)? as u64,
            })
        })
        .map_err(|e| CacheError::storage("Failed to read namespace stats", e))?;
    Ok(collect_rows(rows, "namespace stats").0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::ensure_schema;
    use chrono::Duration;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        ensure_schema(&conn).unwrap();
        conn
    }

    fn entry(namespace: &str, key: &str, now: DateTime<Utc>, ttl_secs: i64) -> CacheEntry {
        CacheEntry {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value: format!("{}:{}", namespace, key).into_bytes(),
            created_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let conn = test_conn();
        let now = Utc::now();
        upsert(&conn, &entry("catalog", "B01", now, 60)).unwrap();

        let found = get_live(&conn, "catalog", "B01", now).unwrap().unwrap();
        assert_eq!(found.value, b"catalog:B01");
        assert!(get_live(&conn, "library", "B01", now).unwrap().is_none());
    }

    #[test]
    fn test_upsert_overwrites() {
        let conn = test_conn();
        let now = Utc::now();
        upsert(&conn, &entry("catalog", "B01", now, 60)).unwrap();
        let mut newer = entry("catalog", "B01", now, 120);
        newer.value = b"newer".to_vec();
        upsert(&conn, &newer).unwrap();

        let found = get_live(&conn, "catalog", "B01", now).unwrap().unwrap();
        assert_eq!(found.value, b"newer");
        assert_eq!(counts(&conn, now).unwrap(), (1, 0));
    }

    #[test]
    fn test_upsert_rejects_inverted_expiry() {
        let conn = test_conn();
        let now = Utc::now();
        let bad = entry("catalog", "B01", now, 0);
        assert!(matches!(upsert(&conn, &bad), Err(CacheError::Validation { .. })));
    }

    #[test]
    fn test_expired_rows_invisible() {
        let conn = test_conn();
        let now = Utc::now();
        upsert(&conn, &entry("catalog", "B01", now, 5)).unwrap();

        let later = now + Duration::seconds(5);
        assert!(get_live(&conn, "catalog", "B01", later).unwrap().is_none());
        assert!(!exists_live(&conn, "catalog", "B01", later).unwrap());
        assert_eq!(counts(&conn, later).unwrap(), (1, 1));

        let removed = delete_expired(&conn, later).unwrap();
        assert_eq!(removed, vec![("catalog".to_string(), "B01".to_string())]);
        assert_eq!(counts(&conn, later).unwrap(), (0, 0));
    }

    #[test]
    fn test_pattern_scan_and_delete() {
        let conn = test_conn();
        let now = Utc::now();
        for key in ["wishlist_1", "wishlist_2", "item_1"] {
            upsert(&conn, &entry("library", key, now, 60)).unwrap();
        }
        upsert(&conn, &entry("catalog", "wishlist_1", now, 60)).unwrap();

        let (found, skipped) = scan_pattern(&conn, "library", "wishlist_*", now).unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(found.len(), 2);

        let deleted = delete_matching(&conn, "library", "wishlist_*").unwrap();
        assert_eq!(deleted.len(), 2);
        assert!(exists_live(&conn, "catalog", "wishlist_1", now).unwrap());
        assert!(exists_live(&conn, "library", "item_1", now).unwrap());
    }

    #[test]
    fn test_glob_is_case_sensitive() {
        let conn = test_conn();
        let now = Utc::now();
        upsert(&conn, &entry("catalog", "B08ABC", now, 60)).unwrap();
        assert!(delete_matching(&conn, "catalog", "b08*").unwrap().is_empty());
        assert_eq!(delete_matching(&conn, "catalog", "B08*").unwrap().len(), 1);
    }

    #[test]
    fn test_update_expiry() {
        let conn = test_conn();
        let now = Utc::now();
        upsert(&conn, &entry("catalog", "B01", now, 5)).unwrap();

        let extended = now + Duration::hours(1);
        assert!(update_expiry(&conn, "catalog", "B01", extended, now).unwrap());
        let later = now + Duration::seconds(30);
        assert!(exists_live(&conn, "catalog", "B01", later).unwrap());

        assert!(!update_expiry(&conn, "catalog", "missing", extended, now).unwrap());
    }

    #[test]
    fn test_namespace_stats() {
        let conn = test_conn();
        let now = Utc::now();
        upsert(&conn, &entry("catalog", "a", now, 60)).unwrap();
        upsert(&conn, &entry("catalog", "b", now, 60)).unwrap();
        upsert(&conn, &entry("library", "a", now, 60)).unwrap();

        let stats = namespace_stats(&conn).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].namespace, "catalog");
        assert_eq!(stats[0].entry_count, 2);
        assert_eq!(stats[0].total_size_bytes, ("catalog:a".len() * 2) as u64);

        assert_eq!(delete_namespace(&conn, "catalog").unwrap(), 2);
        assert_eq!(delete_all(&conn).unwrap(), 1);
    }
}
