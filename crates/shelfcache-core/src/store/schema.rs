//! Schema creation and version checks.

use crate::error::{CacheError, Result};
use crate::search;
use rusqlite::Connection;
use std::path::Path;
use tracing::{debug, info};

/// Layout version recorded in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

/// Tables every version-1 file must contain.
const REQUIRED_TABLES: [&str; 4] = [
    "cache_entries",
    "cache_xref",
    search::SEARCH_TABLE,
    "item_mapping",
];

const CREATE_TABLES: &str = r#"
    -- Cache entries; timestamps are epoch milliseconds
    CREATE TABLE cache_entries (
        namespace TEXT NOT NULL,
        key TEXT NOT NULL,
        value BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        size_bytes INTEGER NOT NULL,
        PRIMARY KEY (namespace, key),
        CHECK (expires_at > created_at)
    );

    CREATE INDEX idx_cache_expires ON cache_entries(expires_at);

    -- External id -> entry links, removed with their entry
    CREATE TABLE cache_xref (
        external_id TEXT NOT NULL,
        namespace TEXT NOT NULL,
        key TEXT NOT NULL,
        PRIMARY KEY (external_id, namespace, key),
        FOREIGN KEY (namespace, key)
            REFERENCES cache_entries(namespace, key) ON DELETE CASCADE
    );

    CREATE INDEX idx_xref_entry ON cache_xref(namespace, key);

    -- Long-lived mapping between the local server and the marketplace
    CREATE TABLE item_mapping (
        external_id TEXT PRIMARY KEY,
        local_id TEXT UNIQUE,
        local_path TEXT,
        remote_id TEXT,
        title TEXT,
        author TEXT,
        match_confidence REAL NOT NULL DEFAULT 0,
        matched_at INTEGER
    );

    CREATE INDEX idx_mapping_remote ON item_mapping(remote_id);
"#;

/// Create the schema on a fresh file, or verify an existing one.
///
/// Fails with [`CacheError::SchemaMismatch`] on an unknown version or on a
/// file holding tables from some other layout; nothing is migrated.
pub fn ensure_schema(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| CacheError::storage("Failed to read schema version", e))?;

    match version {
        0 => {
            let existing = user_tables(conn)?;
            if !existing.is_empty() {
                return Err(CacheError::SchemaMismatch {
                    found: format!("unversioned tables [{}]", existing.join(", ")),
                    expected: format!("version {}", SCHEMA_VERSION),
                });
            }
            create_schema(conn)
        }
        SCHEMA_VERSION => {
            let existing = user_tables(conn)?;
            let missing: Vec<&str> = REQUIRED_TABLES
                .iter()
                .copied()
                .filter(|table| !existing.iter().any(|t| t == table))
                .collect();
            if !missing.is_empty() {
                return Err(CacheError::SchemaMismatch {
                    found: format!("version {} missing [{}]", version, missing.join(", ")),
                    expected: format!("version {}", SCHEMA_VERSION),
                });
            }
            debug!("Cache schema version {} verified", version);
            Ok(())
        }
        other => Err(CacheError::SchemaMismatch {
            found: format!("version {}", other),
            expected: format!("version {}", SCHEMA_VERSION),
        }),
    }
}

fn create_schema(conn: &Connection) -> Result<()> {
    let sql = format!(
        "BEGIN;\n{}\n{};\nPRAGMA user_version = {};\nCOMMIT;",
        CREATE_TABLES,
        search::create_table_sql(),
        SCHEMA_VERSION
    );
    if let Err(e) = conn.execute_batch(&sql) {
        // Leave the file untouched on failure.
        let _ = conn.execute_batch("ROLLBACK;");
        return Err(CacheError::storage("Failed to initialize cache schema", e));
    }
    info!("Created cache schema version {}", SCHEMA_VERSION);
    Ok(())
}

/// Names of user tables, ignoring SQLite internals and FTS5 shadow tables.
fn user_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table'
               AND name NOT LIKE 'sqlite_%'
               AND name NOT LIKE ?1
             ORDER BY name",
        )
        .map_err(|e| CacheError::storage("Failed to list tables", e))?;
    let shadow = format!("{}_%", search::SEARCH_TABLE);
    let names = stmt
        .query_map([shadow], |row| row.get::<_, String>(0))
        .map_err(|e| CacheError::storage("Failed to list tables", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| CacheError::storage("Failed to list tables", e))?;
    Ok(names)
}

/// Delete the storage file and its WAL side files.
pub fn remove_storage_files(db_path: impl AsRef<Path>) -> Result<()> {
    let db_path = db_path.as_ref();
    let mut candidates = vec![db_path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut name = db_path.as_os_str().to_owned();
        name.push(suffix);
        candidates.push(name.into());
    }

    for path in candidates {
        match std::fs::remove_file(&path) {
            Ok(()) => info!("Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::io_with_path(e, path)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fresh_file_gets_schema() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();

        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
        assert_eq!(user_tables(&conn).unwrap().len(), REQUIRED_TABLES.len());

        // Second open is a no-op.
        ensure_schema(&conn).unwrap();
    }

    #[test]
    fn test_legacy_tables_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE cache (namespace TEXT, key TEXT, value TEXT);")
            .unwrap();

        let err = ensure_schema(&conn).unwrap_err();
        assert!(matches!(err, CacheError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_future_version_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA user_version = 9;").unwrap();

        match ensure_schema(&conn) {
            Err(CacheError::SchemaMismatch { found, .. }) => assert_eq!(found, "version 9"),
            other => panic!("expected schema mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_remove_storage_files() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("cache.db");
        std::fs::write(&db, b"x").unwrap();
        std::fs::write(temp.path().join("cache.db-wal"), b"x").unwrap();

        remove_storage_files(&db).unwrap();
        assert!(!db.exists());
        assert!(!temp.path().join("cache.db-wal").exists());

        // Missing files are fine.
        remove_storage_files(&db).unwrap();
    }
}
