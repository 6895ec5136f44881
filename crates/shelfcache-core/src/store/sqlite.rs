//! SQLite-backed persistent store.

use super::schema::ensure_schema;
use crate::config::CacheSettings;
use crate::error::{CacheError, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Durable store shared by every cache operation.
///
/// All writes funnel through one connection behind a mutex with a bounded
/// wait, so two logical writes never interleave. Reads use separate
/// read-only connections; under WAL they see the last committed state and
/// never block on the writer.
pub struct PersistentStore {
    db_path: PathBuf,
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    write_timeout: Duration,
    reads: AtomicU64,
}

/// Exclusive hold on the write path.
///
/// While a guard is alive no other write can start; callers update the
/// memory tier before dropping it so memory follows commit order.
pub struct WriteGuard<'a> {
    conn: MutexGuard<'a, Connection>,
}

impl WriteGuard<'_> {
    /// Run `f` in an immediate transaction, committing on success.
    ///
    /// On error the transaction is rolled back and nothing is applied.
    pub fn apply<T>(&mut self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| CacheError::storage("Failed to begin write", e))?;
        let value = f(&tx)?;
        tx.commit()
            .map_err(|e| CacheError::storage("Failed to commit write", e))?;
        Ok(value)
    }
}

impl PersistentStore {
    /// Open (or create) the store described by `settings`.
    ///
    /// Fails with [`CacheError::SchemaMismatch`] if the file holds a layout
    /// this version does not understand.
    pub fn open(settings: &CacheSettings) -> Result<Self> {
        let db_path = settings.db_path.as_path();

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::Io {
                message: format!("Failed to create cache directory: {}", e),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }

        let writer = Connection::open(db_path)
            .map_err(|e| CacheError::storage("Failed to open cache database", e))?;
        writer
            .busy_timeout(settings.busy_timeout())
            .map_err(|e| CacheError::storage("Failed to set busy timeout", e))?;
        writer
            .execute_batch(
                "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
            )
            .map_err(|e| CacheError::storage("Failed to set pragmas", e))?;
        ensure_schema(&writer)?;

        let readers = (0..settings.reader_connections.max(1))
            .map(|_| open_reader(db_path, settings.busy_timeout()).map(Mutex::new))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Opened cache store at {} ({} readers)",
            db_path.display(),
            readers.len()
        );

        Ok(Self {
            db_path: db_path.to_path_buf(),
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
            write_timeout: settings.write_timeout(),
            reads: AtomicU64::new(0),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Size of the main database file in bytes.
    pub fn file_size(&self) -> u64 {
        std::fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0)
    }

    /// Number of reads that reached the store.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Take the write path, waiting at most the configured timeout.
    pub fn begin_write(&self) -> Result<WriteGuard<'_>> {
        match self.writer.try_lock_for(self.write_timeout) {
            Some(conn) => Ok(WriteGuard { conn }),
            None => {
                warn!("Write path busy for {:?}, giving up", self.write_timeout);
                Err(CacheError::LockTimeout(self.write_timeout))
            }
        }
    }

    /// Run one write transaction.
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        self.begin_write()?.apply(f)
    }

    /// Run one write transaction, then `after_commit` with its outcome while
    /// the write path is still held.
    ///
    /// `after_commit` only runs when the transaction committed.
    pub fn write_then<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T>,
        after_commit: impl FnOnce(&T),
    ) -> Result<T> {
        let mut guard = self.begin_write()?;
        let outcome = guard.apply(f)?;
        after_commit(&outcome);
        drop(guard);
        Ok(outcome)
    }

    /// Run `f` on a read-only connection.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.reads.fetch_add(1, Ordering::Relaxed);

        let count = self.readers.len();
        let start = self.next_reader.fetch_add(1, Ordering::Relaxed) % count;

        // Prefer any idle reader; otherwise wait on our turn's connection.
        for offset in 0..count {
            if let Some(conn) = self.readers[(start + offset) % count].try_lock() {
                return f(&conn);
            }
        }
        match self.readers[start].try_lock_for(self.write_timeout) {
            Some(conn) => f(&conn),
            None => Err(CacheError::LockTimeout(self.write_timeout)),
        }
    }
}

fn open_reader(db_path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| CacheError::storage("Failed to open cache reader", e))?;
    conn.busy_timeout(busy_timeout)
        .map_err(|e| CacheError::storage("Failed to set busy timeout", e))?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{entries, CacheEntry};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, PersistentStore) {
        let temp = TempDir::new().unwrap();
        let settings = CacheSettings {
            write_timeout_ms: 100,
            ..CacheSettings::with_db_path(temp.path().join("cache.db"))
        };
        let store = PersistentStore::open(&settings).unwrap();
        (temp, store)
    }

    fn sample(key: &str) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            namespace: "catalog".to_string(),
            key: key.to_string(),
            value: b"payload".to_vec(),
            created_at: now,
            expires_at: now + ChronoDuration::hours(1),
        }
    }

    #[test]
    fn test_open_creates_directories() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("dir").join("cache.db");
        let store = PersistentStore::open(&CacheSettings::with_db_path(&path)).unwrap();
        assert!(path.exists());
        assert_eq!(store.db_path(), path.as_path());
        assert!(store.file_size() > 0);
    }

    #[test]
    fn test_write_visible_to_readers() {
        let (_temp, store) = create_test_store();
        store.write(|tx| entries::upsert(tx, &sample("B01"))).unwrap();

        let found = store
            .read(|conn| entries::get_live(conn, "catalog", "B01", Utc::now()))
            .unwrap();
        assert!(found.is_some());
        assert_eq!(store.read_count(), 1);
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let (_temp, store) = create_test_store();
        let result: Result<()> = store.write(|tx| {
            entries::upsert(tx, &sample("B01"))?;
            Err(CacheError::Validation {
                field: "test".into(),
                message: "abort".into(),
            })
        });
        assert!(result.is_err());

        let found = store
            .read(|conn| entries::get_live(conn, "catalog", "B01", Utc::now()))
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_write_lock_timeout() {
        let (_temp, store) = create_test_store();
        let store = Arc::new(store);
        let guard = store.begin_write().unwrap();

        let contender = Arc::clone(&store);
        let result = std::thread::spawn(move || contender.write(|_| Ok(())).map(|_| ()))
            .join()
            .unwrap();
        assert!(matches!(result, Err(CacheError::LockTimeout(_))));

        drop(guard);
        assert!(store.write(|_| Ok(())).is_ok());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let temp = TempDir::new().unwrap();
        let settings = CacheSettings::with_db_path(temp.path().join("cache.db"));
        {
            let store = PersistentStore::open(&settings).unwrap();
            store.write(|tx| entries::upsert(tx, &sample("B01"))).unwrap();
        }

        let store = PersistentStore::open(&settings).unwrap();
        let found = store
            .read(|conn| entries::get_live(conn, "catalog", "B01", Utc::now()))
            .unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn test_open_rejects_foreign_layout() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE asin_mapping (asin TEXT PRIMARY KEY);")
                .unwrap();
        }

        let result = PersistentStore::open(&CacheSettings::with_db_path(&path));
        assert!(matches!(result, Err(CacheError::SchemaMismatch { .. })));
    }
}
