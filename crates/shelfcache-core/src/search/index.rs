//! FTS5-backed search documents.
//!
//! One row per searchable entry, holding normalized title and author text.
//! Callers run these inside the same transaction as the entry write or
//! delete they accompany.

use super::query::{build_match_query, match_count, normalize_text, tokenize};
use crate::error::{CacheError, Result};
use crate::store::{collect_rows, from_millis, to_millis};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Name of the FTS5 virtual table.
pub const SEARCH_TABLE: &str = "cache_search";

// Diacritics are kept so FTS tokens equal the tokens used for scoring.
const TOKENIZER: &str = "unicode61 remove_diacritics 0";

/// Human-readable fields indexed for an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFields {
    pub title: Option<String>,
    pub author: Option<String>,
}

impl SearchFields {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            author: None,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    fn normalized(&self) -> (String, String) {
        (
            self.title.as_deref().map(normalize_text).unwrap_or_default(),
            self.author.as_deref().map(normalize_text).unwrap_or_default(),
        )
    }
}

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub namespace: String,
    pub key: String,
    pub value: Vec<u8>,
    /// Occurrences of query tokens in the indexed fields.
    pub score: usize,
    pub created_at: DateTime<Utc>,
}

/// Hits plus the number of rows that could not be read.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    pub skipped: usize,
}

pub(crate) fn create_table_sql() -> String {
    format!(
        "CREATE VIRTUAL TABLE {} USING fts5(
            namespace UNINDEXED,
            key UNINDEXED,
            title,
            author,
            tokenize='{}'
        )",
        SEARCH_TABLE, TOKENIZER
    )
}

/// Index (or re-index) an entry. Fields that normalize to nothing leave the
/// entry without a document.
pub fn index(conn: &Connection, namespace: &str, key: &str, fields: &SearchFields) -> Result<bool> {
    remove(conn, namespace, key)?;

    let (title, author) = fields.normalized();
    if title.is_empty() && author.is_empty() {
        return Ok(false);
    }

    conn.execute(
        "INSERT INTO cache_search (namespace, key, title, author) VALUES (?1, ?2, ?3, ?4)",
        params![namespace, key, title, author],
    )
    .map_err(|e| CacheError::storage("Failed to index cache entry", e))?;
    Ok(true)
}

/// Remove an entry's document. Returns the number of rows removed.
pub fn remove(conn: &Connection, namespace: &str, key: &str) -> Result<usize> {
    conn.execute(
        "DELETE FROM cache_search WHERE namespace = ?1 AND key = ?2",
        params![namespace, key],
    )
    .map_err(|e| CacheError::storage("Failed to remove search document", e))
}

pub fn remove_namespace(conn: &Connection, namespace: &str) -> Result<usize> {
    conn.execute("DELETE FROM cache_search WHERE namespace = ?1", params![namespace])
        .map_err(|e| CacheError::storage("Failed to remove search documents", e))
}

pub fn clear(conn: &Connection) -> Result<usize> {
    conn.execute("DELETE FROM cache_search", [])
        .map_err(|e| CacheError::storage("Failed to clear search index", e))
}

pub fn count(conn: &Connection) -> Result<usize> {
    conn.query_row("SELECT COUNT(*) FROM cache_search", [], |row| row.get::<_, i64>(0))
        .map(|n| n as usize)
        .map_err(|e| CacheError::storage("Failed to count search documents", e))
}

/// Live entries whose indexed fields contain every query token, ranked by
/// token match count and then by recency.
pub fn search(
    conn: &Connection,
    query: &str,
    namespace: Option<&str>,
    limit: usize,
    now: DateTime<Utc>,
) -> Result<SearchOutcome> {
    let Some(match_query) = build_match_query(query) else {
        return Ok(SearchOutcome::default());
    };
    let tokens = tokenize(query);

    let sql = "SELECT cache_search.namespace, cache_search.key,
                      cache_search.title, cache_search.author,
                      e.value, e.created_at
               FROM cache_search
               JOIN cache_entries e
                 ON e.namespace = cache_search.namespace AND e.key = cache_search.key
               WHERE cache_search MATCH ?1
                 AND e.expires_at > ?2
                 AND (?3 IS NULL OR cache_search.namespace = ?3)";

    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| CacheError::storage("Failed to prepare search", e))?;
    let rows = stmt
        .query_map(params![match_query, to_millis(now), namespace], |row| {
            let title: String = row.get(2)?;
            let author: String = row.get(3)?;
            let created_ms: i64 = row.get(5)?;
            let created_at = from_millis(created_ms)
                .ok_or(rusqlite::Error::IntegralValueOutOfRange(5, created_ms))?;
            Ok(SearchHit {
                namespace: row.get(0)?,
                key: row.get(1)?,
                value: row.get(4)?,
                score: match_count(&tokens, &[&title, &author]),
                created_at,
            })
        })
        .map_err(|e| CacheError::storage("Failed to run search", e))?;

    let (mut hits, skipped) = collect_rows(rows, "search");
    hits.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(b.created_at.cmp(&a.created_at))
            .then_with(|| a.namespace.cmp(&b.namespace))
            .then_with(|| a.key.cmp(&b.key))
    });
    hits.truncate(limit);

    debug!("Search '{}' matched {} entries", query, hits.len());
    Ok(SearchOutcome { hits, skipped })
}
