//! Full-text search over entry titles and authors.
//!
//! Uses SQLite FTS5 for fast text search with:
//! - Punctuation-insensitive matching ("J.K." finds "JK")
//! - AND semantics across query tokens
//! - Ranking by match count, then recency

mod index;
mod query;

pub use index::{
    clear, count, index, remove, remove_namespace, search, SearchFields, SearchHit,
    SearchOutcome, SEARCH_TABLE,
};
pub(crate) use index::create_table_sql;
pub use query::{build_match_query, normalize_text, tokenize};
