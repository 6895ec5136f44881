//! # shelfcache
//!
//! Embedded cache and cross-reference layer for audiobook metadata tools.
//!
//! One SQLite file holds namespaced, TTL-bound entries, a full-text index over
//! their titles and authors, links from upstream ids to entries, and match
//! records between a local library and the marketplace. A bounded in-process
//! tier sits in front of it.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use shelfcache::{CacheSettings, SearchFields, SetOptions, ShelfCache};
//!
//! # fn main() -> shelfcache::Result<()> {
//! let cache = ShelfCache::open(CacheSettings::with_db_path("./data/cache/cache.db"))?;
//!
//! let options = SetOptions::new()
//!     .external_id("B08G9PRS1K")
//!     .searchable(SearchFields::new("Project Hail Mary").with_author("Andy Weir"));
//! cache.set("catalog", "B08G9PRS1K", br#"{"title":"Project Hail Mary"}"#.to_vec(), &options)?;
//!
//! assert!(cache.get("catalog", "B08G9PRS1K").is_some());
//! let hits = cache.search("hail mary", None);
//! # let _ = hits;
//!
//! // Drop everything any source cached for this id.
//! cache.delete_by_external_id("B08G9PRS1K")?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod memory;
pub mod pattern;
pub mod search;
pub mod store;
pub mod ttl;
pub mod xref;

// Re-export commonly used types
pub use cache::{CacheStats, SetOptions, ShelfCache, DEFAULT_SEARCH_LIMIT};
pub use codec::DecodedBatch;
pub use config::{CacheSettings, Namespaces};
pub use error::{CacheError, Result};
pub use invalidation::{InvalidationController, InvalidationReport};
pub use memory::{MemoryStats, MemoryTier};
pub use pattern::KeyPattern;
pub use search::{SearchFields, SearchHit};
pub use store::{CacheEntry, NamespaceStats, PersistentStore};
pub use ttl::TtlPolicy;
pub use xref::ItemMapping;
