//! Bounded in-process tier in front of the persistent store.
//!
//! The tier only ever holds copies of committed rows. It never calls the
//! store itself; the façade falls through on a miss and warms the tier with
//! [`MemoryTier::warm`]. Dropping every entry is always safe.
//!
//! Every mutation bumps a generation counter. A reader records the
//! generation before its store round-trip and warms only if nothing changed
//! meanwhile, so a value read just before an invalidation cannot be
//! resurrected into the tier after it.

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

type TierKey = (String, String);

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at: DateTime<Utc>,
}

struct TierState {
    entries: LruCache<TierKey, MemoryEntry>,
    generation: u64,
}

/// Counters for the memory tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// LRU-bounded hot-entry cache keyed by `(namespace, key)`.
pub struct MemoryTier {
    /// `None` when the configured capacity is zero.
    state: Option<Mutex<TierState>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryTier {
    pub fn new(capacity: usize) -> Self {
        let state = NonZeroUsize::new(capacity).map(|cap| {
            Mutex::new(TierState {
                entries: LruCache::new(cap),
                generation: 0,
            })
        });

        Self {
            state,
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_some()
    }

    /// Current mutation generation.
    pub fn generation(&self) -> u64 {
        self.state
            .as_ref()
            .map(|state| state.lock().generation)
            .unwrap_or(0)
    }

    /// Look up a live value. Expired entries are dropped on sight.
    pub fn get(&self, namespace: &str, key: &str, now: DateTime<Utc>) -> Option<Vec<u8>> {
        let Some(state) = &self.state else {
            return None;
        };
        let tier_key = (namespace.to_string(), key.to_string());

        let mut state = state.lock();
        let lookup = state
            .entries
            .get(&tier_key)
            .map(|entry| (entry.expires_at > now).then(|| entry.value.clone()));
        let found = match lookup {
            Some(Some(value)) => Some(value),
            Some(None) => {
                state.entries.pop(&tier_key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        };
        drop(state);

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Store a freshly committed value.
    pub fn put(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let Some(state) = &self.state else {
            return;
        };
        let mut state = state.lock();
        state.generation += 1;
        self.insert_locked(&mut state, namespace, key, value, expires_at, now);
    }

    /// Store a value read from the persistent store, unless the tier was
    /// mutated after `observed_generation` was taken.
    pub fn warm(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        expires_at: DateTime<Utc>,
        observed_generation: u64,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(state) = &self.state else {
            return false;
        };
        let mut state = state.lock();
        if state.generation != observed_generation {
            return false;
        }
        self.insert_locked(&mut state, namespace, key, value, expires_at, now)
    }

    fn insert_locked(
        &self,
        state: &mut TierState,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let tier_key = (namespace.to_string(), key.to_string());
        if expires_at <= now {
            state.entries.pop(&tier_key);
            return false;
        }

        if state.entries.len() >= self.capacity && !state.entries.contains(&tier_key) {
            let purged = purge_expired_locked(&mut state.entries, now);
            self.evictions.fetch_add(purged as u64, Ordering::Relaxed);
        }

        let entry = MemoryEntry { value, expires_at };
        if let Some((evicted_key, _)) = state.entries.push(tier_key.clone(), entry) {
            if evicted_key != tier_key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        true
    }

    /// Refresh the expiry of a held entry without touching its value.
    pub fn touch(&self, namespace: &str, key: &str, expires_at: DateTime<Utc>) -> bool {
        let Some(state) = &self.state else {
            return false;
        };
        let tier_key = (namespace.to_string(), key.to_string());
        let mut state = state.lock();
        state.generation += 1;
        match state.entries.get_mut(&tier_key) {
            Some(entry) => {
                entry.expires_at = expires_at;
                true
            }
            None => false,
        }
    }

    pub fn delete(&self, namespace: &str, key: &str) -> bool {
        let Some(state) = &self.state else {
            return false;
        };
        let tier_key = (namespace.to_string(), key.to_string());
        let mut state = state.lock();
        state.generation += 1;
        state.entries.pop(&tier_key).is_some()
    }

    /// Drop a batch of keys under one lock acquisition.
    pub fn delete_many<'a>(&self, keys: impl IntoIterator<Item = (&'a str, &'a str)>) -> usize {
        let Some(state) = &self.state else {
            return 0;
        };
        let mut state = state.lock();
        state.generation += 1;
        keys.into_iter()
            .filter(|(namespace, key)| {
                state
                    .entries
                    .pop(&(namespace.to_string(), key.to_string()))
                    .is_some()
            })
            .count()
    }

    pub fn delete_namespace(&self, namespace: &str) -> usize {
        self.retain(|ns, _| ns != namespace)
    }

    /// Remove every expired entry.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let Some(state) = &self.state else {
            return 0;
        };
        let mut state = state.lock();
        let purged = purge_expired_locked(&mut state.entries, now);
        self.evictions.fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    /// Drop every entry.
    pub fn clear(&self) -> usize {
        let Some(state) = &self.state else {
            return 0;
        };
        let mut state = state.lock();
        state.generation += 1;
        let count = state.entries.len();
        state.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.state
            .as_ref()
            .map(|state| state.lock().entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Keep only entries for which `keep(namespace, key)` holds.
    fn retain(&self, keep: impl Fn(&str, &str) -> bool) -> usize {
        let Some(state) = &self.state else {
            return 0;
        };
        let mut state = state.lock();
        state.generation += 1;
        let doomed: Vec<TierKey> = state
            .entries
            .iter()
            .filter(|((ns, key), _)| !keep(ns.as_str(), key.as_str()))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &doomed {
            state.entries.pop(k);
        }
        doomed.len()
    }
}

fn purge_expired_locked(entries: &mut LruCache<TierKey, MemoryEntry>, now: DateTime<Utc>) -> usize {
    let expired: Vec<TierKey> = entries
        .iter()
        .filter(|(_, entry)| entry.expires_at <= now)
        .map(|(k, _)| k.clone())
        .collect();
    for k in &expired {
        entries.pop(k);
    }
    expired.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn later(now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::hours(1)
    }

    #[test]
    fn test_put_and_get() {
        let tier = MemoryTier::new(4);
        let now = Utc::now();
        tier.put("catalog", "B01", b"one".to_vec(), later(now), now);

        assert_eq!(tier.get("catalog", "B01", now), Some(b"one".to_vec()));
        assert_eq!(tier.get("library", "B01", now), None);
        assert_eq!(tier.stats().hits, 1);
        assert_eq!(tier.stats().misses, 1);
    }

    #[test]
    fn test_expired_entry_dropped_on_get() {
        let tier = MemoryTier::new(4);
        let now = Utc::now();
        tier.put("catalog", "B01", b"one".to_vec(), now + Duration::seconds(5), now);

        let after = now + Duration::seconds(5);
        assert_eq!(tier.get("catalog", "B01", after), None);
        assert!(tier.is_empty());
    }

    #[test]
    fn test_lru_eviction() {
        let tier = MemoryTier::new(2);
        let now = Utc::now();
        tier.put("ns", "a", b"a".to_vec(), later(now), now);
        tier.put("ns", "b", b"b".to_vec(), later(now), now);

        // Touch "a" so "b" becomes least recently used.
        assert!(tier.get("ns", "a", now).is_some());
        tier.put("ns", "c", b"c".to_vec(), later(now), now);

        assert_eq!(tier.len(), 2);
        assert!(tier.get("ns", "a", now).is_some());
        assert!(tier.get("ns", "b", now).is_none());
        assert!(tier.get("ns", "c", now).is_some());
        assert_eq!(tier.stats().evictions, 1);
    }

    #[test]
    fn test_expired_entries_evicted_before_live_ones() {
        let tier = MemoryTier::new(2);
        let now = Utc::now();
        tier.put("ns", "live", b"l".to_vec(), later(now), now);
        tier.put("ns", "short", b"s".to_vec(), now + Duration::seconds(1), now);

        let after = now + Duration::seconds(2);
        // "live" is the LRU entry, but "short" has expired and goes first.
        tier.put("ns", "new", b"n".to_vec(), later(after), after);
        assert!(tier.get("ns", "live", after).is_some());
        assert!(tier.get("ns", "new", after).is_some());
    }

    #[test]
    fn test_warm_skipped_after_mutation() {
        let tier = MemoryTier::new(4);
        let now = Utc::now();
        let observed = tier.generation();

        tier.delete("ns", "k");
        assert!(!tier.warm("ns", "k", b"stale".to_vec(), later(now), observed, now));
        assert!(tier.get("ns", "k", now).is_none());

        let observed = tier.generation();
        assert!(tier.warm("ns", "k", b"fresh".to_vec(), later(now), observed, now));
        assert_eq!(tier.get("ns", "k", now), Some(b"fresh".to_vec()));
    }

    #[test]
    fn test_delete_namespace_and_many() {
        let tier = MemoryTier::new(8);
        let now = Utc::now();
        for key in ["wishlist_1", "wishlist_2", "item_1"] {
            tier.put("library", key, key.as_bytes().to_vec(), later(now), now);
        }
        tier.put("catalog", "wishlist_1", b"x".to_vec(), later(now), now);

        let removed = tier.delete_many([("library", "wishlist_1"), ("library", "wishlist_2")]);
        assert_eq!(removed, 2);
        assert!(tier.get("catalog", "wishlist_1", now).is_some());
        assert!(tier.get("library", "item_1", now).is_some());

        assert_eq!(tier.delete_namespace("library"), 1);
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_touch_updates_expiry() {
        let tier = MemoryTier::new(4);
        let now = Utc::now();
        tier.put("ns", "k", b"v".to_vec(), now + Duration::seconds(1), now);
        assert!(tier.touch("ns", "k", later(now)));

        let after = now + Duration::seconds(10);
        assert_eq!(tier.get("ns", "k", after), Some(b"v".to_vec()));
        assert!(!tier.touch("ns", "missing", later(now)));
    }

    #[test]
    fn test_zero_capacity_disables_tier() {
        let tier = MemoryTier::new(0);
        let now = Utc::now();
        tier.put("ns", "k", b"v".to_vec(), later(now), now);
        assert!(!tier.is_enabled());
        assert!(tier.get("ns", "k", now).is_none());
        assert_eq!(tier.len(), 0);
    }
}
