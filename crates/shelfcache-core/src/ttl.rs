//! TTL policy, including the month-boundary cap for pricing data.
//!
//! Marketplace promotions reset at 00:00 UTC on the first of the month, so
//! entries in calendar-sensitive namespaces never outlive that instant. The
//! computation is pure: callers pass `now`.

use crate::config::CacheSettings;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};

/// Upper bound on any TTL (roughly a century), keeping expiry arithmetic in range.
pub const MAX_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Computes effective TTLs per namespace.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    default_ttl_secs: u64,
    namespace_ttl_secs: HashMap<String, u64>,
    calendar_sensitive: HashSet<String>,
    floor_secs: u64,
}

impl TtlPolicy {
    pub fn new(default_ttl_secs: u64, floor_secs: u64) -> Self {
        Self {
            default_ttl_secs: default_ttl_secs.max(1),
            namespace_ttl_secs: HashMap::new(),
            calendar_sensitive: HashSet::new(),
            floor_secs: floor_secs.max(1),
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self {
            default_ttl_secs: settings.default_ttl_secs.max(1),
            namespace_ttl_secs: settings.namespace_ttl_secs.clone(),
            calendar_sensitive: settings.calendar_sensitive.iter().cloned().collect(),
            floor_secs: settings.ttl_floor_secs.max(1),
        }
    }

    /// Set the default TTL of one namespace.
    pub fn with_namespace_ttl(mut self, namespace: impl Into<String>, ttl_secs: u64) -> Self {
        self.namespace_ttl_secs.insert(namespace.into(), ttl_secs);
        self
    }

    /// Flag a namespace as calendar-sensitive.
    pub fn with_calendar_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.calendar_sensitive.insert(namespace.into());
        self
    }

    pub fn is_calendar_sensitive(&self, namespace: &str) -> bool {
        self.calendar_sensitive.contains(namespace)
    }

    /// Default TTL for a namespace when the caller passes none.
    pub fn namespace_default(&self, namespace: &str) -> u64 {
        self.namespace_ttl_secs
            .get(namespace)
            .copied()
            .unwrap_or(self.default_ttl_secs)
            .max(1)
    }

    /// Effective TTL in seconds, within `1..=MAX_TTL_SECS`.
    pub fn effective_ttl(&self, namespace: &str, requested_secs: Option<u64>, now: DateTime<Utc>) -> u64 {
        let ttl = requested_secs
            .unwrap_or_else(|| self.namespace_default(namespace))
            .clamp(1, MAX_TTL_SECS);

        if !self.is_calendar_sensitive(namespace) {
            return ttl;
        }

        match seconds_until_month_boundary(now) {
            Some(boundary) => ttl.min(boundary).max(self.floor_secs),
            None => ttl,
        }
    }

    /// Expiry instant for an entry written at `now`.
    pub fn expires_at(&self, namespace: &str, requested_secs: Option<u64>, now: DateTime<Utc>) -> DateTime<Utc> {
        let ttl = self.effective_ttl(namespace, requested_secs, now);
        // MAX_TTL_SECS keeps this well inside i64 seconds.
        now + chrono::Duration::seconds(ttl as i64)
    }
}

/// Start of the next calendar month, 00:00:00 UTC.
pub fn next_month_start(now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Whole seconds from `now` until the next month starts.
pub fn seconds_until_month_boundary(now: DateTime<Utc>) -> Option<u64> {
    let boundary = next_month_start(now)?;
    u64::try_from((boundary - now).num_seconds()).ok()
}
