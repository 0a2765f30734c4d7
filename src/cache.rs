//! TTL-tracked cache of discovered peer services.
//!
//! The cache is the single source of truth for the live peer set. Entries are
//! keyed by mDNS instance name and carry an absolute expiry derived from the
//! announcement TTL at insert time. Consumers only ever see cloned
//! [`ServiceEntry`] values; the tracking metadata never escapes.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::resolve::ServiceEntry;

/// A cached entry plus the TTL bookkeeping derived at insert time.
#[derive(Debug, Clone)]
struct TrackedService {
    entry: ServiceEntry,
    original_ttl: Duration,
    expiry: Instant,
}

/// Thread-safe map of instance name to tracked service.
#[derive(Debug, Clone, Default)]
pub struct ServiceCache {
    inner: Arc<RwLock<HashMap<String, TrackedService>>>,
}

impl ServiceCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for its instance name.
    ///
    /// The expiry is recomputed from the entry's TTL on every insert. Callers
    /// are responsible for filtering out TTL=0 goodbye entries; the cache
    /// stores whatever it is given.
    pub fn add_entry(&self, entry: ServiceEntry) {
        let original_ttl = Duration::from_secs(u64::from(entry.ttl));
        let tracked = TrackedService {
            original_ttl,
            expiry: Instant::now() + original_ttl,
            entry,
        };
        let mut inner = self.inner.write();
        inner.insert(tracked.entry.instance.clone(), tracked);
    }

    /// Remove the entry for an instance. Idempotent.
    pub fn remove_entry(&self, instance: &str) {
        let mut inner = self.inner.write();
        inner.remove(instance);
    }

    /// Snapshot of all entries whose expiry has not passed.
    ///
    /// The returned vector is freshly allocated and the entries are clones;
    /// nothing in it aliases cache internals.
    pub fn services(&self) -> Vec<ServiceEntry> {
        let now = Instant::now();
        let inner = self.inner.read();
        inner
            .values()
            .filter(|tracked| tracked.expiry > now)
            .map(|tracked| tracked.entry.clone())
            .collect()
    }

    /// The absolute expiry for an instance, or `None` if it is not present.
    ///
    /// The refresher compares expiries before and after a targeted lookup to
    /// decide whether the lookup actually refreshed the entry.
    pub fn get_expiry(&self, instance: &str) -> Option<Instant> {
        let inner = self.inner.read();
        inner.get(instance).map(|tracked| tracked.expiry)
    }

    /// Number of resident entries, expired or not.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the cache holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// The original TTL recorded for an instance, if present.
    #[cfg(test)]
    fn original_ttl(&self, instance: &str) -> Option<Duration> {
        self.inner.read().get(instance).map(|t| t.original_ttl)
    }
}
