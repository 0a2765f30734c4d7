//! Proactive TTL refresh for discovered services.
//!
//! For every live instance the refresher arms exactly one timer that fires
//! shortly before the announcement TTL runs out and performs a targeted
//! lookup. Fresh entries flow back through the shared entries sink, so the
//! browser's consumer remains the sole writer to the cache.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ServiceCache;
use crate::metrics::{self, RefreshOutcome};
use crate::resolve::ServiceEntry;
use crate::session::{cancel_after, ResolverSession};

/// Fraction of the TTL after which a refresh lookup fires.
pub const TTL_REFRESH_THRESHOLD: f64 = 0.8;

/// Uniform jitter applied to the refresh delay, as a fraction of it.
pub const JITTER_FACTOR: f64 = 0.1;

/// Upper bound on a single targeted lookup.
pub const MAX_LOOKUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Bound on the fallback browse that runs when a lookup did not refresh.
pub const FALLBACK_BROWSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-instance refresh timer pool.
///
/// Each armed timer is represented by its cancellation token, a child of
/// the browser's root token. Cancelling the token ends the timer task
/// cooperatively, whether it is still sleeping or already mid-lookup, so
/// resolver sessions always get to run their cleanup.
pub struct ServiceRefresher {
    service: String,
    domain: String,
    session: Arc<ResolverSession>,
    cache: ServiceCache,
    entries_tx: mpsc::Sender<ServiceEntry>,
    timers: Mutex<HashMap<String, CancellationToken>>,
}

impl ServiceRefresher {
    /// New refresher feeding fresh entries into `entries_tx`.
    pub fn new(
        service: &str,
        domain: &str,
        session: Arc<ResolverSession>,
        cache: ServiceCache,
        entries_tx: mpsc::Sender<ServiceEntry>,
    ) -> Self {
        Self {
            service: service.to_string(),
            domain: domain.to_string(),
            session,
            cache,
            entries_tx,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Schedule a proactive lookup for the entry, replacing any timer
    /// already armed for its instance.
    pub fn refresh(&self, cancel: &CancellationToken, entry: ServiceEntry) {
        let base = f64::from(entry.ttl) * TTL_REFRESH_THRESHOLD;
        let jitter = rand::thread_rng().gen_range(-1.0..=1.0) * JITTER_FACTOR * base;
        let delay = Duration::from_secs_f64((base + jitter).max(0.0));

        debug!(instance = %entry.instance, ?delay, "scheduling refresh");

        let session = self.session.clone();
        let cache = self.cache.clone();
        let entries_tx = self.entries_tx.clone();
        let service = self.service.clone();
        let domain = self.domain.clone();
        let instance = entry.instance.clone();
        let ttl = entry.ttl;

        let timer_token = cancel.child_token();
        let task_token = timer_token.clone();

        // Re-arming is atomic: the previous timer is cancelled and the new
        // one installed under the same lock.
        let mut timers = self.timers.lock();
        if let Some(previous) = timers.insert(entry.instance, timer_token) {
            previous.cancel();
        }

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = task_token.cancelled() => return,
            }

            let original_expiry = cache.get_expiry(&instance);
            let lookup_timeout = Duration::from_secs(u64::from(ttl))
                .saturating_sub(delay)
                .min(MAX_LOOKUP_TIMEOUT);

            info!(%instance, ?lookup_timeout, "TTL is low, performing lookup");
            let result = cancel_after(&task_token, lookup_timeout, |token| {
                let session = &session;
                let entries_tx = &entries_tx;
                let instance = &instance;
                let service = &service;
                let domain = &domain;
                async move {
                    session
                        .lookup(&token, instance, service, domain, entries_tx)
                        .await
                }
            })
            .await;
            if task_token.is_cancelled() {
                return;
            }

            let current_expiry = cache.get_expiry(&instance);
            let advanced = match (original_expiry, current_expiry) {
                (Some(before), Some(after)) => after > before,
                (None, Some(_)) => true,
                _ => false,
            };

            if result.is_err() || !advanced {
                warn!(
                    %instance,
                    "lookup failed or did not refresh, falling back to a general browse"
                );
                metrics::record_refresh_lookup(RefreshOutcome::Fallback);
                let _ = cancel_after(&task_token, FALLBACK_BROWSE_TIMEOUT, |token| {
                    let session = &session;
                    let entries_tx = &entries_tx;
                    let service = &service;
                    let domain = &domain;
                    async move { session.browse(&token, service, domain, entries_tx).await }
                })
                .await;
            } else {
                debug!(%instance, "lookup refreshed the entry");
                metrics::record_refresh_lookup(RefreshOutcome::Refreshed);
            }
        });
    }

    /// Cancel every armed timer.
    pub fn stop_all(&self) {
        let mut timers = self.timers.lock();
        for (_, token) in timers.drain() {
            token.cancel();
        }
    }

    /// Number of armed (or fired-and-finished) timer slots.
    #[cfg(test)]
    fn timer_count(&self) -> usize {
        self.timers.lock().len()
    }
}

impl Drop for ServiceRefresher {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::testing::FakeFactory;
    use std::sync::atomic::Ordering;

    fn entry(instance: &str, ttl: u32) -> ServiceEntry {
        ServiceEntry {
            instance: instance.to_string(),
            hostname: format!("{instance}.local."),
            addr_v4: vec![],
            addr_v6: vec![],
            port: 53,
            ttl,
        }
    }

    struct Fixture {
        refresher: ServiceRefresher,
        cache: ServiceCache,
        control: Arc<crate::resolve::testing::FakeControl>,
        cancel: CancellationToken,
        _entries_rx: mpsc::Receiver<ServiceEntry>,
        _inject: mpsc::Sender<ServiceEntry>,
    }

    fn fixture() -> Fixture {
        let (factory, inject, control) = FakeFactory::new();
        let session = Arc::new(ResolverSession::new(factory));
        let cache = ServiceCache::new();
        let (entries_tx, entries_rx) = mpsc::channel(16);
        let refresher = ServiceRefresher::new(
            "_test._udp",
            "local.",
            session,
            cache.clone(),
            entries_tx,
        );
        Fixture {
            refresher,
            cache,
            control,
            cancel: CancellationToken::new(),
            _entries_rx: entries_rx,
            _inject: inject,
        }
    }

    /// A 1s TTL fires the timer at 0.8s ± 10% jitter; waiting 1.1s plus a
    /// little slack covers the lookup and the fallback decision.
    async fn wait_for_timer() {
        tokio::time::sleep(Duration::from_millis(1300)).await;
    }

    #[tokio::test]
    async fn successful_lookup_refreshes_without_fallback() {
        let f = fixture();
        f.cache.add_entry(entry("peer0", 1));
        *f.control.lookup_refresh.lock() = Some((f.cache.clone(), 1));

        f.refresher.refresh(&f.cancel, entry("peer0", 1));
        wait_for_timer().await;

        assert_eq!(f.control.lookups_for("peer0"), 1);
        assert_eq!(f.control.browse_count(), 0);
        f.refresher.stop_all();
    }

    #[tokio::test]
    async fn failed_lookup_triggers_browse_fallback() {
        let f = fixture();
        f.cache.add_entry(entry("peer0", 1));
        f.control.lookup_should_error.store(true, Ordering::SeqCst);

        f.refresher.refresh(&f.cancel, entry("peer0", 1));
        wait_for_timer().await;

        assert_eq!(f.control.lookups_for("peer0"), 1);
        assert_eq!(f.control.browse_count(), 1);
        f.refresher.stop_all();
    }

    #[tokio::test]
    async fn lookup_without_update_triggers_browse_fallback() {
        let f = fixture();
        f.cache.add_entry(entry("peer0", 1));
        // No lookup_refresh configured: the lookup succeeds but the cache
        // expiry does not advance.

        f.refresher.refresh(&f.cancel, entry("peer0", 1));
        wait_for_timer().await;

        assert_eq!(f.control.lookups_for("peer0"), 1);
        assert_eq!(f.control.browse_count(), 1);
        f.refresher.stop_all();
    }

    #[tokio::test]
    async fn rearming_replaces_the_previous_timer() {
        let f = fixture();
        f.cache.add_entry(entry("peer0", 1));
        *f.control.lookup_refresh.lock() = Some((f.cache.clone(), 1));

        f.refresher.refresh(&f.cancel, entry("peer0", 1));
        f.refresher.refresh(&f.cancel, entry("peer0", 1));
        assert_eq!(f.refresher.timer_count(), 1);
        wait_for_timer().await;

        // The first timer was aborted; only one lookup ran.
        assert_eq!(f.control.lookups_for("peer0"), 1);
        f.refresher.stop_all();
    }

    #[tokio::test]
    async fn stop_all_cancels_armed_timers() {
        let f = fixture();
        f.cache.add_entry(entry("peer0", 60));

        f.refresher.refresh(&f.cancel, entry("peer0", 60));
        f.refresher.stop_all();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(f.control.lookups_for("peer0"), 0);
        assert_eq!(f.refresher.timer_count(), 0);
    }
}
