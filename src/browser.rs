//! Long-lived mDNS browser.
//!
//! The browser owns the service cache and the refresher, runs one long-lived
//! browse session, and funnels every discovered entry through a single
//! consumer task. Discovered entries arrive on one shared sink channel from
//! three kinds of producers: the browse session, the refresher's targeted
//! lookups, and forced refreshes from the query path. The consumer is the
//! sole writer to cache and refresher state, which keeps all cache writes
//! totally ordered.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ServiceCache;
use crate::metrics::{self, DiscoveryEvent};
use crate::refresher::ServiceRefresher;
use crate::resolve::{ResolverFactory, ServiceEntry};
use crate::session::ResolverSession;

/// Capacity of the shared entries sink; enough to smooth announcement bursts.
const ENTRY_CHANNEL_CAPACITY: usize = 10;

/// Pause before restarting the browse session after a resolver failure.
const BROWSE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The browser surface the query path depends on. Lets tests substitute a
/// fake peer set for the real discovery engine.
#[async_trait]
pub trait Browse: Send + Sync {
    /// Start discovery. Idempotent.
    fn start(&self);

    /// Stop discovery and wait for every background task. Idempotent.
    async fn stop(&self);

    /// Snapshot of the live (non-expired) peer set.
    fn services(&self) -> Vec<ServiceEntry>;

    /// Run a one-shot browse into the internal sink, blocking until the
    /// session ends (bounded by the caller's token).
    async fn force_refresh(&self, cancel: &CancellationToken);
}

/// mDNS service browser with TTL-driven refresh.
pub struct MdnsBrowser {
    service: String,
    domain: String,
    session: Arc<ResolverSession>,
    cache: ServiceCache,
    refresher: Arc<ServiceRefresher>,
    root: CancellationToken,
    entries_tx: mpsc::Sender<ServiceEntry>,
    entries_rx: Mutex<Option<mpsc::Receiver<ServiceEntry>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl MdnsBrowser {
    /// Create a browser for `service` within `domain` (normally `local.`).
    pub fn new(service: &str, domain: &str, factory: Arc<dyn ResolverFactory>) -> Self {
        let (entries_tx, entries_rx) = mpsc::channel(ENTRY_CHANNEL_CAPACITY);
        let session = Arc::new(ResolverSession::new(factory));
        let cache = ServiceCache::new();
        let refresher = Arc::new(ServiceRefresher::new(
            service,
            domain,
            session.clone(),
            cache.clone(),
            entries_tx.clone(),
        ));

        Self {
            service: service.to_string(),
            domain: domain.to_string(),
            session,
            cache,
            refresher,
            root: CancellationToken::new(),
            entries_tx,
            entries_rx: Mutex::new(Some(entries_rx)),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Apply one received entry to cache and refresher.
    fn handle_entry(
        cache: &ServiceCache,
        refresher: &ServiceRefresher,
        root: &CancellationToken,
        entry: ServiceEntry,
    ) {
        if entry.ttl == 0 {
            // Goodbye. The armed timer is left alone: when it fires it finds
            // no cache entry to refresh and the fallback browse is harmless.
            info!(instance = %entry.instance, "service withdrawn, removing");
            cache.remove_entry(&entry.instance);
            metrics::record_discovery_event(DiscoveryEvent::Goodbye);
            metrics::record_peer_count(cache.len());
            return;
        }

        if cache.get_expiry(&entry.instance).is_none() {
            info!(
                instance = %entry.instance,
                hostname = %entry.hostname,
                port = entry.port,
                ttl = entry.ttl,
                "discovered new service"
            );
            metrics::record_discovery_event(DiscoveryEvent::New);
        } else {
            debug!(instance = %entry.instance, ttl = entry.ttl, "service updated");
            metrics::record_discovery_event(DiscoveryEvent::Update);
        }

        cache.add_entry(entry.clone());
        refresher.refresh(root, entry);
        metrics::record_peer_count(cache.len());
    }

    async fn browse_loop(
        session: Arc<ResolverSession>,
        root: CancellationToken,
        service: String,
        domain: String,
        entries_tx: mpsc::Sender<ServiceEntry>,
    ) {
        debug!("browse loop starting");
        while !root.is_cancelled() {
            if let Err(err) = session.browse(&root, &service, &domain, &entries_tx).await {
                error!(%err, %service, "browse session failed");
            }
            // Discovery is eventually consistent: keep the stale cache and
            // retry until stopped.
            tokio::select! {
                _ = root.cancelled() => break,
                _ = tokio::time::sleep(BROWSE_RETRY_DELAY) => {}
            }
        }
        debug!("browse loop finished");
    }

    async fn process_entries(
        mut entries_rx: mpsc::Receiver<ServiceEntry>,
        cache: ServiceCache,
        refresher: Arc<ServiceRefresher>,
        root: CancellationToken,
    ) {
        debug!("entry consumer starting");
        loop {
            tokio::select! {
                biased;

                _ = root.cancelled() => {
                    // Drain whatever was buffered before the stop, then exit.
                    while let Ok(entry) = entries_rx.try_recv() {
                        Self::handle_entry(&cache, &refresher, &root, entry);
                    }
                    break;
                }

                entry = entries_rx.recv() => match entry {
                    Some(entry) => Self::handle_entry(&cache, &refresher, &root, entry),
                    None => break,
                }
            }
        }
        debug!("entry consumer finished");
    }
}

#[async_trait]
impl Browse for MdnsBrowser {
    fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(service = %self.service, domain = %self.domain, "starting mDNS browser");

        let Some(entries_rx) = self.entries_rx.lock().take() else {
            return;
        };

        let driver = tokio::spawn(Self::browse_loop(
            self.session.clone(),
            self.root.clone(),
            self.service.clone(),
            self.domain.clone(),
            self.entries_tx.clone(),
        ));
        let consumer = tokio::spawn(Self::process_entries(
            entries_rx,
            self.cache.clone(),
            self.refresher.clone(),
            self.root.clone(),
        ));

        self.tasks.lock().extend([driver, consumer]);
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping mDNS browser");

        self.root.cancel();
        self.refresher.stop_all();

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(%err, "browser task failed during shutdown");
                }
            }
        }

        info!("mDNS browser stopped");
    }

    fn services(&self) -> Vec<ServiceEntry> {
        self.cache.services()
    }

    async fn force_refresh(&self, cancel: &CancellationToken) {
        debug!(service = %self.service, "forcing mDNS refresh");
        metrics::record_force_refresh();
        if let Err(err) = self
            .session
            .browse(cancel, &self.service, &self.domain, &self.entries_tx)
            .await
        {
            warn!(%err, "forced refresh browse failed");
        }
    }
}
