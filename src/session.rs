//! One-shot resolver sessions.
//!
//! A session wraps a single browse or lookup call. It owns a private local
//! channel between the resolver and a forwarder task, so the caller-supplied
//! sink is insulated from the resolver's channel lifecycle: the session never
//! closes the caller's sink, it only ever holds a clone of the sender.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::MeshDnsError;
use crate::resolve::{ResolverFactory, ServiceEntry};

/// Capacity of the session-local channel between resolver and forwarder.
const LOCAL_CHANNEL_CAPACITY: usize = 10;

/// Runs one-shot browse/lookup sessions against resolvers produced by a
/// factory. Cheap to share; constructs a fresh resolver per call.
pub struct ResolverSession {
    factory: Arc<dyn ResolverFactory>,
}

impl ResolverSession {
    /// New session runner over the given factory.
    pub fn new(factory: Arc<dyn ResolverFactory>) -> Self {
        Self { factory }
    }

    /// Browse for all instances, streaming entries into `sink` until
    /// `cancel` fires. Cancellation is not an error.
    pub async fn browse(
        &self,
        cancel: &CancellationToken,
        service: &str,
        domain: &str,
        sink: &mpsc::Sender<ServiceEntry>,
    ) -> Result<(), MeshDnsError> {
        self.run(cancel, None, service, domain, sink).await
    }

    /// Targeted lookup for one instance, same shape as [`browse`].
    ///
    /// [`browse`]: ResolverSession::browse
    pub async fn lookup(
        &self,
        cancel: &CancellationToken,
        instance: &str,
        service: &str,
        domain: &str,
        sink: &mpsc::Sender<ServiceEntry>,
    ) -> Result<(), MeshDnsError> {
        self.run(cancel, Some(instance), service, domain, sink).await
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        instance: Option<&str>,
        service: &str,
        domain: &str,
        sink: &mpsc::Sender<ServiceEntry>,
    ) -> Result<(), MeshDnsError> {
        debug!(?instance, service, "session starting");

        // Construct the resolver before anything else: a construction
        // failure must return without a forwarder task in flight.
        let resolver = self.factory.create().map_err(|err| {
            warn!(%err, service, "failed to initialize resolver");
            err
        })?;

        let (local_tx, mut local_rx) = mpsc::channel(LOCAL_CHANNEL_CAPACITY);
        let forward_sink = sink.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(entry) = local_rx.recv().await {
                if forward_sink.send(entry).await.is_err() {
                    break;
                }
            }
        });

        // The resolver owns the local sender; when the call returns the
        // sender drops, the local channel ends and the forwarder exits.
        let result = match instance {
            None => resolver.browse(cancel, service, domain, local_tx).await,
            Some(instance) => {
                resolver
                    .lookup(cancel, instance, service, domain, local_tx)
                    .await
            }
        };

        let _ = forwarder.await;
        debug!(?instance, service, "session finished");

        match result {
            Err(err) if !cancel.is_cancelled() => {
                warn!(%err, service, "session failed");
                Err(err)
            }
            _ => Ok(()),
        }
    }
}

/// Run `f` under a child token that is cancelled once `limit` elapses.
///
/// The future is always polled to completion, never dropped mid-flight, so
/// sessions get to run their cleanup when the deadline fires.
pub(crate) async fn cancel_after<T, F, Fut>(
    parent: &CancellationToken,
    limit: Duration,
    f: F,
) -> T
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = T>,
{
    let token = parent.child_token();
    let fut = f(token.clone());
    tokio::pin!(fut);
    let sleeper = tokio::time::sleep(limit);
    tokio::pin!(sleeper);

    loop {
        tokio::select! {
            result = &mut fut => return result,
            _ = &mut sleeper, if !token.is_cancelled() => token.cancel(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::testing::FakeFactory;

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

    #[tokio::test]
    async fn construction_failure_returns_error_without_forwarding() {
        let (factory, _inject, _control) = FakeFactory::new();
        factory.fail_creation();
        let session = ResolverSession::new(factory);

        let (sink, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let result = session.browse(&cancel, "_dns._udp", "local.", &sink).await;

        assert!(result.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn entries_are_forwarded_to_the_sink() {
        let (factory, inject, _control) = FakeFactory::new();
        let session = ResolverSession::new(factory);

        let (sink, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let browse = tokio::spawn({
            let sink = sink.clone();
            let cancel = cancel.clone();
            async move { session.browse(&cancel, "_dns._udp", "local.", &sink).await }
        });

        inject.send(entry("host0", 120)).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.instance, "host0");

        cancel.cancel();
        assert!(browse.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn cancellation_is_not_an_error_and_sink_stays_open() {
        let (factory, _inject, _control) = FakeFactory::new();
        let session = ResolverSession::new(factory);

        let (sink, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = session.browse(&cancel, "_dns._udp", "local.", &sink).await;
        assert!(result.is_ok());

        // The session must not have closed the caller's sink.
        sink.send(entry("still-open", 1)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().instance, "still-open");
    }

    #[tokio::test]
    async fn cancel_after_bounds_a_blocking_session() {
        let (factory, _inject, control) = FakeFactory::new();
        let session = ResolverSession::new(factory);
        let (sink, _rx) = mpsc::channel(4);

        let root = CancellationToken::new();
        let started = std::time::Instant::now();
        let result = cancel_after(&root, Duration::from_millis(100), |token| async move {
            session.browse(&token, "_dns._udp", "local.", &sink).await
        })
        .await;

        assert!(result.is_ok());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(control.browse_count(), 1);
        assert!(!root.is_cancelled());
    }
}
