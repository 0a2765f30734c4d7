//! mDNS resolver abstraction and the `mdns-sd` backed implementation.
//!
//! The discovery engine never talks to the mDNS daemon directly; it goes
//! through the [`Resolver`] trait so tests can substitute a controllable
//! fake. A [`ResolverFactory`] produces one resolver per session, mirroring
//! the one-daemon-per-browse lifecycle of the underlying library.

use async_trait::async_trait;
use mdns_sd::{IfKind, ServiceDaemon, ServiceEvent};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::MeshDnsError;

/// A discovered service announcement, as one immutable value.
///
/// A TTL of 0 is the protocol's goodbye signal: the instance is withdrawing
/// itself and must be removed rather than stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    /// Instance name, unique within a service type.
    pub instance: String,
    /// Hostname of the announcing peer.
    pub hostname: String,
    /// IPv4 addresses in announcement order.
    pub addr_v4: Vec<Ipv4Addr>,
    /// IPv6 addresses in announcement order.
    pub addr_v6: Vec<Ipv6Addr>,
    /// Port of the announced endpoint.
    pub port: u16,
    /// Announcement TTL in seconds. 0 means withdrawal.
    pub ttl: u32,
}

impl ServiceEntry {
    /// A goodbye entry for an instance (TTL 0, no addresses).
    pub fn goodbye(instance: String) -> Self {
        Self {
            instance,
            hostname: String::new(),
            addr_v4: Vec::new(),
            addr_v6: Vec::new(),
            port: 0,
            ttl: 0,
        }
    }
}

/// Creates resolvers. Construction is fallible and happens per session.
pub trait ResolverFactory: Send + Sync {
    /// Create a fresh resolver for one browse or lookup session.
    fn create(&self) -> Result<Box<dyn Resolver>, MeshDnsError>;
}

/// One-shot streaming browse/lookup over mDNS.
///
/// Both calls stream entries into `sink` until `cancel` fires, then clean up
/// and return. Cancellation is the normal way a session ends and is not an
/// error.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Browse for all instances of a service type.
    async fn browse(
        &self,
        cancel: &CancellationToken,
        service: &str,
        domain: &str,
        sink: mpsc::Sender<ServiceEntry>,
    ) -> Result<(), MeshDnsError>;

    /// Targeted lookup for a single instance of a service type.
    async fn lookup(
        &self,
        cancel: &CancellationToken,
        instance: &str,
        service: &str,
        domain: &str,
        sink: mpsc::Sender<ServiceEntry>,
    ) -> Result<(), MeshDnsError>;
}

/// Factory producing [`MdnsSdResolver`]s, optionally bound to a set of
/// network interfaces by name.
pub struct MdnsSdFactory {
    interfaces: Option<Vec<String>>,
}

impl MdnsSdFactory {
    /// New factory. `interfaces` restricts the daemon to the named
    /// interfaces; `None` uses all of them.
    pub fn new(interfaces: Option<Vec<String>>) -> Self {
        Self { interfaces }
    }
}

impl ResolverFactory for MdnsSdFactory {
    fn create(&self) -> Result<Box<dyn Resolver>, MeshDnsError> {
        let daemon = ServiceDaemon::new()?;
        if let Some(names) = &self.interfaces {
            daemon.disable_interface(IfKind::All)?;
            for name in names {
                daemon.enable_interface(name.as_str())?;
            }
        }
        Ok(Box::new(MdnsSdResolver { daemon }))
    }
}

/// Resolver over an `mdns-sd` [`ServiceDaemon`]. Each resolver owns its
/// daemon and shuts it down when its single session ends.
pub struct MdnsSdResolver {
    daemon: ServiceDaemon,
}

impl MdnsSdResolver {
    async fn run(
        &self,
        cancel: &CancellationToken,
        wanted_instance: Option<&str>,
        service: &str,
        domain: &str,
        sink: mpsc::Sender<ServiceEntry>,
    ) -> Result<(), MeshDnsError> {
        let ty = full_type(service, domain);
        let receiver = self.daemon.browse(&ty)?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = receiver.recv_async() => match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        let entry = entry_from_info(&info, &ty);
                        if let Some(wanted) = wanted_instance {
                            if entry.instance != wanted {
                                continue;
                            }
                        }
                        trace!(instance = %entry.instance, ttl = entry.ttl, "service resolved");
                        if sink.send(entry).await.is_err() {
                            break;
                        }
                    }
                    Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                        let instance = instance_name(&fullname, &ty);
                        if let Some(wanted) = wanted_instance {
                            if instance != wanted {
                                continue;
                            }
                        }
                        debug!(%instance, "service removed");
                        if sink.send(ServiceEntry::goodbye(instance)).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, "mDNS event channel closed");
                        break;
                    }
                }
            }
        }

        if let Err(err) = self.daemon.stop_browse(&ty) {
            debug!(%err, "stop_browse failed");
        }
        if let Err(err) = self.daemon.shutdown() {
            debug!(%err, "daemon shutdown failed");
        }
        Ok(())
    }
}

#[async_trait]
impl Resolver for MdnsSdResolver {
    async fn browse(
        &self,
        cancel: &CancellationToken,
        service: &str,
        domain: &str,
        sink: mpsc::Sender<ServiceEntry>,
    ) -> Result<(), MeshDnsError> {
        self.run(cancel, None, service, domain, sink).await
    }

    async fn lookup(
        &self,
        cancel: &CancellationToken,
        instance: &str,
        service: &str,
        domain: &str,
        sink: mpsc::Sender<ServiceEntry>,
    ) -> Result<(), MeshDnsError> {
        // mdns-sd has no single-instance query; browse the type and forward
        // only the requested instance.
        self.run(cancel, Some(instance), service, domain, sink).await
    }
}

/// Compose the full DNS-SD type, e.g. `_dns._udp` + `local.` ->
/// `_dns._udp.local.`.
fn full_type(service: &str, domain: &str) -> String {
    format!("{}.{}", service.trim_end_matches('.'), domain)
}

/// Strip the type suffix from a fullname to recover the bare instance name.
fn instance_name(fullname: &str, ty: &str) -> String {
    fullname
        .strip_suffix(ty)
        .map(|prefix| prefix.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

fn entry_from_info(info: &mdns_sd::ServiceInfo, ty: &str) -> ServiceEntry {
    let mut addr_v4 = Vec::new();
    let mut addr_v6 = Vec::new();
    for addr in info.get_addresses() {
        match addr {
            IpAddr::V4(v4) => addr_v4.push(*v4),
            IpAddr::V6(v6) => addr_v6.push(*v6),
        }
    }
    addr_v4.sort_unstable();
    addr_v6.sort_unstable();

    ServiceEntry {
        instance: instance_name(info.get_fullname(), ty),
        hostname: info.get_hostname().to_string(),
        addr_v4,
        addr_v6,
        port: info.get_port(),
        ttl: info.get_host_ttl(),
    }
}
