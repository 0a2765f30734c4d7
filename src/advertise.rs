//! mDNS self-advertisement.
//!
//! Registers the local DNS endpoint as a DNS-SD service so peers discover
//! this node the same way it discovers them. The advertiser has its own
//! lifecycle and never interacts with the discovery engine.

use ipnet::IpNet;
use mdns_sd::{IfKind, ServiceDaemon, ServiceInfo};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_DOMAIN;
use crate::error::MeshDnsError;
use crate::net;

struct Registration {
    daemon: ServiceDaemon,
    fullname: String,
}

/// Advertises one service instance over mDNS.
pub struct MdnsAdvertiser {
    instance_name: String,
    service: String,
    domain: String,
    port: u16,
    ttl: u32,
    iface_bind_subnet: Option<IpNet>,
    registration: Mutex<Option<Registration>>,
}

impl MdnsAdvertiser {
    /// New advertiser for `instance_name` under `service` on `port`.
    pub fn new(instance_name: &str, service: &str, port: u16, ttl: u32) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            service: service.to_string(),
            domain: DEFAULT_DOMAIN.to_string(),
            port,
            ttl,
            iface_bind_subnet: None,
            registration: Mutex::new(None),
        }
    }

    /// Restrict advertisement to interfaces with an address in `subnet`.
    pub fn bind_to_subnet(&mut self, subnet: Option<IpNet>) {
        self.iface_bind_subnet = subnet;
    }

    /// Register the service. Replaces any previous registration.
    ///
    /// The announcement TTL on the wire is managed by the mDNS daemon; the
    /// configured value is carried for operator visibility.
    pub fn start(&self) -> Result<(), MeshDnsError> {
        self.stop();

        info!(
            instance = %self.instance_name,
            service = %self.service,
            port = self.port,
            ttl = self.ttl,
            "starting mDNS advertisement"
        );

        let daemon = ServiceDaemon::new()?;
        if let Some(subnet) = &self.iface_bind_subnet {
            match net::interfaces_for_subnet(subnet) {
                Ok(names) if !names.is_empty() => {
                    daemon.disable_interface(IfKind::All)?;
                    for name in &names {
                        daemon.enable_interface(name.as_str())?;
                    }
                    debug!(?names, "advertising on bound interfaces");
                }
                Ok(_) | Err(_) => {
                    error!(%subnet, "failed to find interface for subnet, advertising on all");
                }
            }
        }

        let service_type = format!("{}.{}", self.service.trim_end_matches('.'), self.domain);
        let host = format!("{}.{}", short_hostname()?, self.domain);
        let service_info = ServiceInfo::new(
            &service_type,
            &self.instance_name,
            &host,
            (),
            self.port,
            None,
        )?
        .enable_addr_auto();

        let fullname = service_info.get_fullname().to_string();
        daemon.register(service_info)?;

        *self.registration.lock() = Some(Registration { daemon, fullname });
        Ok(())
    }

    /// Withdraw the advertisement and shut the daemon down. Idempotent.
    pub fn stop(&self) {
        let Some(registration) = self.registration.lock().take() else {
            return;
        };
        info!(instance = %self.instance_name, "stopping mDNS advertisement");

        if let Err(err) = registration.daemon.unregister(&registration.fullname) {
            warn!(%err, "failed to unregister mDNS service");
        }
        if let Err(err) = registration.daemon.shutdown() {
            warn!(%err, "failed to shut down mDNS daemon");
        }
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Hostname up to the first dot.
pub fn short_hostname() -> Result<String, MeshDnsError> {
    let hostname = hostname::get()?;
    let hostname = hostname.to_string_lossy();
    Ok(hostname
        .split('.')
        .next()
        .unwrap_or(&hostname)
        .to_string())
}
