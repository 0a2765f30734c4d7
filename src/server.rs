//! DNS server setup and lifecycle management.

use hickory_server::ServerFuture;
use ipnet::IpNet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::advertise::{short_hostname, MdnsAdvertiser};
use crate::browser::{Browse, MdnsBrowser};
use crate::config::{Config, ADVERTISING_PREFIX, DEFAULT_DOMAIN};
use crate::error::MeshDnsError;
use crate::handler::MeshForwardHandler;
use crate::metrics;
use crate::net;
use crate::resolve::MdnsSdFactory;

/// TCP request timeout for the DNS listener.
const TCP_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval for emitting peer-set metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically emit peer-set metrics.
async fn metrics_loop(browser: Arc<MdnsBrowser>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let peers = browser.services().len();
                metrics::record_peer_count(peers);
                debug!(peers, "emitted peer metrics");
            }
            _ = shutdown.cancelled() => {
                debug!("metrics loop shutting down");
                return;
            }
        }
    }
}

/// Parse an optional CIDR string from the configuration.
fn parse_subnet(raw: &Option<String>) -> Result<Option<IpNet>, MeshDnsError> {
    raw.as_deref()
        .map(|value| {
            value
                .parse::<IpNet>()
                .map_err(|err| MeshDnsError::Config(format!("invalid subnet '{value}': {err}")))
        })
        .transpose()
}

/// Resolve a subnet binding to interface names, falling back to all
/// interfaces when nothing matches.
fn bound_interfaces(subnet: &Option<IpNet>) -> Option<Vec<String>> {
    let subnet = subnet.as_ref()?;
    match net::interfaces_for_subnet(subnet) {
        Ok(names) if !names.is_empty() => {
            info!(%subnet, ?names, "discovery bound to interfaces");
            Some(names)
        }
        Ok(_) => {
            error!(%subnet, "failed to find interface for subnet, using all interfaces");
            None
        }
        Err(err) => {
            error!(%subnet, %err, "failed to enumerate interfaces, using all interfaces");
            None
        }
    }
}

/// Mesh DNS forwarder server.
pub struct MeshDnsServer {
    config: Config,
}

impl MeshDnsServer {
    /// Create a new server with the given configuration.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the server until the shutdown token fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), MeshDnsError> {
        let listen_addr = self.config.dns.listen_addr;
        info!(
            %listen_addr,
            zone = %self.config.forward.zone,
            service_type = %self.config.forward.service_type,
            "Starting mesh-dns server"
        );

        // Discovery engine.
        let forward_subnet = parse_subnet(&self.config.forward.iface_bind_subnet)?;
        let factory = Arc::new(MdnsSdFactory::new(bound_interfaces(&forward_subnet)));
        let browser = Arc::new(MdnsBrowser::new(
            &self.config.forward.service_type,
            DEFAULT_DOMAIN,
            factory,
        ));
        browser.start();

        // Self-advertisement.
        let advertiser = if self.config.advertise.enabled {
            let instance_name = match &self.config.advertise.instance_name {
                Some(name) => name.clone(),
                None => format!("{}{}", ADVERTISING_PREFIX, short_hostname()?),
            };
            let port = self.config.advertise.port.unwrap_or_else(|| listen_addr.port());
            let mut advertiser = MdnsAdvertiser::new(
                &instance_name,
                &self.config.advertise.service_type,
                port,
                self.config.advertise.ttl,
            );
            advertiser.bind_to_subnet(parse_subnet(&self.config.advertise.iface_bind_subnet)?);
            advertiser.start()?;
            Some(advertiser)
        } else {
            None
        };

        // Query path.
        let handler =
            MeshForwardHandler::new(&self.config.forward, browser.clone() as Arc<dyn Browse>)?;
        let mut server = ServerFuture::new(handler);

        let udp_socket = UdpSocket::bind(listen_addr).await?;
        info!(addr = %listen_addr, "DNS UDP listening");
        server.register_socket(udp_socket);

        let tcp_listener = TcpListener::bind(listen_addr).await?;
        info!(addr = %listen_addr, "DNS TCP listening");
        server.register_listener(tcp_listener, TCP_TIMEOUT);

        info!("mesh-dns ready to serve queries");

        let metrics_handle = tokio::spawn(metrics_loop(browser.clone(), shutdown.clone()));

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("mesh-dns shutdown requested");
            }
            result = server.block_until_done() => {
                if let Err(err) = result {
                    error!(%err, "DNS server error");
                }
            }
        }

        let _ = metrics_handle.await;

        if let Some(advertiser) = &advertiser {
            advertiser.stop();
        }

        info!("Waiting for the mDNS browser to stop...");
        browser.stop().await;

        info!("mesh-dns server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_subnet_is_a_config_error() {
        let result = parse_subnet(&Some("not-a-subnet".to_string()));
        assert!(matches!(result, Err(MeshDnsError::Config(_))));
    }

    #[test]
    fn missing_subnet_parses_to_none() {
        assert!(parse_subnet(&None).unwrap().is_none());
    }

    #[test]
    fn valid_subnet_parses() {
        let subnet = parse_subnet(&Some("10.0.0.0/24".to_string())).unwrap();
        assert_eq!(subnet.unwrap().to_string(), "10.0.0.0/24");
    }
}
