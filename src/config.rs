//! Configuration types for mesh-dns.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// mDNS service type used when none is configured.
pub const DEFAULT_SERVICE_TYPE: &str = "_dns._udp";

/// DNS-SD domain. Always `local.`; resolvers do not generally respect
/// other values.
pub const DEFAULT_DOMAIN: &str = "local.";

/// Prefix for the default advertised instance name.
pub const ADVERTISING_PREFIX: &str = "meshdns-";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// DNS server configuration.
    pub dns: DnsConfig,

    /// Peer discovery and fan-out configuration.
    #[serde(default)]
    pub forward: ForwardConfig,

    /// Self-advertisement configuration.
    #[serde(default)]
    pub advertise: AdvertiseConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// DNS server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Address for the DNS server to listen on (UDP and TCP).
    pub listen_addr: SocketAddr,
}

/// Peer discovery and fan-out configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardConfig {
    /// Only forward queries inside this zone.
    #[serde(default = "default_zone")]
    pub zone: String,

    /// mDNS service type to browse for.
    #[serde(rename = "type", default = "default_service_type")]
    pub service_type: String,

    /// Only use interfaces whose addresses lie in this subnet (CIDR).
    #[serde(default)]
    pub iface_bind_subnet: Option<String>,

    /// Drop discovered addresses that belong to a local interface.
    #[serde(default)]
    pub ignore_self: bool,

    /// Regex an instance name must match to be used.
    #[serde(default)]
    pub filter: Option<String>,

    /// Address family ordering/filter policy.
    #[serde(default)]
    pub address_mode: AddressMode,

    /// Cap on addresses used per peer. 0 means no cap.
    #[serde(default = "default_addresses_per_host")]
    pub addresses_per_host: usize,

    /// Overall fan-out timeout per request, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retry count per upstream address inside the fan-out.
    #[serde(default = "default_attempts")]
    pub attempts: usize,

    /// Fan-out parallelism.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            zone: default_zone(),
            service_type: default_service_type(),
            iface_bind_subnet: None,
            ignore_self: false,
            filter: None,
            address_mode: AddressMode::default(),
            addresses_per_host: default_addresses_per_host(),
            timeout_secs: default_timeout_secs(),
            attempts: default_attempts(),
            worker_count: default_worker_count(),
        }
    }
}

/// Address family ordering/filter for discovered peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressMode {
    /// IPv6 addresses first, then IPv4.
    PreferIpv6,
    /// IPv4 addresses first, then IPv6.
    PreferIpv4,
    /// IPv6 addresses only.
    OnlyIpv6,
    /// IPv4 addresses only.
    #[default]
    OnlyIpv4,
}

/// Self-advertisement configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvertiseConfig {
    /// Whether to advertise the local DNS endpoint at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Advertised instance name. Defaults to `meshdns-<short hostname>`.
    #[serde(default)]
    pub instance_name: Option<String>,

    /// mDNS service type to register under.
    #[serde(rename = "type", default = "default_service_type")]
    pub service_type: String,

    /// Advertised port. Defaults to the server's listening port.
    #[serde(default)]
    pub port: Option<u16>,

    /// Announcement TTL in seconds.
    #[serde(default = "default_advertise_ttl")]
    pub ttl: u32,

    /// Only advertise on interfaces whose addresses lie in this subnet.
    #[serde(default)]
    pub iface_bind_subnet: Option<String>,
}

impl Default for AdvertiseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            instance_name: None,
            service_type: default_service_type(),
            port: None,
            ttl: default_advertise_ttl(),
            iface_bind_subnet: None,
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "mesh_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

fn default_zone() -> String {
    ".".to_string()
}

fn default_service_type() -> String {
    DEFAULT_SERVICE_TYPE.to_string()
}

fn default_addresses_per_host() -> usize {
    1
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_attempts() -> usize {
    3
}

fn default_worker_count() -> usize {
    4
}

fn default_advertise_ttl() -> u32 {
    320
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}
