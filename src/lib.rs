//! mesh-dns - a DNS forwarder for meshes of cooperating resolvers.
//!
//! This crate discovers peer DNS servers on the local network over
//! mDNS/DNS-SD, keeps a TTL-accurate cache of the live peer set, and fans
//! incoming DNS queries out to those peers, returning the first acceptable
//! answer. It advertises its own endpoint the same way, so a mesh of
//! mesh-dns nodes discovers itself with no central registry.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                            mesh-dns                               │
//! │                                                                   │
//! │  ┌───────────────┐ entries  ┌──────────────────┐                 │
//! │  │ mDNS browser  │─────────▶│  service cache   │                 │
//! │  │ (browse loop) │          │  (TTL tracked)   │                 │
//! │  └──────┬────────┘          └────────┬─────────┘                 │
//! │         │ re-arm                     │ snapshot                  │
//! │         ▼                            ▼                           │
//! │  ┌───────────────┐          ┌──────────────────┐                 │
//! │  │   refresher   │          │ fan-out handler  │◀── UDP/TCP :53 │
//! │  │ (per-instance │          │ (hickory server) │                 │
//! │  │    timers)    │          └──────────────────┘                 │
//! │  └───────────────┘   lookups feed the same entries channel       │
//! │                                                                   │
//! │  ┌───────────────┐                                                │
//! │  │  advertiser   │  announces this node's endpoint over mDNS      │
//! │  └───────────────┘                                                │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Discovered entries from the long-lived browse, the refresher's targeted
//! lookups, and forced refreshes all flow through one channel into a single
//! consumer, which is the sole writer to the cache. A query that fails its
//! first fan-out forces a refresh and retries once.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use mesh_dns::{Config, MeshDnsServer};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: Config = load_config();
//!     let shutdown = CancellationToken::new();
//!
//!     let server = MeshDnsServer::new(config);
//!     server.run(shutdown).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod advertise;
pub mod browser;
pub mod cache;
pub mod config;
pub mod error;
pub mod fanout;
pub mod handler;
pub mod metrics;
pub mod net;
pub mod refresher;
pub mod resolve;
pub mod server;
pub mod session;
pub mod telemetry;

// Re-export main types
pub use browser::{Browse, MdnsBrowser};
pub use cache::ServiceCache;
pub use config::{AddressMode, AdvertiseConfig, Config, DnsConfig, ForwardConfig, TelemetryConfig};
pub use error::MeshDnsError;
pub use handler::MeshForwardHandler;
pub use resolve::ServiceEntry;
pub use server::MeshDnsServer;
