//! Error types for mesh-dns.

use thiserror::Error;

/// Errors that can occur in the forwarder.
#[derive(Debug, Error)]
pub enum MeshDnsError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// mDNS daemon error
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Failed to parse address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// No peers were available for a fan-out query
    #[error("no upstream peers available")]
    NoUpstreams,

    /// An upstream query did not answer in time
    #[error("upstream query timed out")]
    Timeout,

    /// An upstream answered with a message that does not match the query
    #[error("upstream response did not match the query")]
    ResponseMismatch,
}
