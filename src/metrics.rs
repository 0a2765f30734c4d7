//! Metrics instrumentation for mesh-dns.
//!
//! All metrics are prefixed with `mesh_dns.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Record a forwarded DNS query.
pub fn record_query(result: QueryResult, duration: std::time::Duration) {
    let result_str = match result {
        QueryResult::Success => "success",
        QueryResult::NxDomain => "nxdomain",
        QueryResult::Refused => "refused",
        QueryResult::ServFail => "servfail",
        QueryResult::Error => "error",
    };

    counter!("mesh_dns.query.count", "result" => result_str).increment(1);
    histogram!("mesh_dns.query.duration.seconds").record(duration.as_secs_f64());
}

/// Query outcome for metrics.
#[derive(Debug, Clone, Copy)]
pub enum QueryResult {
    /// A peer answered successfully.
    Success,
    /// A peer answered with NXDOMAIN.
    NxDomain,
    /// The query was outside the configured zone.
    Refused,
    /// All attempts failed; SERVFAIL was returned.
    ServFail,
    /// The request could not be processed at all.
    Error,
}

/// Record a discovery event observed by the entry consumer.
pub fn record_discovery_event(event: DiscoveryEvent) {
    let event_str = match event {
        DiscoveryEvent::New => "new",
        DiscoveryEvent::Update => "update",
        DiscoveryEvent::Goodbye => "goodbye",
    };

    counter!("mesh_dns.discovery.event.count", "event" => event_str).increment(1);
}

/// Discovery event types.
#[derive(Debug, Clone, Copy)]
pub enum DiscoveryEvent {
    /// First announcement for an instance.
    New,
    /// Re-announcement of a known instance.
    Update,
    /// TTL=0 withdrawal.
    Goodbye,
}

/// Record the outcome of a proactive refresh lookup.
pub fn record_refresh_lookup(outcome: RefreshOutcome) {
    let outcome_str = match outcome {
        RefreshOutcome::Refreshed => "refreshed",
        RefreshOutcome::Fallback => "fallback",
    };

    counter!("mesh_dns.refresh.lookup.count", "outcome" => outcome_str).increment(1);
}

/// Refresh lookup outcomes.
#[derive(Debug, Clone, Copy)]
pub enum RefreshOutcome {
    /// The targeted lookup advanced the cache expiry.
    Refreshed,
    /// The lookup failed or did not refresh; a fallback browse ran.
    Fallback,
}

/// Record a forced refresh triggered by a failed query.
pub fn record_force_refresh() {
    counter!("mesh_dns.refresh.forced.count").increment(1);
}

/// Record the current peer cache size.
pub fn record_peer_count(peers: usize) {
    gauge!("mesh_dns.peers.count").set(peers as f64);
}

/// Record how many upstream addresses a fan-out targeted.
pub fn record_fanout_targets(count: usize) {
    histogram!("mesh_dns.fanout.targets").record(count as f64);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
