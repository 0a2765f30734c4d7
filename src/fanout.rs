//! Transient fan-out DNS client.
//!
//! One [`FanoutClient`] is built per incoming request from the current peer
//! snapshot and dropped afterwards. Addresses are tried in order with a
//! bounded number of concurrent workers; the first clean answer wins.

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use hickory_proto::op::{Message, ResponseCode};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::MeshDnsError;
use crate::metrics;

const MAX_RESPONSE_SIZE: usize = 4096;

/// Fan-out query client over a fixed set of upstream addresses.
pub struct FanoutClient {
    addrs: Vec<SocketAddr>,
    timeout: Duration,
    attempts: usize,
    worker_count: usize,
}

impl FanoutClient {
    /// New client. `timeout` bounds the whole exchange, `attempts` is the
    /// per-address try count, `worker_count` caps concurrency.
    pub fn new(
        addrs: Vec<SocketAddr>,
        timeout: Duration,
        attempts: usize,
        worker_count: usize,
    ) -> Self {
        Self {
            addrs,
            timeout,
            attempts: attempts.max(1),
            worker_count: worker_count.max(1),
        }
    }

    /// Number of upstream addresses this client targets.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Whether there is no upstream to query.
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Send `query` to the upstreams and return the first acceptable answer.
    ///
    /// A `NoError` response wins immediately. If every address is exhausted,
    /// the best non-clean response is returned (`NXDomain` preferred over
    /// other rcodes); if nothing answered at all, the last error is.
    pub async fn exchange(&self, query: &Message) -> Result<Message, MeshDnsError> {
        if self.addrs.is_empty() {
            return Err(MeshDnsError::NoUpstreams);
        }
        metrics::record_fanout_targets(self.addrs.len());

        let wire = query.to_vec()?;
        let id = query.id();
        let per_attempt = self
            .timeout
            .checked_div(self.attempts as u32)
            .unwrap_or(self.timeout)
            .max(Duration::from_millis(100));

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        // Sequential selection: workers take addresses in snapshot order.
        let mut pending = self.addrs.iter().copied();
        let mut in_flight = FuturesUnordered::new();
        for addr in pending.by_ref().take(self.worker_count) {
            in_flight.push(query_addr(addr, wire.clone(), id, self.attempts, per_attempt));
        }

        let mut fallback: Option<Message> = None;
        let mut last_err: Option<MeshDnsError> = None;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    debug!("fan-out deadline reached");
                    break;
                }
                next = in_flight.next() => match next {
                    Some((addr, Ok(response))) => {
                        if response.response_code() == ResponseCode::NoError {
                            debug!(%addr, "upstream answered");
                            return Ok(response);
                        }
                        debug!(%addr, rcode = ?response.response_code(), "upstream answered with failure");
                        let keep = fallback
                            .as_ref()
                            .map_or(true, |prev| prev.response_code() != ResponseCode::NXDomain);
                        if keep {
                            fallback = Some(response);
                        }
                        if let Some(addr) = pending.next() {
                            in_flight.push(query_addr(addr, wire.clone(), id, self.attempts, per_attempt));
                        }
                    }
                    Some((addr, Err(err))) => {
                        debug!(%addr, %err, "upstream query failed");
                        last_err = Some(err);
                        if let Some(addr) = pending.next() {
                            in_flight.push(query_addr(addr, wire.clone(), id, self.attempts, per_attempt));
                        }
                    }
                    None => break,
                }
            }
        }

        match fallback {
            Some(response) => Ok(response),
            None => Err(last_err.unwrap_or(MeshDnsError::NoUpstreams)),
        }
    }
}

/// Query one address with up to `attempts` tries.
async fn query_addr(
    addr: SocketAddr,
    wire: Vec<u8>,
    id: u16,
    attempts: usize,
    per_attempt: Duration,
) -> (SocketAddr, Result<Message, MeshDnsError>) {
    let mut last_err = None;
    for _ in 0..attempts {
        match query_once(addr, &wire, id, per_attempt).await {
            Ok(response) => return (addr, Ok(response)),
            Err(err) => last_err = Some(err),
        }
    }
    (addr, Err(last_err.unwrap_or(MeshDnsError::Timeout)))
}

/// One UDP exchange against one address.
async fn query_once(
    addr: SocketAddr,
    wire: &[u8],
    id: u16,
    per_attempt: Duration,
) -> Result<Message, MeshDnsError> {
    let bind_addr = if addr.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr).await?;
    socket.send(wire).await?;

    let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
    let len = tokio::time::timeout(per_attempt, socket.recv(&mut buf))
        .await
        .map_err(|_| MeshDnsError::Timeout)??;

    let response = Message::from_vec(&buf[..len])?;
    if response.id() != id {
        return Err(MeshDnsError::ResponseMismatch);
    }
    Ok(response)
}
