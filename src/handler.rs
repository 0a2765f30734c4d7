//! Fan-out request handler.
//!
//! Every incoming query takes a fresh snapshot of the discovered peer set,
//! turns it into a transient fan-out client according to the address policy,
//! and relays the first acceptable upstream answer. A failed first attempt
//! forces an mDNS refresh and retries exactly once against a fresh snapshot.

use async_trait::async_trait;
use hickory_proto::op::{Header, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{LowerName, Name, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::browser::Browse;
use crate::config::{AddressMode, ForwardConfig};
use crate::error::MeshDnsError;
use crate::fanout::FanoutClient;
use crate::metrics::{self, QueryResult, Timer};
use crate::net;
use crate::resolve::ServiceEntry;

/// Bound on the forced refresh between the first attempt and the retry.
const FORCE_REFRESH_TIMEOUT: Duration = Duration::from_secs(1);

/// DNS request handler that fans queries out to discovered peers.
pub struct MeshForwardHandler {
    zone: LowerName,
    filter: Option<Regex>,
    ignore_self: bool,
    address_mode: AddressMode,
    addrs_per_host: usize,
    timeout: Duration,
    attempts: usize,
    worker_count: usize,
    browser: Arc<dyn Browse>,
}

impl MeshForwardHandler {
    /// Build a handler from the forward configuration. Fails on an invalid
    /// zone or filter regex.
    pub fn new(config: &ForwardConfig, browser: Arc<dyn Browse>) -> Result<Self, MeshDnsError> {
        let zone = Name::from_ascii(&config.zone)
            .map_err(|err| MeshDnsError::Config(format!("invalid zone '{}': {err}", config.zone)))?
            .into();
        let filter = config
            .filter
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|err| MeshDnsError::Config(format!("invalid filter regex: {err}")))?;

        Ok(Self {
            zone,
            filter,
            ignore_self: config.ignore_self,
            address_mode: config.address_mode,
            addrs_per_host: config.addresses_per_host,
            timeout: Duration::from_secs(config.timeout_secs),
            attempts: config.attempts,
            worker_count: config.worker_count,
            browser,
        })
    }

    /// Addresses to query for one discovered entry, per the configured
    /// policy.
    fn addrs_for_entry(&self, entry: &ServiceEntry) -> Vec<SocketAddr> {
        if let Some(filter) = &self.filter {
            if !filter.is_match(&entry.instance) {
                debug!(
                    instance = %entry.instance,
                    filter = %filter,
                    "ignoring entry, instance name did not match the filter"
                );
                return Vec::new();
            }
        }

        let v4 = entry.addr_v4.iter().copied().map(IpAddr::V4);
        let v6 = entry.addr_v6.iter().copied().map(IpAddr::V6);
        let ips: Vec<IpAddr> = match self.address_mode {
            AddressMode::PreferIpv6 => v6.chain(v4).collect(),
            AddressMode::PreferIpv4 => v4.chain(v6).collect(),
            AddressMode::OnlyIpv6 => v6.collect(),
            AddressMode::OnlyIpv4 => v4.collect(),
        };

        let mut addrs = Vec::new();
        for (idx, ip) in ips.into_iter().enumerate() {
            if self.addrs_per_host > 0 && idx >= self.addrs_per_host {
                break;
            }
            if self.ignore_self && net::is_local_address(ip) {
                debug!(instance = %entry.instance, %ip, "ignoring local address");
                continue;
            }
            addrs.push(SocketAddr::new(ip, entry.port));
        }
        addrs
    }

    /// Snapshot the peer set and flatten it into a fan-out address list.
    fn upstream_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs = Vec::new();
        for entry in self.browser.services() {
            for addr in self.addrs_for_entry(&entry) {
                debug!(instance = %entry.instance, %addr, "forwarding to peer");
                addrs.push(addr);
            }
        }
        addrs
    }

    async fn attempt(&self, query: &Message) -> Result<Message, MeshDnsError> {
        let client = FanoutClient::new(
            self.upstream_addrs(),
            self.timeout,
            self.attempts,
            self.worker_count,
        );
        debug!(peers = client.len(), "fanning out query");
        client.exchange(query).await
    }

    async fn serve<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: &mut R,
    ) -> Result<ResponseInfo, MeshDnsError> {
        let timer = Timer::start();
        let request_info = request.request_info()?;
        let query_name = request_info.query.name().clone();
        let original_query = request_info.query.original().clone();
        debug!(name = %query_name, "received request");

        if !self.zone.zone_of(&query_name) {
            debug!(name = %query_name, zone = %self.zone, "query outside zone, refusing");
            metrics::record_query(QueryResult::Refused, timer.elapsed());
            return self
                .send_error(request, response_handle, ResponseCode::Refused)
                .await;
        }

        let query = upstream_query(request.header().id(), original_query);
        let first = self.attempt(&query).await;

        let acceptable = matches!(
            &first,
            Ok(response) if matches!(
                response.response_code(),
                ResponseCode::NoError | ResponseCode::NXDomain
            )
        );

        let outcome = if acceptable {
            first
        } else {
            let rcode = first.as_ref().map(Message::response_code);
            warn!(
                name = %query_name,
                ?rcode,
                "initial fan-out failed, forcing mDNS refresh and retrying"
            );
            let root = CancellationToken::new();
            crate::session::cancel_after(&root, FORCE_REFRESH_TIMEOUT, |token| async move {
                self.browser.force_refresh(&token).await;
            })
            .await;
            // Retry once against a fresh snapshot; its result is final.
            self.attempt(&query).await
        };

        match outcome {
            Ok(response) => {
                let result = match response.response_code() {
                    ResponseCode::NoError => QueryResult::Success,
                    ResponseCode::NXDomain => QueryResult::NxDomain,
                    _ => QueryResult::ServFail,
                };
                metrics::record_query(result, timer.elapsed());
                self.send_relayed(request, response_handle, &response).await
            }
            Err(err) => {
                error!(name = %query_name, %err, "fan-out failed, returning SERVFAIL");
                metrics::record_query(QueryResult::ServFail, timer.elapsed());
                self.send_error(request, response_handle, ResponseCode::ServFail)
                    .await
            }
        }
    }

    /// Relay an upstream response to the client under the request's id.
    async fn send_relayed<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: &mut R,
        response: &Message,
    ) -> Result<ResponseInfo, MeshDnsError> {
        let builder = MessageResponseBuilder::from_message_request(request);
        let mut header = Header::response_from_request(request.header());
        header.set_response_code(response.response_code());
        header.set_authoritative(false);
        header.set_recursion_available(true);
        header.set_truncated(response.truncated());

        // The upstream OPT record is hickory's to manage, not ours to relay.
        let message = builder.build(
            header,
            response.answers().iter(),
            response.name_servers().iter(),
            std::iter::empty(),
            response
                .additionals()
                .iter()
                .filter(|record| record.record_type() != RecordType::OPT),
        );
        Ok(response_handle.send_response(message).await?)
    }

    async fn send_error<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: &mut R,
        rcode: ResponseCode,
    ) -> Result<ResponseInfo, MeshDnsError> {
        let builder = MessageResponseBuilder::from_message_request(request);
        let message = builder.error_msg(request.header(), rcode);
        Ok(response_handle.send_response(message).await?)
    }
}

/// Build the upstream query from the incoming request's question.
fn upstream_query(id: u16, question: hickory_proto::op::Query) -> Message {
    let mut query = Message::new();
    query.set_id(id);
    query.set_message_type(MessageType::Query);
    query.set_op_code(OpCode::Query);
    query.set_recursion_desired(true);
    query.add_query(question);
    query
}

#[async_trait]
impl RequestHandler for MeshForwardHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        match self.serve(request, &mut response_handle).await {
            Ok(info) => info,
            Err(err) => {
                error!(%err, "request handling failed");
                let mut header = Header::new();
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}
