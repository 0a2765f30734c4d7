//! Shared test infrastructure for the forward handler integration tests.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hickory_proto::op::{Header, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::authority::{MessageRequest, MessageResponse, MessageResponseBuilder};
use hickory_server::proto::xfer::Protocol;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use hickory_server::ServerFuture;
use tokio_util::sync::CancellationToken;

use mesh_dns::browser::Browse;
use mesh_dns::config::{AddressMode, ForwardConfig};
use mesh_dns::resolve::ServiceEntry;

// --- TestResponseHandler ---

/// Captures the serialized DNS response for inspection in tests.
///
/// Implements `ResponseHandler` so it can be passed to
/// `RequestHandler::handle_request()`. The response is serialized via
/// `MessageResponse::destructive_emit()` and stored as raw wire-format
/// bytes, which can then be parsed with `Message::from_vec()`.
#[derive(Clone)]
pub struct TestResponseHandler {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl TestResponseHandler {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::with_capacity(512))),
        }
    }

    /// Parse the captured wire bytes into a `Message` for assertions.
    pub fn into_message(self) -> Message {
        let buf = self.buf.lock().unwrap();
        assert!(!buf.is_empty(), "no response was captured");
        Message::from_vec(&buf).expect("failed to parse captured DNS response")
    }
}

#[async_trait]
impl ResponseHandler for TestResponseHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        let mut buf = self.buf.lock().unwrap();
        buf.clear();
        let mut encoder = BinEncoder::new(&mut *buf);
        encoder.set_max_size(u16::MAX);
        let info = response
            .destructive_emit(&mut encoder)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(info)
    }
}

// --- Fake browser ---

/// A [`Browse`] fake with a fixed peer set. `force_refresh` is counted and
/// swaps in a replacement peer set when one is staged.
pub struct FakeBrowse {
    services: Mutex<Vec<ServiceEntry>>,
    after_refresh: Mutex<Option<Vec<ServiceEntry>>>,
    refresh_count: AtomicUsize,
}

impl FakeBrowse {
    pub fn new(services: Vec<ServiceEntry>) -> Arc<Self> {
        Arc::new(Self {
            services: Mutex::new(services),
            after_refresh: Mutex::new(None),
            refresh_count: AtomicUsize::new(0),
        })
    }

    /// Stage a peer set that becomes visible after the next force_refresh.
    pub fn stage_after_refresh(&self, services: Vec<ServiceEntry>) {
        *self.after_refresh.lock().unwrap() = Some(services);
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Browse for FakeBrowse {
    fn start(&self) {}

    async fn stop(&self) {}

    fn services(&self) -> Vec<ServiceEntry> {
        self.services.lock().unwrap().clone()
    }

    async fn force_refresh(&self, _cancel: &CancellationToken) {
        self.refresh_count.fetch_add(1, Ordering::SeqCst);
        if let Some(replacement) = self.after_refresh.lock().unwrap().take() {
            *self.services.lock().unwrap() = replacement;
        }
    }
}

// --- Upstream DNS servers ---

/// A `RequestHandler` that answers every query the same way.
struct StaticHandler {
    rcode: ResponseCode,
    answer: Option<Ipv4Addr>,
}

#[async_trait]
impl RequestHandler for StaticHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let builder = MessageResponseBuilder::from_message_request(request);
        let mut header = Header::response_from_request(request.header());
        header.set_response_code(self.rcode);
        header.set_authoritative(true);

        let answers: Vec<Record> = match (self.rcode, self.answer, request.request_info()) {
            (ResponseCode::NoError, Some(ip), Ok(info)) => {
                let name = Name::from(info.query.name().clone());
                vec![Record::from_rdata(name, 60, RData::A(A::from(ip)))]
            }
            _ => Vec::new(),
        };

        let response = builder.build(
            header,
            answers.iter(),
            std::iter::empty(),
            std::iter::empty(),
            std::iter::empty(),
        );
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(_) => {
                let mut header = Header::new();
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}

/// Start a static upstream DNS server on an ephemeral loopback port.
pub async fn start_upstream(rcode: ResponseCode, answer: Option<Ipv4Addr>) -> SocketAddr {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("failed to bind upstream socket");
    let addr = socket.local_addr().unwrap();

    let mut server = ServerFuture::new(StaticHandler { rcode, answer });
    server.register_socket(socket);
    tokio::spawn(async move {
        let _ = server.block_until_done().await;
    });

    addr
}

// --- Entry and config builders ---

/// A discovered peer pointing at a loopback upstream.
pub fn peer_entry(instance: &str, upstream: SocketAddr) -> ServiceEntry {
    let ip = match upstream {
        SocketAddr::V4(v4) => *v4.ip(),
        SocketAddr::V6(_) => panic!("test upstreams are IPv4"),
    };
    ServiceEntry {
        instance: instance.to_string(),
        hostname: format!("{instance}.local."),
        addr_v4: vec![ip],
        addr_v6: vec![],
        port: upstream.port(),
        ttl: 120,
    }
}

/// Forward configuration tuned for fast tests.
pub fn test_forward_config() -> ForwardConfig {
    ForwardConfig {
        zone: ".".to_string(),
        address_mode: AddressMode::OnlyIpv4,
        addresses_per_host: 0,
        timeout_secs: 2,
        attempts: 1,
        worker_count: 2,
        ..Default::default()
    }
}

// --- Query/Request construction ---

/// Build wire-format bytes for a DNS query.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(Name::from_ascii(name).unwrap());
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg.to_vec().unwrap()
}

/// Build a full `Request` for a UDP query from localhost.
pub fn build_request(name: &str, record_type: RecordType, id: u16) -> Request {
    let bytes = build_query_bytes(name, record_type, id);
    let mut decoder = BinDecoder::new(&bytes);
    let msg = MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest");
    Request::new(msg, "127.0.0.1:12345".parse().unwrap(), Protocol::Udp)
}

// --- Response helpers ---

/// Extract A record addresses from a response.
pub fn extract_a_ips(msg: &Message) -> Vec<Ipv4Addr> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(Ipv4Addr::from(*a)),
            _ => None,
        })
        .collect()
}

/// Assert response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}
