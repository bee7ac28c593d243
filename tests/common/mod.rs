//! Shared test infrastructure for DNS resolution integration tests.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::authority::{MessageRequest, MessageResponse};
use hickory_server::server::{Protocol, Request, RequestHandler, ResponseHandler, ResponseInfo};

use kubedock_dns::config::DnsConfig;
use kubedock_dns::error::Error;
use kubedock_dns::pod::{Hostname, IpAddress, NetworkId, Pod};
use kubedock_dns::registry::PodRegistry;
use kubedock_dns::resolver::{DnsHandler, SharedNetworks, Upstream};

// --- TestResponseHandler ---

/// Captures the serialized DNS response for inspection in tests.
///
/// Implements `ResponseHandler` so it can be passed to
/// `DnsHandler::handle_request()`. The response is serialized via
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

// --- Mock upstream ---

/// Scripted upstream resolver. Answers are keyed by FQDN (trailing dot
/// included); unknown names resolve to an empty record set.
#[derive(Default)]
pub struct MockUpstream {
    answers: Mutex<HashMap<String, Vec<Record>>>,
    failing: Mutex<bool>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script an A answer for `name` (pass the trailing dot).
    pub fn answer_a(&self, name: &str, ip: Ipv4Addr) {
        let owner = Name::from_ascii(name).expect("scripted name must parse");
        let mut record = Record::from_rdata(owner, 60, RData::A(A(ip)));
        record.set_dns_class(DNSClass::IN);
        self.answers
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push(record);
    }

    /// Make every exchange fail from now on.
    pub fn fail(&self) {
        *self.failing.lock().unwrap() = true;
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn resolve(&self, name: &Name, _record_type: RecordType) -> Result<Vec<Record>, Error> {
        if *self.failing.lock().unwrap() {
            return Err(Error::Config("upstream unavailable".to_string()));
        }
        Ok(self
            .answers
            .lock()
            .unwrap()
            .get(&name.to_string())
            .cloned()
            .unwrap_or_default())
    }
}

// --- Model builders ---

/// Build a ready pod in namespace "test".
pub fn pod(ip: &str, name: &str, aliases: &[&str], networks: &[&str]) -> Pod {
    pod_with_readiness(ip, name, aliases, networks, true)
}

pub fn pod_with_readiness(
    ip: &str,
    name: &str,
    aliases: &[&str],
    networks: &[&str],
    ready: bool,
) -> Pod {
    Pod::new(
        IpAddress::from(ip),
        "test",
        name,
        aliases.iter().map(|a| Hostname::from(*a)).collect(),
        networks.iter().map(|n| NetworkId::from(*n)).collect(),
        ready,
    )
    .expect("test pod must be valid")
}

/// Publish a snapshot built from `pods` and return the holder.
pub fn published_networks(pods: &[Pod]) -> SharedNetworks {
    let shared = SharedNetworks::new();
    publish(&shared, pods);
    shared
}

/// Rebuild and publish a snapshot containing exactly `pods`.
pub fn publish(shared: &SharedNetworks, pods: &[Pod]) {
    let registry = PodRegistry::new();
    for pod in pods {
        registry.add_or_update(pod.clone());
    }
    let (snapshot, errors) = registry.snapshot();
    assert!(errors.is_empty(), "unexpected pod errors: {errors:?}");
    shared.store(snapshot);
}

// --- Handler construction ---

pub struct HandlerConfig {
    pub search_domain: &'static str,
    pub internal_domains: Vec<String>,
    pub lookup_timeout_secs: u64,
    pub lookup_retry_interval_ms: u64,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            search_domain: "",
            internal_domains: Vec::new(),
            // Keep tests fast: a miss fails after one second.
            lookup_timeout_secs: 1,
            lookup_retry_interval_ms: 100,
        }
    }
}

pub fn build_handler(
    networks: SharedNetworks,
    upstream: Arc<MockUpstream>,
    config: HandlerConfig,
) -> DnsHandler {
    let dns_config = DnsConfig {
        search_domain: config.search_domain.to_string(),
        internal_domains: config.internal_domains,
        lookup_timeout_secs: config.lookup_timeout_secs,
        lookup_retry_interval_ms: config.lookup_retry_interval_ms,
        ..DnsConfig::default()
    };
    DnsHandler::new(networks, upstream, &dns_config)
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
    query.set_name(Name::from_ascii(name).expect("query name must parse"));
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg.to_vec().expect("query must serialize")
}

/// Parse wire bytes into a MessageRequest.
pub fn parse_message_request(bytes: &[u8]) -> MessageRequest {
    let mut decoder = BinDecoder::new(bytes);
    MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest")
}

/// Build a full `Request` with a crafted source address.
pub fn build_request(name: &str, record_type: RecordType, src: SocketAddr, id: u16) -> Request {
    let bytes = build_query_bytes(name, record_type, id);
    let msg = parse_message_request(&bytes);
    Request::new(msg, src, Protocol::Udp)
}

/// Source socket for the given pod IP.
pub fn src(ip: &str) -> SocketAddr {
    format!("{ip}:53531").parse().expect("source address must parse")
}

/// Execute a query through the handler and return the parsed response.
pub async fn execute_query(
    handler: &DnsHandler,
    name: &str,
    record_type: RecordType,
    src: SocketAddr,
) -> Message {
    let request = build_request(name, record_type, src, 42);
    let response_handler = TestResponseHandler::new();
    handler.handle_request(&request, response_handler.clone()).await;
    response_handler.into_message()
}

// --- Response helpers ---

/// Extract A addresses from a response.
pub fn extract_a_ips(msg: &Message) -> Vec<Ipv4Addr> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::A(a)) => Some(Ipv4Addr::from(*a)),
            _ => None,
        })
        .collect()
}

/// Extract PTR target names from a response.
pub fn extract_ptr_targets(msg: &Message) -> Vec<String> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::PTR(ptr)) => Some(ptr.0.to_string()),
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

/// Assert a successful response carrying exactly the expected IPs.
pub fn assert_a_response(msg: &Message, expected_ips: &[Ipv4Addr]) {
    assert_response_code(msg, ResponseCode::NoError);
    let mut actual = extract_a_ips(msg);
    actual.sort();
    let mut expected: Vec<Ipv4Addr> = expected_ips.to_vec();
    expected.sort();
    assert_eq!(
        actual, expected,
        "A records mismatch.\nactual:   {:?}\nexpected: {:?}",
        actual, expected
    );
}
