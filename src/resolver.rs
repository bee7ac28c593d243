//! Source-IP-aware DNS resolution over network snapshots.
//!
//! The handler classifies each question as internal or external.
//! Internal names resolve from the current snapshot only; a miss means
//! "not yet registered" and is retried for a bounded window, because a
//! pod may query its peers before the watch path has seen their IPs.
//! External names and unsupported record types are delegated to the
//! upstream resolver.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Header, ResponseCode};
use hickory_proto::rr::rdata::{A, PTR};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use parking_lot::RwLock;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, trace, warn};

use crate::config::DnsConfig;
use crate::error::Error;
use crate::metrics::{self, QueryResult, Timer};
use crate::network::Networks;
use crate::pod::{Hostname, IpAddress};

/// TTL of records answered from the snapshot.
const ANSWER_TTL: u32 = 300;

/// The published network snapshot.
///
/// The lock is held only long enough to copy the `Arc`; readers then
/// operate on their reference without synchronization, since snapshots
/// are immutable. Publishing swaps the pointer.
#[derive(Clone, Debug, Default)]
pub struct SharedNetworks(Arc<RwLock<Arc<Networks>>>);

impl SharedNetworks {
    /// Create a holder publishing an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot.
    pub fn load(&self) -> Arc<Networks> {
        Arc::clone(&self.0.read())
    }

    /// Atomically publish a new snapshot.
    pub fn store(&self, networks: Networks) {
        *self.0.write() = Arc::new(networks);
    }
}

/// Upstream resolution seam. Questions not answered from the snapshot
/// are delegated here with their original name and type, and the
/// returned records are copied verbatim into the answer section.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Resolve `name`/`record_type` against the upstream server.
    async fn resolve(&self, name: &Name, record_type: RecordType) -> Result<Vec<Record>, Error>;
}

/// Upstream forwarder backed by `hickory_resolver`, using either an
/// explicit server or the system resolver configuration.
pub struct Forwarder {
    resolver: TokioAsyncResolver,
}

impl Forwarder {
    /// Forward to the resolvers named in `/etc/resolv.conf`.
    pub fn from_system_conf() -> Result<Self, Error> {
        Ok(Self {
            resolver: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }

    /// Forward to one explicit upstream server.
    pub fn new(upstream: IpAddr, port: u16) -> Self {
        let servers = NameServerConfigGroup::from_ips_clear(&[upstream], port, true);
        let config = ResolverConfig::from_parts(None, Vec::new(), servers);
        Self {
            resolver: TokioAsyncResolver::tokio(config, ResolverOpts::default()),
        }
    }
}

#[async_trait]
impl Upstream for Forwarder {
    async fn resolve(&self, name: &Name, record_type: RecordType) -> Result<Vec<Record>, Error> {
        match self.resolver.lookup(name.clone(), record_type).await {
            Ok(lookup) => Ok(lookup.records().to_vec()),
            Err(err) if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }
}

enum Answered {
    Local(Vec<Record>),
    Forwarded(Vec<Record>),
}

enum AnswerError {
    /// Internal name with no snapshot entry yet; retried by the caller.
    NotYetKnown,
    Upstream(Error),
}

/// DNS request handler answering from the published snapshot.
pub struct DnsHandler {
    networks: SharedNetworks,
    upstream: Arc<dyn Upstream>,
    search_domain: String,
    internal_domains: Vec<String>,
    lookup_timeout: Duration,
    lookup_retry_interval: Duration,
    override_source_ip: Option<IpAddress>,
}

impl DnsHandler {
    /// Create a handler reading snapshots from `networks` and
    /// delegating external names to `upstream`.
    pub fn new(networks: SharedNetworks, upstream: Arc<dyn Upstream>, config: &DnsConfig) -> Self {
        Self {
            networks,
            upstream,
            search_domain: config.search_domain.clone(),
            internal_domains: config.internal_domains.clone(),
            lookup_timeout: config.lookup_timeout(),
            lookup_retry_interval: config.lookup_retry_interval(),
            override_source_ip: None,
        }
    }

    /// Fix the source IP for every query instead of taking the socket
    /// peer address. Testing aid, wired to `KUBEDOCK_DNS_SOURCE_IP`.
    pub fn override_source_ip(&mut self, ip: IpAddress) {
        self.override_source_ip = Some(ip);
    }

    fn source_ip(&self, request: &Request) -> IpAddress {
        match &self.override_source_ip {
            Some(ip) => ip.clone(),
            None => IpAddress::from(request.src().ip().to_string()),
        }
    }

    /// A name is internal iff, after stripping the trailing dot and the
    /// search-domain suffix, it contains no dot or ends with one of the
    /// configured internal domains.
    fn is_internal(&self, name: &str) -> bool {
        let name = name.strip_suffix('.').unwrap_or(name);
        let name = self.strip_search_domain(name);
        if !name.contains('.') {
            return true;
        }
        self.internal_domains.iter().any(|domain| {
            let suffix = format!(".{domain}");
            name.ends_with(suffix.as_str())
        })
    }

    fn strip_search_domain<'a>(&self, name: &'a str) -> &'a str {
        if self.search_domain.is_empty() {
            return name;
        }
        let suffix = format!(".{}", self.search_domain);
        name.strip_suffix(suffix.as_str()).unwrap_or(name)
    }

    async fn answer_question(
        &self,
        snapshot: &Networks,
        source_ip: &IpAddress,
        request: &Request,
    ) -> Result<Answered, AnswerError> {
        let query = request.query();
        let name = query.name().to_string();

        match query.query_type() {
            RecordType::A => {
                let internal = self.is_internal(&name);
                let stripped = name.strip_suffix('.').unwrap_or(&name);
                let hostname = Hostname::from(self.strip_search_domain(stripped));
                debug!(source = %source_ip, %name, internal, "A query");

                let ips = snapshot.lookup(source_ip, &hostname);
                if !ips.is_empty() {
                    let owner = query.original().name().clone();
                    return Ok(Answered::Local(a_records(&owner, &ips)));
                }
                if internal {
                    Err(AnswerError::NotYetKnown)
                } else {
                    self.forward(request).await
                }
            }
            RecordType::PTR => {
                let ip = IpAddress::from(ptr_to_ip(&name));
                debug!(source = %source_ip, %name, target = %ip, "PTR query");

                let hosts = snapshot.reverse_lookup(source_ip, &ip);
                if !hosts.is_empty() {
                    let owner = query.original().name().clone();
                    return Ok(Answered::Local(ptr_records(&owner, &hosts)));
                }
                self.forward(request).await
            }
            other => {
                trace!(source = %source_ip, %name, rtype = ?other, "delegating query type upstream");
                self.forward(request).await
            }
        }
    }

    async fn forward(&self, request: &Request) -> Result<Answered, AnswerError> {
        let query = request.query().original();
        self.upstream
            .resolve(query.name(), query.query_type())
            .await
            .map(Answered::Forwarded)
            .map_err(AnswerError::Upstream)
    }

    async fn reply<R: ResponseHandler>(
        &self,
        request: &Request,
        mut handle: R,
        answers: Vec<Record>,
    ) -> ResponseInfo {
        let builder = MessageResponseBuilder::from_message_request(request);
        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(true);
        let response = builder.build(
            header,
            answers.iter(),
            std::iter::empty(),
            std::iter::empty(),
            std::iter::empty(),
        );
        match handle.send_response(response).await {
            Ok(info) => info,
            Err(err) => {
                error!(%err, "failed to send DNS response");
                serve_failed()
            }
        }
    }

    async fn fail<R: ResponseHandler>(&self, request: &Request, mut handle: R) -> ResponseInfo {
        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.error_msg(request.header(), ResponseCode::ServFail);
        match handle.send_response(response).await {
            Ok(info) => info,
            Err(err) => {
                error!(%err, "failed to send DNS failure response");
                serve_failed()
            }
        }
    }
}

#[async_trait]
impl RequestHandler for DnsHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        let source_ip = self.source_ip(request);
        let rtype = format!("{:?}", request.query().query_type());
        let timer = Timer::start();
        let deadline = Instant::now() + self.lookup_timeout;

        loop {
            // Each iteration re-reads the pointer; one iteration answers
            // the whole request from a single snapshot.
            let snapshot = self.networks.load();
            match self.answer_question(&snapshot, &source_ip, request).await {
                Ok(Answered::Local(answers)) => {
                    metrics::record_query(&rtype, QueryResult::Answered, timer.elapsed());
                    return self.reply(request, response_handle, answers).await;
                }
                Ok(Answered::Forwarded(answers)) => {
                    metrics::record_query(&rtype, QueryResult::Forwarded, timer.elapsed());
                    return self.reply(request, response_handle, answers).await;
                }
                Err(AnswerError::NotYetKnown)
                    if Instant::now() + self.lookup_retry_interval <= deadline =>
                {
                    trace!(source = %source_ip, "internal name not yet registered, retrying");
                    metrics::record_lookup_retry();
                    sleep(self.lookup_retry_interval).await;
                }
                Err(AnswerError::NotYetKnown) => {
                    debug!(
                        source = %source_ip,
                        name = %request.query().name(),
                        "internal name not found, answering SERVFAIL"
                    );
                    metrics::record_query(&rtype, QueryResult::NotFound, timer.elapsed());
                    return self.fail(request, response_handle).await;
                }
                Err(AnswerError::Upstream(err)) => {
                    warn!(%err, name = %request.query().name(), "upstream resolution failed");
                    metrics::record_query(&rtype, QueryResult::UpstreamFailed, timer.elapsed());
                    return self.fail(request, response_handle).await;
                }
            }
        }
    }
}

fn serve_failed() -> ResponseInfo {
    let mut header = Header::new();
    header.set_response_code(ResponseCode::ServFail);
    ResponseInfo::from(header)
}

fn a_records(owner: &Name, ips: &[IpAddress]) -> Vec<Record> {
    ips.iter()
        .filter_map(|ip| match ip.as_str().parse::<Ipv4Addr>() {
            Ok(addr) => {
                let mut record = Record::from_rdata(owner.clone(), ANSWER_TTL, RData::A(A(addr)));
                record.set_dns_class(DNSClass::IN);
                Some(record)
            }
            Err(_) => {
                warn!(%ip, "pod IP is not a valid IPv4 address, skipping");
                None
            }
        })
        .collect()
}

fn ptr_records(owner: &Name, hosts: &[Hostname]) -> Vec<Record> {
    hosts
        .iter()
        .filter_map(|host| match Name::from_ascii(format!("{host}.")) {
            Ok(target) => {
                let mut record =
                    Record::from_rdata(owner.clone(), ANSWER_TTL, RData::PTR(PTR(target)));
                record.set_dns_class(DNSClass::IN);
                Some(record)
            }
            Err(err) => {
                warn!(%host, %err, "host alias is not a valid DNS name, skipping");
                None
            }
        })
        .collect()
}

/// Convert the `d.c.b.a.in-addr.arpa.` PTR form to the dotted IP
/// `a.b.c.d`.
pub fn ptr_to_ip(ptr: &str) -> String {
    let ptr = ptr.strip_suffix('.').unwrap_or(ptr);
    let ptr = ptr.strip_suffix(".in-addr.arpa").unwrap_or(ptr);
    let mut octets: Vec<&str> = ptr.split('.').collect();
    octets.reverse();
    octets.join(".")
}
