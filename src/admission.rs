//! Mutating admission webhook for pod DNS configuration.
//!
//! Pods are validated against the registry before the cluster assigns
//! them an IP: accepted pods are pre-registered under a provisional
//! address (the watch path later supplies the real one) and patched to
//! use this server as their sole resolver.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request as HttpRequest, Response as HttpResponse, StatusCode};
use hyper_util::rt::TokioIo;
use json_patch::{AddOperation, Patch, PatchOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::{Pod as K8sPod, PodDNSConfig, PodDNSConfigOption};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::response::Status;
use kube::core::DynamicObject;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{PodConfig, WebhookConfig};
use crate::error::Error;
use crate::metrics;
use crate::pod::{IpAddress, Pod, PodError};
use crate::registry::PodRegistry;
use crate::watcher::pod_essentials;

/// Identity recorded in deny audit annotations.
pub const CONTROLLER_NAME: &str = "kubedock-admission";

type Body = Full<Bytes>;
type ResponseReview = AdmissionReview<DynamicObject>;

/// Resolver options written into admitted pods' `dnsConfig`, taken from
/// the webhook host's resolv.conf with optional CLI overrides.
#[derive(Debug, Clone)]
pub struct ClientDnsOptions {
    /// Search list propagated verbatim.
    pub searches: Vec<String>,
    /// `ndots` option value.
    pub ndots: u32,
    /// `timeout` option value, seconds.
    pub timeout_seconds: u32,
    /// `attempts` option value.
    pub attempts: u32,
}

/// Validates incoming pod declarations and emits the DNS patch.
pub struct PodMutator {
    registry: Arc<PodRegistry>,
    pod_config: PodConfig,
    dns_service_ip: String,
    client_dns: ClientDnsOptions,
    // Two concurrent admissions could each pass validation alone yet
    // conflict jointly; this makes validate+commit one critical section.
    validation_lock: Mutex<()>,
}

impl PodMutator {
    /// Create a mutator registering pods into `registry` and pointing
    /// them at `dns_service_ip`.
    pub fn new(
        registry: Arc<PodRegistry>,
        pod_config: PodConfig,
        dns_service_ip: String,
        client_dns: ClientDnsOptions,
    ) -> Self {
        Self {
            registry,
            pod_config,
            dns_service_ip,
            client_dns,
            validation_lock: Mutex::new(()),
        }
    }

    /// Process one admission review envelope.
    pub fn review(&self, review: AdmissionReview<K8sPod>) -> ResponseReview {
        let request: AdmissionRequest<K8sPod> = match review.try_into() {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "invalid admission review");
                return AdmissionResponse::invalid(err).into_review();
            }
        };
        self.admit(request).into_review()
    }

    fn admit(&self, request: AdmissionRequest<K8sPod>) -> AdmissionResponse {
        let response = AdmissionResponse::from(&request);
        let operation = operation_name(&request.operation);

        let Some(k8s_pod) = request.object.as_ref() else {
            return AdmissionResponse::invalid("admission request carries no pod object");
        };

        // The pod typically has no IP yet at Create time; register it
        // under a unique provisional address until the watch path
        // observes the real one.
        let ip = k8s_pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .filter(|ip| !ip.is_empty())
            .map(IpAddress::from)
            .unwrap_or_else(IpAddress::provisional);

        let pod = match pod_essentials(k8s_pod, Some(ip), &self.pod_config) {
            Ok(pod) => pod,
            Err(err) => {
                info!(%err, "pod is not admissible");
                metrics::record_admission(operation, false);
                return reject(response, &err.to_string());
            }
        };

        let key = pod.key();
        if let Err(err) = self.validate(&request.operation, pod) {
            warn!(pod = %key, %err, "pod declaration rejected");
            metrics::record_admission(operation, false);
            return reject(response, &err.to_string());
        }

        info!(pod = %key, "pod admitted, patching dnsConfig");
        metrics::record_admission(operation, true);
        match self.dns_config_patch() {
            Ok(patch) => match response.with_patch(patch) {
                Ok(response) => response,
                Err(err) => {
                    error!(%err, "failed to attach dnsConfig patch");
                    AdmissionResponse::invalid(err)
                }
            },
            Err(err) => {
                error!(%err, "failed to build dnsConfig patch");
                AdmissionResponse::invalid(err)
            }
        }
    }

    /// Validate the declaration and commit it to the registry in one
    /// critical section.
    fn validate(&self, operation: &Operation, pod: Pod) -> Result<(), PodError> {
        let _guard = self.validation_lock.lock();

        if matches!(operation, Operation::Update) {
            if let Some(existing) = self.registry.get(&pod.namespace, &pod.name) {
                if !existing.equal_ignoring_ip(&pod) {
                    return Err(PodError::new(
                        &pod.namespace,
                        &pod.name,
                        "cannot change network configuration after creation",
                    ));
                }
            }
        }

        let (namespace, name) = (pod.namespace.clone(), pod.name.clone());
        self.registry.add_or_update(pod);

        // Insertion order makes validation deterministic: whatever the
        // event interleaving, the same offender is attributed.
        let (_, errors) = self.registry.snapshot();
        let (mine, others): (Vec<_>, Vec<_>) = errors
            .into_iter()
            .partition(|err| err.is_for(&namespace, &name));

        // Other pods were validated at their own admission time; stale
        // inconsistencies there are no reason to reject this request.
        for err in &others {
            warn!(%err, "ignoring configuration error on another pod");
        }

        if let Some(err) = mine.into_iter().next() {
            self.registry.delete(&namespace, &name);
            return Err(err);
        }
        Ok(())
    }

    /// The two JSON-patch operations applied to every admitted pod.
    fn dns_config_patch(&self) -> Result<Patch, serde_json::Error> {
        let dns_config = PodDNSConfig {
            nameservers: Some(vec![self.dns_service_ip.clone()]),
            searches: Some(self.client_dns.searches.clone()),
            options: Some(vec![
                dns_option("ndots", self.client_dns.ndots),
                dns_option("timeout", self.client_dns.timeout_seconds),
                dns_option("attempts", self.client_dns.attempts),
            ]),
        };

        Ok(Patch(vec![
            PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["spec", "dnsPolicy"]),
                value: serde_json::Value::String("None".to_string()),
            }),
            PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["spec", "dnsConfig"]),
                value: serde_json::to_value(&dns_config)?,
            }),
        ]))
    }
}

fn dns_option(name: &str, value: u32) -> PodDNSConfigOption {
    PodDNSConfigOption {
        name: Some(name.to_string()),
        value: Some(value.to_string()),
    }
}

fn operation_name(operation: &Operation) -> &'static str {
    match operation {
        Operation::Create => "create",
        Operation::Update => "update",
        Operation::Delete => "delete",
        Operation::Connect => "connect",
    }
}

fn reject(mut response: AdmissionResponse, message: &str) -> AdmissionResponse {
    response.allowed = false;
    response.result = Status::failure(message, "Conflict").with_code(409);
    response
        .audit_annotations
        .insert("rejected-by".to_string(), CONTROLLER_NAME.to_string());
    response
        .audit_annotations
        .insert("reason".to_string(), "policy-violation".to_string());
    response
}

/// Serve the webhook over TLS until cancellation.
pub async fn serve(
    mutator: Arc<PodMutator>,
    config: WebhookConfig,
    token: CancellationToken,
) -> Result<(), Error> {
    let tls = load_tls_config(&config.cert_file, &config.key_file)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls));
    let listener = TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "admission webhook listening");

    loop {
        let (stream, peer) = tokio::select! {
            _ = token.cancelled() => {
                info!("admission webhook shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };

        let acceptor = acceptor.clone();
        let mutator = Arc::clone(&mutator);
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(%peer, %err, "TLS handshake failed");
                    return;
                }
            };
            let service =
                service_fn(move |request| handle_http(Arc::clone(&mutator), request));
            if let Err(err) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(%peer, %err, "webhook connection error");
            }
        });
    }
}

async fn handle_http(
    mutator: Arc<PodMutator>,
    request: HttpRequest<Incoming>,
) -> Result<HttpResponse<Body>, hyper::Error> {
    match (request.method(), request.uri().path()) {
        (&Method::POST, "/mutate/pods") => mutate(mutator, request).await,
        (&Method::GET, "/healthz") => Ok(HttpResponse::new(Body::from(Bytes::from_static(b"ok")))),
        _ => Ok(HttpResponse::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::default())
            .expect("static response must be valid")),
    }
}

async fn mutate(
    mutator: Arc<PodMutator>,
    request: HttpRequest<Incoming>,
) -> Result<HttpResponse<Body>, hyper::Error> {
    let bytes = request.into_body().collect().await?.to_bytes();
    let review: AdmissionReview<K8sPod> = match serde_json::from_reader(bytes.reader()) {
        Ok(review) => review,
        Err(err) => {
            warn!(%err, "failed to parse admission request body");
            return Ok(json_response(&AdmissionResponse::invalid(err).into_review()));
        }
    };
    Ok(json_response(&mutator.review(review)))
}

fn json_response(review: &ResponseReview) -> HttpResponse<Body> {
    match serde_json::to_vec(review) {
        Ok(bytes) => HttpResponse::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Body::from(Bytes::from(bytes)))
            .expect("admission review response must be valid"),
        Err(err) => {
            error!(%err, "failed to encode admission review response");
            HttpResponse::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::default())
                .expect("static response must be valid")
        }
    }
}

fn load_tls_config(cert_file: &Path, key_file: &Path) -> Result<rustls::ServerConfig, Error> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_file)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_file)?))?
        .ok_or_else(|| Error::Config(format!("no private key found in {}", key_file.display())))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(config)
}
