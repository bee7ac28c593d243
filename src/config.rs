//! Configuration types for kubedock-dns.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// The pod contract: how pods opt in to the DNS model.
    #[serde(default)]
    pub pod: PodConfig,

    /// DNS server configuration.
    #[serde(default)]
    pub dns: DnsConfig,

    /// Admission webhook configuration.
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Label and annotation keys through which pods declare themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodConfig {
    /// Pods must carry this label with value `"true"` to participate.
    #[serde(default = "default_label_name")]
    pub label_name: String,

    /// Annotation keys with this prefix carry host aliases, one per key.
    #[serde(default = "default_host_alias_prefix")]
    pub host_alias_prefix: String,

    /// Annotation keys with this prefix carry network ids, one per key.
    #[serde(default = "default_network_prefix")]
    pub network_prefix: String,
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            label_name: default_label_name(),
            host_alias_prefix: default_host_alias_prefix(),
            network_prefix: default_network_prefix(),
        }
    }
}

fn default_label_name() -> String {
    "kubedock".to_string()
}

fn default_host_alias_prefix() -> String {
    "kubedock.hostalias/".to_string()
}

fn default_network_prefix() -> String {
    "kubedock.network/".to_string()
}

/// DNS server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// UDP listen address. The cluster service remaps port 53 here.
    #[serde(default = "default_dns_listen")]
    pub listen_addr: SocketAddr,

    /// Search domain stripped from query names before consulting the
    /// registry. When empty it is derived from the host resolver
    /// configuration at startup.
    #[serde(default)]
    pub search_domain: String,

    /// Domain suffixes that mark a dotted name as internal. Internal
    /// names are never forwarded upstream; a miss means "not yet
    /// registered" and is retried.
    #[serde(default)]
    pub internal_domains: Vec<String>,

    /// Explicit upstream resolver address. Falls back to the system
    /// resolver configuration when unset.
    #[serde(default)]
    pub upstream: Option<SocketAddr>,

    /// Total time to retry an internal name that is not yet registered
    /// before answering SERVFAIL.
    #[serde(default = "default_lookup_timeout_secs")]
    pub lookup_timeout_secs: u64,

    /// Pause between retries of an internal name, in milliseconds.
    #[serde(default = "default_lookup_retry_interval_ms")]
    pub lookup_retry_interval_ms: u64,
}

impl DnsConfig {
    /// Retry window for internal names that are not yet registered.
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }

    /// Poll interval inside the retry window.
    pub fn lookup_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lookup_retry_interval_ms)
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_dns_listen(),
            search_domain: String::new(),
            internal_domains: Vec::new(),
            upstream: None,
            lookup_timeout_secs: default_lookup_timeout_secs(),
            lookup_retry_interval_ms: default_lookup_retry_interval_ms(),
        }
    }
}

fn default_dns_listen() -> SocketAddr {
    "0.0.0.0:1053"
        .parse()
        .expect("default DNS listen address must parse")
}

fn default_lookup_timeout_secs() -> u64 {
    20
}

fn default_lookup_retry_interval_ms() -> u64 {
    1000
}

/// Admission webhook configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// TLS listen address for the webhook server.
    #[serde(default = "default_webhook_listen")]
    pub listen_addr: SocketAddr,

    /// PEM certificate presented to the cluster.
    #[serde(default = "default_cert_file")]
    pub cert_file: PathBuf,

    /// PEM private key matching the certificate.
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,

    /// Name of the Service whose cluster IP is written into admitted
    /// pods as their sole nameserver.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Override for the `timeout` resolver option propagated to
    /// admitted pods; host resolv.conf value when unset.
    #[serde(default)]
    pub client_dns_timeout_secs: Option<u64>,

    /// Override for the `attempts` resolver option propagated to
    /// admitted pods; host resolv.conf value when unset.
    #[serde(default)]
    pub client_dns_retries: Option<u32>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_webhook_listen(),
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            service_name: default_service_name(),
            client_dns_timeout_secs: None,
            client_dns_retries: None,
        }
    }
}

fn default_webhook_listen() -> SocketAddr {
    "0.0.0.0:8443"
        .parse()
        .expect("default webhook listen address must parse")
}

fn default_cert_file() -> PathBuf {
    PathBuf::from("/etc/kubedock-dns/tls/tls.crt")
}

fn default_key_file() -> PathBuf {
    PathBuf::from("/etc/kubedock-dns/tls/tls.key")
}

fn default_service_name() -> String {
    "dns".to_string()
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "kubedock_dns=debug,warn").
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

fn default_log_level() -> String {
    "info".to_string()
}
