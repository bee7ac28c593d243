//! kubedock-dns binary entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use k8s_openapi::api::core::v1::Service;
use kube::api::Api;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kubedock_dns::admission::{self, ClientDnsOptions, PodMutator};
use kubedock_dns::resolver::{DnsHandler, Forwarder, SharedNetworks, Upstream};
use kubedock_dns::watcher::WatchAdapter;
use kubedock_dns::{telemetry, Config, DnsServer, IpAddress, PodRegistry};

/// Source-IP-aware DNS for docker-compose style pod networks.
#[derive(Parser, Debug)]
#[command(name = "kubedock-dns")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Annotation prefix carrying host aliases.
    #[arg(long)]
    host_alias_prefix: Option<String>,

    /// Annotation prefix carrying network ids.
    #[arg(long)]
    network_prefix: Option<String>,

    /// Label pods must set to "true" to opt in.
    #[arg(long)]
    label_name: Option<String>,

    /// Webhook TLS certificate path.
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Webhook TLS private key path.
    #[arg(long)]
    key: Option<PathBuf>,

    /// Domain suffix resolved internally only; repeatable.
    #[arg(long = "internal-domain")]
    internal_domains: Vec<String>,

    /// DNS timeout written into admitted pods' resolver options.
    #[arg(long, value_parser = humantime::parse_duration)]
    client_dns_timeout: Option<Duration>,

    /// DNS attempts written into admitted pods' resolver options.
    #[arg(long)]
    client_dns_retries: Option<u32>,
}

impl Args {
    fn apply_to(&self, config: &mut Config) {
        if let Some(prefix) = &self.host_alias_prefix {
            config.pod.host_alias_prefix = prefix.clone();
        }
        if let Some(prefix) = &self.network_prefix {
            config.pod.network_prefix = prefix.clone();
        }
        if let Some(label) = &self.label_name {
            config.pod.label_name = label.clone();
        }
        if let Some(cert) = &self.cert {
            config.webhook.cert_file = cert.clone();
        }
        if let Some(key) = &self.key {
            config.webhook.key_file = key.clone();
        }
        if !self.internal_domains.is_empty() {
            config.dns.internal_domains = self.internal_domains.clone();
        }
        if let Some(timeout) = self.client_dns_timeout {
            config.webhook.client_dns_timeout_secs = Some(timeout.as_secs());
        }
        if let Some(retries) = self.client_dns_retries {
            config.webhook.client_dns_retries = Some(retries);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration: file, then environment, then flags.
    let mut builder = config::Config::builder();
    if let Some(path) = &args.config {
        builder = builder.add_source(config::File::from(path.clone()));
    }
    let mut cfg: Config = builder
        .add_source(
            config::Environment::with_prefix("KUBEDOCK_DNS")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    args.apply_to(&mut cfg);

    telemetry::init(&cfg.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider was already installed");
    }

    // Kubernetes connection and target namespace.
    let kube_config = kube::Config::infer().await?;
    let namespace = kube_config.default_namespace.clone();
    let client = kube::Client::try_from(kube_config)?;
    info!(%namespace, "connected to cluster");

    // The host resolver configuration supplies the resolver's search
    // domain and the options propagated into admitted pods.
    let (resolv_config, resolv_opts) = hickory_resolver::system_conf::read_system_conf()?;
    let searches: Vec<String> = resolv_config
        .search()
        .iter()
        .map(|name| name.to_string().trim_end_matches('.').to_string())
        .collect();
    if cfg.dns.search_domain.is_empty() {
        cfg.dns.search_domain = searches.first().cloned().unwrap_or_default();
    }
    let client_dns = ClientDnsOptions {
        searches,
        ndots: resolv_opts.ndots as u32,
        timeout_seconds: cfg
            .webhook
            .client_dns_timeout_secs
            .unwrap_or(resolv_opts.timeout.as_secs()) as u32,
        attempts: cfg
            .webhook
            .client_dns_retries
            .unwrap_or(resolv_opts.attempts as u32),
    };

    // Admitted pods point at the DNS service's cluster IP.
    let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
    let service = services.get(&cfg.webhook.service_name).await?;
    let dns_service_ip = service
        .spec
        .and_then(|spec| spec.cluster_ip)
        .ok_or_else(|| {
            format!(
                "service '{}' has no cluster IP",
                cfg.webhook.service_name
            )
        })?;
    info!(service = %cfg.webhook.service_name, ip = %dns_service_ip, "resolved DNS service IP");

    let registry = Arc::new(PodRegistry::new());
    let networks = SharedNetworks::new();

    let upstream: Arc<dyn Upstream> = match cfg.dns.upstream {
        Some(addr) => Arc::new(Forwarder::new(addr.ip(), addr.port())),
        None => Arc::new(Forwarder::from_system_conf()?),
    };
    let mut handler = DnsHandler::new(networks.clone(), upstream, &cfg.dns);
    if let Ok(source_ip) = std::env::var("KUBEDOCK_DNS_SOURCE_IP") {
        if !source_ip.is_empty() {
            warn!(%source_ip, "overriding the source IP of every DNS query");
            handler.override_source_ip(IpAddress::from(source_ip));
        }
    }

    let token = CancellationToken::new();

    let dns_server = DnsServer::new(cfg.dns.clone(), handler);
    let dns_handle = tokio::spawn({
        let token = token.clone();
        async move {
            if let Err(err) = dns_server.run(token).await {
                error!(%err, "DNS server failed");
            }
        }
    });

    let adapter = WatchAdapter::new(Arc::clone(&registry), networks.clone(), cfg.pod.clone());
    let watch_handle = tokio::spawn({
        let client = client.clone();
        let namespace = namespace.clone();
        let token = token.clone();
        async move { adapter.run(client, &namespace, token).await }
    });

    let mutator = Arc::new(PodMutator::new(
        Arc::clone(&registry),
        cfg.pod.clone(),
        dns_service_ip,
        client_dns,
    ));
    let webhook_handle = tokio::spawn({
        let webhook_config = cfg.webhook.clone();
        let token = token.clone();
        async move {
            if let Err(err) = admission::serve(mutator, webhook_config, token).await {
                error!(%err, "admission webhook failed");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    token.cancel();
    let _ = tokio::join!(dns_handle, watch_handle, webhook_handle);

    info!("kubedock-dns shutdown complete");
    Ok(())
}
