//! Cluster watch adapter: pod events become registry mutations and
//! freshly published snapshots.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod as K8sPod;
use kube::api::Api;
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PodConfig;
use crate::metrics;
use crate::pod::{Hostname, IpAddress, NetworkId, Pod, PodError};
use crate::registry::PodRegistry;
use crate::resolver::SharedNetworks;

/// Derive the model record from a cluster pod object.
///
/// `override_ip` substitutes for the cluster-assigned address; the
/// admission path passes a provisional one since the pod has no IP at
/// that point. Without an override the pod must carry an IP. Pods
/// missing the opt-in label or declaring no alias/network are not part
/// of the DNS model and yield an attributed error.
pub fn pod_essentials(
    k8s_pod: &K8sPod,
    override_ip: Option<IpAddress>,
    config: &PodConfig,
) -> Result<Pod, PodError> {
    let namespace = k8s_pod.metadata.namespace.clone().unwrap_or_default();
    let name = k8s_pod.metadata.name.clone().unwrap_or_default();
    let status = k8s_pod.status.as_ref();

    let ip = match override_ip {
        Some(ip) => ip,
        None => match status.and_then(|s| s.pod_ip.clone()).filter(|ip| !ip.is_empty()) {
            Some(ip) => IpAddress::from(ip),
            None => {
                return Err(PodError::new(
                    &namespace,
                    &name,
                    "pod does not have an IP (yet)",
                ))
            }
        },
    };

    let opted_in = k8s_pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(&config.label_name))
        .map(String::as_str)
        == Some("true");
    if !opted_in {
        return Err(PodError::new(
            &namespace,
            &name,
            format!("pod does not have label {} set to 'true'", config.label_name),
        ));
    }

    let mut host_aliases = Vec::new();
    let mut networks = Vec::new();
    if let Some(annotations) = &k8s_pod.metadata.annotations {
        for (key, value) in annotations {
            if key.starts_with(&config.host_alias_prefix) {
                host_aliases.push(Hostname::from(value.as_str()));
            } else if key.starts_with(&config.network_prefix) {
                networks.push(NetworkId::from(value.as_str()));
            }
        }
    }
    if host_aliases.is_empty() || networks.is_empty() {
        return Err(PodError::new(
            &namespace,
            &name,
            "pod not configured for DNS, no host alias or no network declared",
        ));
    }

    let mut ready = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);
    if k8s_pod.metadata.deletion_timestamp.is_some() {
        ready = false;
    }

    Pod::new(ip, namespace, name, host_aliases, networks, ready)
}

enum PodEvent {
    Upsert(Box<K8sPod>),
    Delete { namespace: String, name: String },
}

/// Consumes the cluster's pod watch stream for one namespace and keeps
/// the registry and the published snapshot in sync.
pub struct WatchAdapter {
    registry: Arc<PodRegistry>,
    networks: SharedNetworks,
    config: PodConfig,
}

impl WatchAdapter {
    /// Create an adapter mutating `registry` and publishing to
    /// `networks`.
    pub fn new(registry: Arc<PodRegistry>, networks: SharedNetworks, config: PodConfig) -> Self {
        Self {
            registry,
            networks,
            config,
        }
    }

    /// Watch pods in `namespace` until cancellation.
    ///
    /// Events flow through a single-consumer channel so registry
    /// mutations from the watch path are totally ordered regardless of
    /// how the event source delivers them; each applied change is
    /// followed by a snapshot rebuild that reflects all prior events.
    pub async fn run(self, client: Client, namespace: &str, token: CancellationToken) {
        let (tx, rx) = mpsc::unbounded_channel();

        let consumer = tokio::spawn(Self::apply_events(
            rx,
            Arc::clone(&self.registry),
            self.networks.clone(),
            self.config.clone(),
        ));

        let api: Api<K8sPod> = Api::namespaced(client, namespace);
        let stream = watcher(api, watcher::Config::default()).default_backoff();
        let mut stream = std::pin::pin!(stream);

        info!(namespace, "watching pods");
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => {
                    info!("pod watch shutting down");
                    break;
                }
                event = stream.next() => event,
            };
            match event {
                Some(Ok(Event::Apply(pod) | Event::InitApply(pod))) => {
                    metrics::record_watch_event("apply");
                    let _ = tx.send(PodEvent::Upsert(Box::new(pod)));
                }
                Some(Ok(Event::Delete(pod))) => {
                    metrics::record_watch_event("delete");
                    let _ = tx.send(PodEvent::Delete {
                        namespace: pod.metadata.namespace.unwrap_or_default(),
                        name: pod.metadata.name.unwrap_or_default(),
                    });
                }
                Some(Ok(Event::Init)) => debug!("pod watch (re)listing"),
                Some(Ok(Event::InitDone)) => debug!("pod watch initial list complete"),
                Some(Err(err)) => {
                    metrics::record_watch_event("error");
                    warn!(%err, "pod watch error, backing off");
                }
                None => {
                    warn!("pod watch stream ended");
                    break;
                }
            }
        }

        drop(tx);
        let _ = consumer.await;
    }

    async fn apply_events(
        mut rx: mpsc::UnboundedReceiver<PodEvent>,
        registry: Arc<PodRegistry>,
        networks: SharedNetworks,
        config: PodConfig,
    ) {
        while let Some(event) = rx.recv().await {
            match event {
                PodEvent::Upsert(k8s_pod) => match pod_essentials(&k8s_pod, None, &config) {
                    Ok(pod) => {
                        let key = pod.key();
                        if registry.add_or_update(pod) {
                            publish_snapshot(&registry, &networks);
                            debug!(pod = %key, "published snapshot after pod update");
                        }
                    }
                    Err(err) => info!(%err, "ignoring pod event"),
                },
                PodEvent::Delete { namespace, name } => {
                    registry.delete(&namespace, &name);
                    publish_snapshot(&registry, &networks);
                    debug!(%namespace, %name, "published snapshot after pod deletion");
                }
            }
        }
    }
}

/// Rebuild the snapshot and hand it to the resolver.
///
/// Pod-level errors do not block publication: the offending pods are
/// simply absent from the views they conflict in, and admission is the
/// layer that rejects them.
pub fn publish_snapshot(registry: &PodRegistry, networks: &SharedNetworks) {
    let (snapshot, errors) = registry.snapshot();
    for err in &errors {
        warn!(%err, "pod excluded from network snapshot");
    }
    debug!(
        pods = registry.len(),
        networks = snapshot.network_count(),
        errors = errors.len(),
        "publishing network snapshot"
    );
    metrics::record_snapshot(registry.len(), snapshot.network_count(), errors.len());
    networks.store(snapshot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap;

    fn k8s_pod(
        labels: &[(&str, &str)],
        annotations: &[(&str, &str)],
        pod_ip: Option<&str>,
        ready: bool,
    ) -> K8sPod {
        let mut pod = K8sPod::default();
        pod.metadata.namespace = Some("test".to_string());
        pod.metadata.name = Some("db".to_string());
        pod.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
        pod.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
        pod.status = Some(PodStatus {
            pod_ip: pod_ip.map(str::to_string),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..PodCondition::default()
            }]),
            ..PodStatus::default()
        });
        pod
    }

    fn declared() -> Vec<(&'static str, &'static str)> {
        vec![
            ("kubedock.hostalias/0", "db"),
            ("kubedock.network/0", "n1"),
        ]
    }

    #[test]
    fn test_essentials_from_declared_pod() {
        let pod = k8s_pod(&[("kubedock", "true")], &declared(), Some("10.0.0.10"), true);
        let record = pod_essentials(&pod, None, &PodConfig::default()).unwrap();

        assert_eq!(record.ip, IpAddress::from("10.0.0.10"));
        assert_eq!(record.host_aliases, vec![Hostname::from("db")]);
        assert_eq!(record.networks, vec![NetworkId::from("n1")]);
        assert!(record.ready);
    }

    #[test]
    fn test_pod_without_ip_is_rejected_unless_overridden() {
        let pod = k8s_pod(&[("kubedock", "true")], &declared(), None, false);

        let err = pod_essentials(&pod, None, &PodConfig::default()).unwrap_err();
        assert!(err.reason.contains("IP"), "unexpected reason: {}", err.reason);

        let record =
            pod_essentials(&pod, Some(IpAddress::provisional()), &PodConfig::default()).unwrap();
        assert!(record.ip.is_provisional());
    }

    #[test]
    fn test_label_gate() {
        let config = PodConfig::default();
        for labels in [&[][..], &[("kubedock", "false")][..], &[("other", "true")][..]] {
            let pod = k8s_pod(labels, &declared(), Some("10.0.0.10"), true);
            let err = pod_essentials(&pod, None, &config).unwrap_err();
            assert!(err.reason.contains("label"), "unexpected reason: {}", err.reason);
        }
    }

    #[test]
    fn test_missing_declarations_are_rejected() {
        let config = PodConfig::default();
        let only_alias = k8s_pod(
            &[("kubedock", "true")],
            &[("kubedock.hostalias/0", "db")],
            Some("10.0.0.10"),
            true,
        );
        let only_network = k8s_pod(
            &[("kubedock", "true")],
            &[("kubedock.network/0", "n1")],
            Some("10.0.0.10"),
            true,
        );
        assert!(pod_essentials(&only_alias, None, &config).is_err());
        assert!(pod_essentials(&only_network, None, &config).is_err());
    }

    #[test]
    fn test_multiple_annotations_collect() {
        let pod = k8s_pod(
            &[("kubedock", "true")],
            &[
                ("kubedock.hostalias/0", "db"),
                ("kubedock.hostalias/1", "backend"),
                ("kubedock.network/0", "n1"),
                ("kubedock.network/1", "n2"),
                ("unrelated/annotation", "x"),
            ],
            Some("10.0.0.10"),
            true,
        );
        let record = pod_essentials(&pod, None, &PodConfig::default()).unwrap();
        assert_eq!(
            record.host_aliases,
            vec![Hostname::from("backend"), Hostname::from("db")]
        );
        assert_eq!(
            record.networks,
            vec![NetworkId::from("n1"), NetworkId::from("n2")]
        );
    }

    #[test]
    fn test_deletion_timestamp_clears_readiness() {
        let mut pod = k8s_pod(&[("kubedock", "true")], &declared(), Some("10.0.0.10"), true);
        pod.metadata.deletion_timestamp = Some(Time(Default::default()));

        let record = pod_essentials(&pod, None, &PodConfig::default()).unwrap();
        assert!(!record.ready);
    }

    #[test]
    fn test_not_ready_condition() {
        let pod = k8s_pod(&[("kubedock", "true")], &declared(), Some("10.0.0.10"), false);
        let record = pod_essentials(&pod, None, &PodConfig::default()).unwrap();
        assert!(!record.ready);
    }
}
