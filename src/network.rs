//! The immutable network snapshot the resolver answers from.
//!
//! A snapshot is built from the registry in one pass and never mutated
//! afterwards; mutators build a fresh one and publish it, so readers
//! hold their reference without any locking (copy-on-write).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::trace;

use crate::pod::{Hostname, IpAddress, NetworkId, Pod, PodError};

/// One named network: every pod that declared the id, indexed by IP and
/// by host alias. Several pods may share an alias (a scaled service);
/// the resolver answers with every ready one.
#[derive(Debug)]
pub struct Network {
    id: NetworkId,
    ip_to_pod: HashMap<IpAddress, Arc<Pod>>,
    alias_to_pods: HashMap<Hostname, Vec<Arc<Pod>>>,
}

impl Network {
    fn new(id: NetworkId) -> Self {
        Self {
            id,
            ip_to_pod: HashMap::new(),
            alias_to_pods: HashMap::new(),
        }
    }

    /// The network id.
    pub fn id(&self) -> &NetworkId {
        &self.id
    }

    /// The pod holding `ip` in this network, if any.
    pub fn pod_by_ip(&self, ip: &IpAddress) -> Option<&Arc<Pod>> {
        self.ip_to_pod.get(ip)
    }

    /// All pods declaring `alias` in this network, in insertion order.
    pub fn pods_by_alias(&self, alias: &Hostname) -> &[Arc<Pod>] {
        self.alias_to_pods.get(alias).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of pods in this network.
    pub fn len(&self) -> usize {
        self.ip_to_pod.len()
    }

    /// True when no pod declared this network.
    pub fn is_empty(&self) -> bool {
        self.ip_to_pod.is_empty()
    }
}

/// Indexed view over every declared network: `network-id → network` plus
/// `ip → network ids` for source-IP dispatch.
#[derive(Debug, Default)]
pub struct Networks {
    networks: HashMap<NetworkId, Network>,
    ip_to_networks: HashMap<IpAddress, BTreeSet<NetworkId>>,
}

impl Networks {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `pod` under every network it declares.
    ///
    /// The pod must declare at least one network; the registry only
    /// stores validated records, so a violation here is a bug in the
    /// caller, not a recoverable condition. Alias collisions are not
    /// rejected at this layer: several pods may legitimately serve one
    /// alias, and the stricter declaration rules belong to admission.
    pub fn add(&mut self, pod: Arc<Pod>) -> Result<(), PodError> {
        assert!(
            !pod.networks.is_empty(),
            "pod {} has no declared networks",
            pod.key()
        );

        for network_id in &pod.networks {
            let network = self
                .networks
                .entry(network_id.clone())
                .or_insert_with(|| Network::new(network_id.clone()));
            network.ip_to_pod.insert(pod.ip.clone(), Arc::clone(&pod));
            for alias in &pod.host_aliases {
                network
                    .alias_to_pods
                    .entry(alias.clone())
                    .or_default()
                    .push(Arc::clone(&pod));
            }
            self.ip_to_networks
                .entry(pod.ip.clone())
                .or_default()
                .insert(network_id.clone());
        }
        Ok(())
    }

    /// Resolve `hostname` as seen from `source_ip`: the addresses of
    /// every ready pod carrying the alias in any network the source
    /// participates in. Provisional sources and provisional targets
    /// never resolve.
    pub fn lookup(&self, source_ip: &IpAddress, hostname: &Hostname) -> Vec<IpAddress> {
        if source_ip.is_provisional() {
            return Vec::new();
        }
        trace!(source = %source_ip, host = %hostname, "lookup");
        let Some(ids) = self.ip_to_networks.get(source_ip) else {
            return Vec::new();
        };

        let mut ips = Vec::new();
        for id in ids {
            let Some(network) = self.networks.get(id) else {
                continue;
            };
            for pod in network.pods_by_alias(hostname) {
                if pod.ready && !pod.ip.is_provisional() && !ips.contains(&pod.ip) {
                    ips.push(pod.ip.clone());
                }
            }
        }
        ips
    }

    /// Resolve `ip` back to host aliases as seen from `source_ip`: the
    /// aliases of the first ready pod holding the address in any network
    /// the source participates in.
    pub fn reverse_lookup(&self, source_ip: &IpAddress, ip: &IpAddress) -> Vec<Hostname> {
        if source_ip.is_provisional() || ip.is_provisional() {
            return Vec::new();
        }
        trace!(source = %source_ip, target = %ip, "reverse lookup");
        let Some(ids) = self.ip_to_networks.get(source_ip) else {
            return Vec::new();
        };

        for id in ids {
            if let Some(pod) = self.networks.get(id).and_then(|n| n.pod_by_ip(ip)) {
                if pod.ready {
                    return pod.host_aliases.clone();
                }
            }
        }
        Vec::new()
    }

    /// The network registered under `id`, if any.
    pub fn network(&self, id: &NetworkId) -> Option<&Network> {
        self.networks.get(id)
    }

    /// Ids of the networks `ip` participates in.
    pub fn networks_for_ip(&self, ip: &IpAddress) -> Option<&BTreeSet<NetworkId>> {
        self.ip_to_networks.get(ip)
    }

    /// Number of declared networks.
    pub fn network_count(&self) -> usize {
        self.networks.len()
    }
}
