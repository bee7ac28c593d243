//! Pod records and the typed names used throughout the network model.

use std::fmt;

use thiserror::Error;

/// Prefix of placeholder addresses assigned at admission time, before
/// the cluster has scheduled the pod. Lookups recognize the prefix and
/// never answer with (or for) such an address.
pub const PROVISIONAL_IP_PREFIX: &str = "unknownip:";

/// A pod address as carried in the model: either a real cluster IP or a
/// provisional `unknownip:<suffix>` placeholder, which is why this is a
/// string newtype rather than `std::net::IpAddr`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpAddress(String);

impl IpAddress {
    /// Synthesize a placeholder address guaranteed unique per call.
    pub fn provisional() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        Self(format!("{PROVISIONAL_IP_PREFIX}{nanos}{}", rand::random::<u32>()))
    }

    /// True when this is a placeholder rather than a real address.
    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_IP_PREFIX)
    }

    /// The address as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IpAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IpAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A short hostname a pod is reachable by inside its networks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hostname(String);

impl Hostname {
    /// The alias as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Hostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Hostname {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Hostname {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque identifier grouping pods that may resolve each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkId(String);

impl NetworkId {
    /// The id as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NetworkId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NetworkId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An error attributable to a specific pod declaration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{namespace}/{name}: {reason}")]
pub struct PodError {
    /// Namespace of the offending pod.
    pub namespace: String,
    /// Name of the offending pod.
    pub name: String,
    /// Human-readable reason, echoed verbatim in deny responses.
    pub reason: String,
}

impl PodError {
    /// Attribute `reason` to the pod `namespace/name`.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// True when this error is attributed to the given pod.
    pub fn is_for(&self, namespace: &str, name: &str) -> bool {
        self.namespace == namespace && self.name == name
    }
}

/// One declared workload: the canonical entity of the network model.
///
/// Equality is structural over all fields; the registry relies on that
/// to detect no-op updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pod {
    /// Cluster IP, or a provisional placeholder.
    pub ip: IpAddress,
    /// Namespace the pod lives in.
    pub namespace: String,
    /// Pod name.
    pub name: String,
    /// Declared aliases, sorted and deduplicated.
    pub host_aliases: Vec<Hostname>,
    /// Declared networks, sorted and deduplicated.
    pub networks: Vec<NetworkId>,
    /// True iff the pod is serving (ready condition and not deleting).
    pub ready: bool,
}

impl Pod {
    /// Build a pod record. Aliases and networks are sorted and
    /// deduplicated; every alias must be a valid RFC-1123 label.
    /// Aliases are lowercased so they match DNS queries, which arrive
    /// case-folded.
    pub fn new(
        ip: IpAddress,
        namespace: impl Into<String>,
        name: impl Into<String>,
        host_aliases: Vec<Hostname>,
        networks: Vec<NetworkId>,
        ready: bool,
    ) -> Result<Self, PodError> {
        let namespace = namespace.into();
        let name = name.into();

        let mut host_aliases: Vec<Hostname> = host_aliases
            .into_iter()
            .map(|h| Hostname(h.0.to_ascii_lowercase()))
            .collect();
        host_aliases.sort();
        host_aliases.dedup();

        let mut networks = networks;
        networks.sort();
        networks.dedup();

        for alias in &host_aliases {
            if !is_valid_hostname(alias.as_str()) {
                return Err(PodError::new(
                    &namespace,
                    &name,
                    format!("invalid host alias '{alias}'"),
                ));
            }
        }

        Ok(Self {
            ip,
            namespace,
            name,
            host_aliases,
            networks,
            ready,
        })
    }

    /// Registry key, `namespace/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Structural equality with the IP masked out. The admission path
    /// registers pods under a provisional address which the watch later
    /// replaces, so "did the declaration change?" must not look at it.
    pub fn equal_ignoring_ip(&self, other: &Pod) -> bool {
        self.namespace == other.namespace
            && self.name == other.name
            && self.host_aliases == other.host_aliases
            && self.networks == other.networks
            && self.ready == other.ready
    }
}

/// RFC-1123 label: 1-63 characters, alphanumeric or '-', starting and
/// ending alphanumeric.
fn is_valid_hostname(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    let bytes = label.as_bytes();
    if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
        return false;
    }
    bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}
