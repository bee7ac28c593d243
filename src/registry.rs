//! Thread-safe pod registry and snapshot construction.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::linked_map::LinkedMap;
use crate::network::Networks;
use crate::pod::{Pod, PodError};

/// The set of declared pods, keyed `namespace/name`.
///
/// Iteration follows first-insertion order, and updates keep a pod's
/// position. Snapshot construction is online and order-dependent under
/// misconfiguration, so two event interleavings that end in the same pod
/// set must attribute errors to the same offender; keying by first-seen
/// order guarantees that.
///
/// Records are immutable once stored: updates replace the `Arc`, so
/// snapshots keep seeing the version they were built from.
#[derive(Debug, Default)]
pub struct PodRegistry {
    pods: RwLock<LinkedMap<String, Arc<Pod>>>,
}

impl PodRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record under the pod's `namespace/name`.
    /// Returns false when the stored record is structurally equal, so
    /// callers can skip snapshot rebuilds on no-op events.
    pub fn add_or_update(&self, pod: Pod) -> bool {
        let mut pods = self.pods.write();
        let key = pod.key();
        if let Some(existing) = pods.get(&key) {
            if existing.as_ref() == &pod {
                debug!(pod = %key, "no change to pod declaration");
                return false;
            }
        }
        debug!(pod = %key, ip = %pod.ip, ready = pod.ready, "pod declaration updated");
        pods.insert(key, Arc::new(pod));
        true
    }

    /// The record stored for `namespace/name`, if any.
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.pods.read().get(&format!("{namespace}/{name}")).cloned()
    }

    /// Remove the record for `namespace/name`.
    pub fn delete(&self, namespace: &str, name: &str) {
        let mut pods = self.pods.write();
        if pods.remove(&format!("{namespace}/{name}")).is_some() {
            debug!(namespace, name, "pod declaration removed");
        }
    }

    /// Build a fresh snapshot from every registered pod, in insertion
    /// order. Errors are attributed to the offending pod and collected,
    /// never fatal; the snapshot still contains every pod that indexed
    /// cleanly. The read lock is released before the snapshot is
    /// returned, so holders need no further synchronization.
    pub fn snapshot(&self) -> (Networks, Vec<PodError>) {
        let pods = self.pods.read();
        let mut networks = Networks::new();
        let mut errors = Vec::new();
        for (_, pod) in pods.iter() {
            if let Err(err) = networks.add(Arc::clone(pod)) {
                errors.push(err);
            }
        }
        (networks, errors)
    }

    /// Shallow clone of the registry; records are shared, positions are
    /// preserved.
    pub fn copy(&self) -> Self {
        let pods = self.pods.read();
        let mut clone = LinkedMap::new();
        for (key, pod) in pods.iter() {
            clone.insert(key.clone(), Arc::clone(pod));
        }
        Self {
            pods: RwLock::new(clone),
        }
    }

    /// Number of registered pods.
    pub fn len(&self) -> usize {
        self.pods.read().len()
    }

    /// True when no pod is registered.
    pub fn is_empty(&self) -> bool {
        self.pods.read().is_empty()
    }

    /// Keys in iteration order; snapshot construction sees this order.
    pub fn keys(&self) -> Vec<String> {
        self.pods.read().iter().map(|(k, _)| k.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::{Hostname, IpAddress, NetworkId};

    fn pod(ip: &str, name: &str, aliases: &[&str], networks: &[&str], ready: bool) -> Pod {
        Pod::new(
            IpAddress::from(ip),
            "test",
            name,
            aliases.iter().map(|a| Hostname::from(*a)).collect(),
            networks.iter().map(|n| NetworkId::from(*n)).collect(),
            ready,
        )
        .unwrap()
    }

    #[test]
    fn test_add_or_update_reports_changes() {
        let registry = PodRegistry::new();
        let record = pod("10.0.0.10", "db", &["db"], &["n1"], false);

        assert!(registry.add_or_update(record.clone()));
        // Structurally equal record is a no-op.
        assert!(!registry.add_or_update(record.clone()));
        // Readiness flip is a change.
        assert!(registry.add_or_update(pod("10.0.0.10", "db", &["db"], &["n1"], true)));
        // So is a new IP, the provisional-to-real transition.
        assert!(registry.add_or_update(pod("10.0.0.11", "db", &["db"], &["n1"], true)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_updates_keep_first_insertion_order() {
        let registry = PodRegistry::new();
        registry.add_or_update(pod("10.0.0.10", "a", &["a"], &["n1"], true));
        registry.add_or_update(pod("10.0.0.20", "b", &["b"], &["n1"], true));
        registry.add_or_update(pod("10.0.0.11", "a", &["a"], &["n1"], true));

        assert_eq!(registry.keys(), vec!["test/a", "test/b"]);

        registry.delete("test", "a");
        registry.add_or_update(pod("10.0.0.12", "a", &["a"], &["n1"], true));
        assert_eq!(registry.keys(), vec!["test/b", "test/a"]);
    }

    #[test]
    fn test_get_and_delete() {
        let registry = PodRegistry::new();
        registry.add_or_update(pod("10.0.0.10", "db", &["db"], &["n1"], true));

        assert_eq!(
            registry.get("test", "db").unwrap().ip,
            IpAddress::from("10.0.0.10")
        );
        assert!(registry.get("test", "missing").is_none());

        registry.delete("test", "db");
        assert!(registry.get("test", "db").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_independent_of_later_mutations() {
        let registry = PodRegistry::new();
        registry.add_or_update(pod("10.0.0.10", "db", &["db"], &["n1"], true));

        let (snapshot, errors) = registry.snapshot();
        assert!(errors.is_empty());

        registry.delete("test", "db");
        registry.add_or_update(pod("10.0.0.20", "web", &["web"], &["n1"], true));

        // The snapshot still answers from the state it was built from.
        assert_eq!(
            snapshot.lookup(&IpAddress::from("10.0.0.10"), &Hostname::from("db")),
            vec![IpAddress::from("10.0.0.10")]
        );
        assert!(snapshot
            .lookup(&IpAddress::from("10.0.0.20"), &Hostname::from("web"))
            .is_empty());
    }

    #[test]
    fn test_copy_shares_records_but_not_membership() {
        let registry = PodRegistry::new();
        registry.add_or_update(pod("10.0.0.10", "db", &["db"], &["n1"], true));

        let copy = registry.copy();
        copy.add_or_update(pod("10.0.0.20", "web", &["web"], &["n1"], true));

        assert_eq!(copy.len(), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("test", "web").is_none());
        assert_eq!(copy.keys(), vec!["test/db", "test/web"]);
    }
}
