//! kubedock-dns - docker-compose style networking for Kubernetes pods.
//!
//! Pods are grouped into named networks through annotations. Within a
//! network, pods resolve each other's declared host aliases to pod IPs;
//! pods in different networks are mutually invisible. Resolution is
//! source-IP-sensitive: the same query gets different answers depending
//! on which pod asked.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         kubedock-dns                           │
//! │                                                                │
//! │  ┌───────────────┐ events ┌──────────────┐                     │
//! │  │  Pod watcher  │───────▶│ Pod registry │◀───────┐            │
//! │  │ (kube client) │        │ (insertion-  │        │ validate + │
//! │  └───────────────┘        │  ordered)    │        │ register   │
//! │                           └──────┬───────┘   ┌────┴─────────┐  │
//! │                                  │ snapshot  │  Admission   │◀─┼── HTTPS :8443
//! │                                  ▼           │  webhook     │  │
//! │                           ┌──────────────┐   │ (JSON patch) │  │
//! │              UDP :1053 ──▶│ DNS resolver │   └──────────────┘  │
//! │                           │ (source-IP   │                     │
//! │                           │  aware)      │──▶ upstream DNS     │
//! │                           └──────────────┘                     │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The registry is the single source of truth. Every mutation rebuilds
//! an immutable [`network::Networks`] snapshot that is atomically
//! published to the resolver, so the query path never takes a lock
//! beyond one pointer copy.
//!
//! ## Resolution
//!
//! ```text
//! query "db." from 10.1.2.3
//!   → networks of 10.1.2.3
//!   → ready pods with alias "db" in those networks
//!   → one A record per pod IP (TTL 300, authoritative)
//! ```
//!
//! Internal names that are not yet registered are retried for a bounded
//! window (pods often query right after starting, before the watch has
//! seen their peers) and then answered with SERVFAIL so the client's
//! own resolver policy takes over. External names go upstream.

#![warn(missing_docs)]

pub mod admission;
pub mod config;
pub mod error;
pub mod linked_map;
pub mod metrics;
pub mod network;
pub mod pod;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod telemetry;
pub mod watcher;

// Re-export main types
pub use config::{Config, DnsConfig, PodConfig, TelemetryConfig, WebhookConfig};
pub use error::Error;
pub use network::Networks;
pub use pod::{Hostname, IpAddress, NetworkId, Pod, PodError};
pub use registry::PodRegistry;
pub use resolver::{DnsHandler, Forwarder, SharedNetworks, Upstream};
pub use server::DnsServer;
