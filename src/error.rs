//! Error types for kubedock-dns.

use thiserror::Error;

/// Errors that can occur in the DNS server and webhook.
///
/// Errors attributable to a specific pod declaration are carried by
/// [`crate::pod::PodError`] instead, which keeps the namespace/name
/// attribution the admission path needs.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error (sockets, TLS material on disk)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),

    /// Upstream resolver failure
    #[error("upstream resolution failed: {0}")]
    Resolve(#[from] hickory_resolver::error::ResolveError),

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}
