//! Error types for the routing core.

use thiserror::Error;

/// Reasons a routing snapshot could not be built from a service list.
///
/// Any of these rejects the whole update; the previously installed snapshot
/// stays current.
#[derive(Error, Debug)]
pub enum TableError {
    /// A record carried an empty hostname.
    #[error("service record has an empty hostname")]
    EmptyHostname,

    /// A record served over TLS has no certificate material.
    #[error("secure hostname {host} has no certificate material")]
    MissingCertificate {
        /// The first hostname of the offending record.
        host: String,
    },

    /// Certificate material could not be turned into a signing certificate.
    #[error("invalid certificate for {host}: {reason}")]
    InvalidCertificate {
        /// The first hostname of the offending record.
        host: String,
        /// Why parsing failed.
        reason: String,
    },

    /// A routing target could not be compiled.
    #[error("invalid target for {host}: {reason}")]
    InvalidTarget {
        /// The first hostname of the offending record.
        host: String,
        /// Why the target was rejected.
        reason: String,
    },
}

/// Errors reported by a cache collaborator.
#[derive(Error, Debug)]
pub enum CacheError {
    /// IO error talking to the store.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The store answered with something that is not valid for the request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The requested key does not exist.
    #[error("key {0} not found")]
    Missing(String),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    Closed,

    /// Connecting took longer than allowed.
    #[error("timed out connecting to {0}")]
    Timeout(String),
}

/// A failed load-and-apply pass of the sync loop.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The service list could not be fetched.
    #[error("failed to fetch services: {0}")]
    Fetch(#[from] CacheError),

    /// The payload was not a valid service list.
    #[error("failed to decode services: {0}")]
    Decode(#[from] serde_json::Error),

    /// The service list decoded but could not be turned into a routing table.
    #[error("failed to build routing table: {0}")]
    Table(#[from] TableError),
}
