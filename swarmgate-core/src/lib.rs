//! SwarmGate Core functionality.
//!
//! This crate contains the service model, the lock-free routing snapshots and the
//! sync loop that keeps them current against the cache collaborator.

pub mod error;

/// Routing domain models.
pub mod domain {
    pub mod certificate;
    pub mod routing;
    pub mod service;
}

/// Keeping the routing table in sync with the external cache.
pub mod sync {
    pub mod cache;
    pub mod sync_loop;
}

pub use domain::certificate::Certificate;
pub use domain::routing::{Route, RoutingTable, SharedRoutingTable, Snapshot};
pub use domain::service::{decode_services, SecurityMode, Service, TargetSpec, TlsMaterial};
pub use error::{CacheError, SyncError, TableError};
pub use sync::cache::{Cache, Notifications};
pub use sync::sync_loop::{SyncConfig, SyncLoop};
