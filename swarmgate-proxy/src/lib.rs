//! SwarmGate Proxy Engine
//!
//! The Tokio engine that binds the plain and TLS listeners, resolves certificates
//! by SNI, dispatches requests by virtual host and follows the Redis cache for
//! route changes.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod redis;
pub mod server;
pub mod tls;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::ProxyError;
