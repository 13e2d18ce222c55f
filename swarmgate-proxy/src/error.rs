//! Error types for the proxy engine.

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Proxy error types.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// TLS configuration error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}
