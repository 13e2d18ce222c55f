//! Service records as published by the producer.

use serde::{Deserialize, Serialize};

/// Which listeners a service is reachable on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Plain HTTP only.
    #[default]
    Plain,
    /// HTTPS only.
    Secure,
    /// Both listeners.
    Both,
}

impl SecurityMode {
    /// Whether the service answers on the plain listener.
    pub fn serves_plain(self) -> bool {
        matches!(self, SecurityMode::Plain | SecurityMode::Both)
    }

    /// Whether the service answers on the TLS listener.
    pub fn serves_secure(self) -> bool {
        matches!(self, SecurityMode::Secure | SecurityMode::Both)
    }
}

/// Where requests for a service go, as described by the producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TargetSpec {
    /// Reverse proxy to an HTTP backend, e.g. `http://shop:8080`.
    Forward {
        /// Absolute backend URI.
        address: String,
    },
    /// Answer directly with a fixed response.
    Static {
        /// HTTP status code.
        status: u16,
        /// Response body.
        #[serde(default)]
        body: String,
    },
}

/// PEM encoded certificate chain and private key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMaterial {
    /// Certificate chain, leaf first.
    pub certificate: String,
    /// Private key (PKCS#8, PKCS#1 or SEC1).
    pub key: String,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("certificate", &format_args!("{} bytes", self.certificate.len()))
            .field("key", &"<redacted>")
            .finish()
    }
}

/// One logical backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Virtual hostnames the service answers for.
    pub hostnames: Vec<String>,
    /// Listeners the service is reachable on.
    #[serde(default)]
    pub mode: SecurityMode,
    /// Routing target.
    pub target: TargetSpec,
    /// Certificate material, required for secure services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsMaterial>,
}

/// Decode the serialized service list held by the cache.
pub fn decode_services(payload: &[u8]) -> Result<Vec<Service>, serde_json::Error> {
    serde_json::from_slice(payload)
}
