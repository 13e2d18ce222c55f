//! TLS termination and certificate resolution for SwarmGate.
//!
//! There is no static certificate: every handshake picks its certificate from
//! the current routing snapshot using the client's SNI name. A name without a
//! certificate fails the handshake.

use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use swarmgate_core::SharedRoutingTable;

use crate::error::Result;

/// Resolves handshake certificates from the routing table.
#[derive(Debug)]
pub struct SniResolver {
    table: SharedRoutingTable,
}

impl SniResolver {
    /// Create a resolver reading from `table`.
    pub fn new(table: SharedRoutingTable) -> Self {
        Self { table }
    }

    /// The certificate for a requested server name, if one is registered.
    pub fn lookup(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = server_name else {
            debug!("TLS client sent no server name, refusing handshake");
            return None;
        };

        match self.table.certificate_for(name) {
            Some(certificate) => Some(certificate.certified_key()),
            None => {
                debug!(server_name = %name, "no certificate for server name, refusing handshake");
                None
            }
        }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.lookup(client_hello.server_name())
    }
}

/// Build the listener's `ServerConfig` around an [`SniResolver`].
pub fn server_config(table: SharedRoutingTable) -> Result<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver::new(table)));

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// A `TlsAcceptor` for the TLS listener.
pub fn acceptor(table: SharedRoutingTable) -> Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(server_config(table)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmgate_core::{Certificate, RoutingTable, SecurityMode, Service, TargetSpec, TlsMaterial};

    fn material(host: &str) -> TlsMaterial {
        let generated = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
        TlsMaterial {
            certificate: generated.cert.pem(),
            key: generated.key_pair.serialize_pem(),
        }
    }

    fn service(host: &str, mode: SecurityMode, tls: Option<TlsMaterial>) -> Service {
        Service {
            hostnames: vec![host.to_string()],
            mode,
            target: TargetSpec::Static { status: 200, body: String::new() },
            tls,
        }
    }

    #[test]
    fn test_lookup_follows_table() {
        let table = Arc::new(RoutingTable::new());
        let resolver = SniResolver::new(Arc::clone(&table));
        let cert1 = material("s.example");
        let cert2 = material("s.example");

        table
            .update(&[
                service("a.example", SecurityMode::Plain, None),
                service("s.example", SecurityMode::Secure, Some(cert1.clone())),
            ])
            .unwrap();

        let leaf1 = Certificate::from_pem(cert1.certificate.as_bytes(), cert1.key.as_bytes())
            .unwrap()
            .leaf()
            .clone();
        assert_eq!(resolver.lookup(Some("s.example")).unwrap().cert[0], leaf1);
        assert!(resolver.lookup(Some("a.example")).is_none());
        assert!(resolver.lookup(Some("b.example")).is_none());
        assert!(resolver.lookup(None).is_none());

        table
            .update(&[service("s.example", SecurityMode::Secure, Some(cert2.clone()))])
            .unwrap();
        let leaf2 = Certificate::from_pem(cert2.certificate.as_bytes(), cert2.key.as_bytes())
            .unwrap()
            .leaf()
            .clone();
        assert_eq!(resolver.lookup(Some("s.example")).unwrap().cert[0], leaf2);
    }

    #[test]
    fn test_server_config_advertises_alpn() {
        let config = server_config(Arc::new(RoutingTable::new())).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }
}
