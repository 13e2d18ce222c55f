//! TLS certificate material held by the routing table.

use std::io::BufReader;
use std::sync::Arc;

use pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use thiserror::Error;

/// Why certificate material could not be loaded.
#[derive(Error, Debug)]
pub enum CertificateError {
    /// The PEM text could not be read.
    #[error("malformed PEM: {0}")]
    Pem(#[from] std::io::Error),

    /// No certificate block was present.
    #[error("no certificate found")]
    NoCertificate,

    /// No private key block was present.
    #[error("no private key found")]
    NoKey,

    /// The key type is not supported by the signing provider.
    #[error("unsupported private key: {0}")]
    UnsupportedKey(#[from] rustls::Error),
}

/// A parsed certificate chain together with its signing key.
///
/// Cloning is a reference count bump, so the same certificate can be handed to
/// any number of concurrent handshakes.
#[derive(Debug, Clone)]
pub struct Certificate(Arc<CertifiedKey>);

impl Certificate {
    /// Parse a PEM certificate chain and PEM private key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, CertificateError> {
        let mut cert_reader = BufReader::new(cert_pem);
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(CertificateError::NoCertificate);
        }

        let mut key_reader = BufReader::new(key_pem);
        let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or(CertificateError::NoKey)?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;

        Ok(Self(Arc::new(CertifiedKey::new(certs, signing_key))))
    }

    /// The key handed to rustls to complete a handshake.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.0)
    }

    /// The end-entity certificate.
    pub fn leaf(&self) -> &CertificateDer<'static> {
        // `from_pem` refuses empty chains.
        &self.0.cert[0]
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.cert == other.0.cert
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::service::TlsMaterial;

    /// Self-signed certificate material for `host`.
    pub(crate) fn self_signed(host: &str) -> TlsMaterial {
        let generated = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
        TlsMaterial {
            certificate: generated.cert.pem(),
            key: generated.key_pair.serialize_pem(),
        }
    }

    #[test]
    fn test_parse_generated_pair() {
        let material = self_signed("s.example");
        let cert = Certificate::from_pem(material.certificate.as_bytes(), material.key.as_bytes())
            .unwrap();
        assert_eq!(cert.certified_key().cert.len(), 1);
        assert!(!cert.leaf().is_empty());
    }

    #[test]
    fn test_missing_certificate_block() {
        let material = self_signed("s.example");
        let err = Certificate::from_pem(b"", material.key.as_bytes()).unwrap_err();
        assert!(matches!(err, CertificateError::NoCertificate));
    }

    #[test]
    fn test_missing_key_block() {
        let material = self_signed("s.example");
        let err = Certificate::from_pem(material.certificate.as_bytes(), b"").unwrap_err();
        assert!(matches!(err, CertificateError::NoKey));
    }

    #[test]
    fn test_distinct_pairs_compare_unequal() {
        let one = self_signed("s.example");
        let two = self_signed("s.example");
        let one = Certificate::from_pem(one.certificate.as_bytes(), one.key.as_bytes()).unwrap();
        let two = Certificate::from_pem(two.certificate.as_bytes(), two.key.as_bytes()).unwrap();
        assert_ne!(one, two);
        assert_eq!(one, one.clone());
    }
}
