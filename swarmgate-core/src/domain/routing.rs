//! Routing module for mapping virtual hosts to their targets.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use http::StatusCode;
use tracing::warn;

use crate::domain::certificate::Certificate;
use crate::domain::service::{Service, TargetSpec};
use crate::error::TableError;

/// An HTTP backend that requests are forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    authority: Authority,
    base_path: String,
}

impl Upstream {
    /// Parse an absolute `http://host[:port][/base]` address.
    pub fn parse(address: &str) -> Result<Self, String> {
        let uri: Uri = address.parse().map_err(|e| format!("{e}"))?;
        if uri.scheme() != Some(&Scheme::HTTP) {
            return Err(format!("unsupported scheme in {address}, expected http"));
        }
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| format!("missing host in {address}"))?;
        if uri.query().is_some() {
            return Err(format!("query not allowed in {address}"));
        }
        let base_path = uri.path().trim_end_matches('/').to_string();

        Ok(Self { authority, base_path })
    }

    /// The backend's `host:port`.
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Build the backend URI for an inbound request's path and query.
    pub fn uri_for(&self, path_and_query: Option<&PathAndQuery>) -> Result<Uri, http::Error> {
        let pq = path_and_query.map(PathAndQuery::as_str).unwrap_or("/");
        let joined = if self.base_path.is_empty() {
            Cow::Borrowed(pq)
        } else {
            Cow::Owned(format!("{}{}", self.base_path, pq))
        };

        Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(self.authority.clone())
            .path_and_query(joined.as_ref())
            .build()
    }
}

/// The closed set of things a resolved request can be handed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Reverse proxy to an HTTP backend.
    Forward(Upstream),
    /// Answer with a fixed response without contacting any backend.
    Static {
        /// Response status.
        status: StatusCode,
        /// Response body.
        body: Bytes,
    },
}

impl Route {
    fn compile(spec: &TargetSpec, host: &str) -> Result<Self, TableError> {
        let invalid = |reason: String| TableError::InvalidTarget {
            host: host.to_string(),
            reason,
        };

        match spec {
            TargetSpec::Forward { address } => Upstream::parse(address).map(Route::Forward).map_err(invalid),
            TargetSpec::Static { status, body } => {
                let status = StatusCode::from_u16(*status).map_err(|e| invalid(e.to_string()))?;
                Ok(Route::Static {
                    status,
                    body: Bytes::from(body.clone()),
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
struct SecureEntry {
    route: Arc<Route>,
    certificate: Certificate,
}

/// An immutable point-in-time view of every route.
///
/// Snapshots are never modified once built; updates build a new one.
#[derive(Debug, Default)]
pub struct Snapshot {
    plain: HashMap<String, Arc<Route>>,
    secure: HashMap<String, SecureEntry>,
}

impl Snapshot {
    /// Build a snapshot from the complete service list.
    ///
    /// Fails as a whole if any record is invalid. When two records claim the
    /// same hostname on the same listener the later one wins.
    pub fn build(services: &[Service]) -> Result<Self, TableError> {
        let mut snapshot = Snapshot::default();

        for service in services {
            let hosts = service
                .hostnames
                .iter()
                .map(|h| normalize(h).into_owned())
                .collect::<Vec<_>>();
            if hosts.is_empty() || hosts.iter().any(String::is_empty) {
                return Err(TableError::EmptyHostname);
            }
            let first = &hosts[0];

            let route = Arc::new(Route::compile(&service.target, first)?);

            if service.mode.serves_plain() {
                for host in &hosts {
                    if snapshot.plain.insert(host.clone(), Arc::clone(&route)).is_some() {
                        warn!(host = %host, "hostname claimed by more than one plain service, last one wins");
                    }
                }
            }

            if service.mode.serves_secure() {
                let material = service
                    .tls
                    .as_ref()
                    .ok_or_else(|| TableError::MissingCertificate { host: first.clone() })?;
                let certificate = Certificate::from_pem(material.certificate.as_bytes(), material.key.as_bytes())
                    .map_err(|e| TableError::InvalidCertificate {
                        host: first.clone(),
                        reason: e.to_string(),
                    })?;

                for host in &hosts {
                    let entry = SecureEntry {
                        route: Arc::clone(&route),
                        certificate: certificate.clone(),
                    };
                    if snapshot.secure.insert(host.clone(), entry).is_some() {
                        warn!(host = %host, "hostname claimed by more than one secure service, last one wins");
                    }
                }
            }
        }

        Ok(snapshot)
    }

    /// Find the route for `host` on the plain or TLS listener.
    pub fn resolve(&self, host: &str, secure: bool) -> Option<&Arc<Route>> {
        let host = normalize(host);
        if secure {
            self.secure.get(host.as_ref()).map(|entry| &entry.route)
        } else {
            self.plain.get(host.as_ref())
        }
    }

    /// Find the certificate served for `host`.
    pub fn certificate_for(&self, host: &str) -> Option<&Certificate> {
        self.secure.get(normalize(host).as_ref()).map(|entry| &entry.certificate)
    }

    /// Number of hostnames routable over plain HTTP.
    pub fn plain_routes(&self) -> usize {
        self.plain.len()
    }

    /// Number of hostnames routable over HTTPS.
    pub fn secure_routes(&self) -> usize {
        self.secure.len()
    }
}

/// Hostnames are matched case-insensitively and without a trailing root dot.
fn normalize(host: &str) -> Cow<'_, str> {
    let host = host.trim().trim_end_matches('.');
    if host.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(host.to_ascii_lowercase())
    } else {
        Cow::Borrowed(host)
    }
}

/// A lock-free routing table mapping virtual hosts to routes and certificates.
///
/// Uses `ArcSwap` so the sync loop can publish a whole new [`Snapshot`] in one
/// atomic store while requests and handshakes keep reading without locks.
#[derive(Debug, Default)]
pub struct RoutingTable {
    current: ArcSwap<Snapshot>,
}

impl RoutingTable {
    /// Create an empty routing table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from `services` and atomically make it current.
    ///
    /// On error nothing is installed and the previous snapshot stays current.
    pub fn update(&self, services: &[Service]) -> Result<Arc<Snapshot>, TableError> {
        let snapshot = Arc::new(Snapshot::build(services)?);
        self.current.store(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Resolve the route for `host` against the current snapshot.
    pub fn resolve(&self, host: &str, secure: bool) -> Option<Arc<Route>> {
        self.current.load().resolve(host, secure).cloned()
    }

    /// Look up the certificate for `host` in the current snapshot.
    pub fn certificate_for(&self, host: &str) -> Option<Certificate> {
        self.current.load().certificate_for(host).cloned()
    }

    /// Retrieve the current snapshot, for callers needing several consistent reads.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }
}

/// A shared reference to the lock-free routing table.
pub type SharedRoutingTable = Arc<RoutingTable>;
