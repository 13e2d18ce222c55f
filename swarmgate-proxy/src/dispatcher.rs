//! Per-request virtual host dispatch.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, HOST};
use hyper::{Request, Response, StatusCode, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{error, info, warn};

use swarmgate_core::domain::routing::Upstream;
use swarmgate_core::{Route, SharedRoutingTable};

/// Boxed error type carried by proxied bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the dispatcher produces.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

type HttpClient = Client<HttpConnector, ProxyBody>;

const NOT_FOUND_BODY: &str = "Failed to look up service";

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Routes requests from both listeners to the target of their virtual host.
#[derive(Clone)]
pub struct Dispatcher {
    table: SharedRoutingTable,
    client: HttpClient,
}

impl Dispatcher {
    /// Create a dispatcher reading from `table`.
    pub fn new(table: SharedRoutingTable) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build_http();

        Self { table, client }
    }

    /// Handle one request that arrived on the plain (`secure == false`) or TLS listener.
    pub async fn dispatch<B>(&self, req: Request<B>, remote: SocketAddr, secure: bool) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let host = request_host(&req).unwrap_or_default().to_string();
        info!(
            method = %req.method(),
            path = %req.uri().path(),
            remote = %remote,
            host = %host,
            secure,
            "started request"
        );

        let Some(route) = self.table.resolve(&host, secure) else {
            info!(host = %host, secure, "no route for host");
            return text_response(StatusCode::NOT_FOUND, Bytes::from_static(NOT_FOUND_BODY.as_bytes()));
        };

        match route.as_ref() {
            Route::Forward(upstream) => self.forward(upstream, req, remote).await,
            Route::Static { status, body } => text_response(*status, body.clone()),
        }
    }

    async fn forward<B>(&self, upstream: &Upstream, req: Request<B>, remote: SocketAddr) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (mut parts, body) = req.into_parts();

        // HTTP/2 requests carry the host in the URI rather than a header.
        if !parts.headers.contains_key(HOST) {
            let authority = parts
                .uri
                .authority()
                .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok());
            if let Some(authority) = authority {
                parts.headers.insert(HOST, authority);
            }
        }

        parts.uri = match upstream.uri_for(parts.uri.path_and_query()) {
            Ok(uri) => uri,
            Err(e) => {
                error!(upstream = %upstream.authority(), error = %e, "failed to build backend uri");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, Bytes::from_static(b"Internal Error"));
            }
        };

        parts.version = Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);
        append_forwarded_for(&mut parts.headers, remote);

        let req = Request::from_parts(parts, body.map_err(Into::into).boxed_unsync());

        match self.client.request(req).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, body.map_err(Into::into).boxed_unsync())
            }
            Err(e) => {
                warn!(upstream = %upstream.authority(), error = %e, "backend request failed");
                text_response(StatusCode::BAD_GATEWAY, Bytes::from_static(b"Bad Gateway"))
            }
        }
    }
}

/// The hostname a request addressed, without any port.
///
/// The request target's authority wins over the `Host` header, so HTTP/2 and
/// absolute-form requests resolve the same way as ordinary ones.
pub fn request_host<B>(req: &Request<B>) -> Option<&str> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.as_str(),
        None => req.headers().get(HOST)?.to_str().ok()?,
    };
    Some(strip_port(authority))
}

fn strip_port(authority: &str) -> &str {
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    if authority.starts_with('[') {
        return match authority.find(']') {
            Some(end) => &authority[..=end],
            None => authority,
        };
    }
    authority.split(':').next().unwrap_or(authority)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers nominated by `Connection` are hop-by-hop too.
    let nominated: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok())
        .collect();
    for name in nominated {
        headers.remove(name);
    }

    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, remote: SocketAddr) {
    let mut chain: Vec<String> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .collect();
    chain.push(remote.ip().to_string());
    let value = chain.join(", ");
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
}

fn text_response(status: StatusCode, body: Bytes) -> Response<ProxyBody> {
    let mut response = Response::new(Full::new(body).map_err(|never| match never {}).boxed_unsync());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
