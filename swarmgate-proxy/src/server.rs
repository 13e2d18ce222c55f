//! Server module for accepting connections and handing requests to the dispatcher.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;

/// Accept connections on `listener` forever.
///
/// With a `tls_acceptor` every connection is TLS-terminated first and its
/// requests are dispatched as secure; otherwise they are dispatched as plain.
pub async fn serve(listener: TcpListener, dispatcher: Dispatcher, tls_acceptor: Option<TlsAcceptor>) {
    match listener.local_addr() {
        Ok(addr) if tls_acceptor.is_some() => info!("listening for HTTPS on https://{}", addr),
        Ok(addr) => info!("listening for HTTP on http://{}", addr),
        Err(e) => warn!(error = %e, "listener has no local address"),
    }

    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // Usually descriptor exhaustion; back off instead of spinning.
                warn!(error = %e, "failed to accept connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let dispatcher = dispatcher.clone();
        if let Some(acceptor) = &tls_acceptor {
            let acceptor = acceptor.clone();
            tokio::task::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => serve_connection(tls_stream, dispatcher, remote, true).await,
                    Err(e) => debug!(remote = %remote, error = %e, "TLS handshake failed"),
                }
            });
        } else {
            tokio::task::spawn(serve_connection(stream, dispatcher, remote, false));
        }
    }
}

async fn serve_connection<I>(io: I, dispatcher: Dispatcher, remote: SocketAddr, secure: bool)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let dispatcher = dispatcher.clone();
        async move { Ok::<_, Infallible>(dispatcher.dispatch(req, remote, secure).await) }
    });

    if let Err(err) = auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(io), service)
        .await
    {
        debug!(remote = %remote, error = %err, "error serving connection");
    }
}
