//! SwarmGate ingress router.
//!
//! Serves plain HTTP and TLS-terminated traffic for every virtual host
//! published in Redis, keeping routes and certificates in sync while running.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use swarmgate_core::{RoutingTable, SyncLoop};
use swarmgate_proxy::redis::RedisCache;
use swarmgate_proxy::{logging, server, tls, Config, Dispatcher};

/// The primary entrypoint for the SwarmGate ingress router.
///
/// Starts the sync loop against Redis, then serves both listeners until the
/// process is interrupted.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    logging::init(config.log_json);

    info!("Starting SwarmGate v{}", env!("CARGO_PKG_VERSION"));

    let table = Arc::new(RoutingTable::new());

    let cache = RedisCache::new(config.redis.clone());
    info!(redis = %cache.addr(), channel = %config.channel, "following service updates");
    SyncLoop::new(cache, Arc::clone(&table), config.sync_config()).spawn();

    let dispatcher = Dispatcher::new(Arc::clone(&table));
    let acceptor = tls::acceptor(Arc::clone(&table))?;

    let http_listener = TcpListener::bind(config.http_addr()).await?;
    let https_listener = TcpListener::bind(config.https_addr()).await?;

    tokio::select! {
        _ = server::serve(http_listener, dispatcher.clone(), None) => {}
        _ = server::serve(https_listener, dispatcher, Some(acceptor)) => {}
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down.");
        }
    }

    Ok(())
}
