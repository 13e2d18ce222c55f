//! Process configuration.

use std::time::Duration;

use clap::Parser;
use swarmgate_core::SyncConfig;

/// Command line and environment configuration for the `swarmgate` binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "swarmgate", version, about = "Hostname and SNI routing ingress for swarm services")]
pub struct Config {
    /// Address both listeners bind to.
    #[arg(long, env = "SWARMGATE_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Redis `host:port` holding the service list.
    #[arg(long, env = "SWARMGATE_REDIS", default_value = "127.0.0.1:6379")]
    pub redis: String,

    /// Port of the plain HTTP listener.
    #[arg(long, env = "SWARMGATE_HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// Port of the TLS listener.
    #[arg(long, env = "SWARMGATE_HTTPS_PORT", default_value_t = 8443)]
    pub https_port: u16,

    /// Redis key holding the JSON service list.
    #[arg(long, env = "SWARMGATE_SERVICES_KEY", default_value = "services")]
    pub services_key: String,

    /// Redis channel announcing service list changes.
    #[arg(long, env = "SWARMGATE_CHANNEL", default_value = "inress-router")]
    pub channel: String,

    /// Seconds to wait before resubscribing after losing the channel.
    #[arg(
        long,
        env = "SWARMGATE_RETRY_SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub retry_secs: u64,

    /// Emit logs as JSON lines.
    #[arg(long, env = "SWARMGATE_LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    /// Settings for the sync loop.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            services_key: self.services_key.clone(),
            channel: self.channel.clone(),
            retry_interval: Duration::from_secs(self.retry_secs),
        }
    }

    /// Bind address of the plain listener.
    pub fn http_addr(&self) -> (&str, u16) {
        (&self.bind, self.http_port)
    }

    /// Bind address of the TLS listener.
    pub fn https_addr(&self) -> (&str, u16) {
        (&self.bind, self.https_port)
    }
}
