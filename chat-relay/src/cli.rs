use std::{net::SocketAddr, num::NonZeroU32, time::Duration};

use clap::Parser;

use crate::{rate_limit::RateLimitPolicy, server::ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address for newline-delimited TCP clients.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub tcp_listen: SocketAddr,

    /// Socket address for WebSocket clients. Any path accepts an upgrade.
    #[arg(long, default_value = "0.0.0.0:8081")]
    pub ws_listen: SocketAddr,

    /// Milliseconds between token refills for each client. Use 0 to disable rate limiting.
    #[arg(long, default_value_t = 500)]
    pub rate_limit_ms: u64,

    /// Number of messages a client may send back to back.
    #[arg(long, default_value = "1")]
    pub burst: NonZeroU32,

    /// Minimum milliseconds between two rate-limit notices to the same client.
    #[arg(long, default_value_t = 500)]
    pub notice_interval_ms: u64,

    /// Capacity of the internal event channels.
    #[arg(long, default_value_t = 100)]
    pub channel_capacity: usize,

    /// Seconds a single write may take before the client is considered dead.
    #[arg(long, default_value_t = 10)]
    pub write_timeout_secs: u64,

    /// Text sent to every client when the server is interrupted.
    #[arg(long, default_value = "server shutting down")]
    pub shutdown_message: String,
}

impl Cli {
    pub fn server_config(&self) -> ServerConfig {
        let mut shutdown_message = self.shutdown_message.clone();
        if !shutdown_message.ends_with('\n') {
            shutdown_message.push('\n');
        }

        ServerConfig {
            tcp_listen: self.tcp_listen,
            ws_listen: self.ws_listen,
            rate_limit: RateLimitPolicy {
                refill_period: Duration::from_millis(self.rate_limit_ms),
                burst: self.burst,
                notice_interval: Duration::from_millis(self.notice_interval_ms),
            },
            channel_capacity: self.channel_capacity.max(1),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            shutdown_message,
        }
    }
}
