//! Runtime configuration, read from the command line with environment fallbacks.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::signaling::DEFAULT_SIGNALING_PORT;

const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
const DEFAULT_PONG_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;
const DEFAULT_LOG_FILTER: &str = "rendezvous=info";

#[derive(Parser, Debug, Clone)]
#[command(name = "rendezvous")]
#[command(about = "WebRTC signaling relay - brokers offers, answers and ICE candidates per room")]
pub struct Config {
    /// HTTP/WebSocket listen address
    #[arg(long, env = "RENDEZVOUS_BIND", default_value_t = default_bind())]
    pub bind: SocketAddr,

    /// Seconds between keepalive pings
    #[arg(long, env = "RENDEZVOUS_PING_INTERVAL_SECS", default_value_t = DEFAULT_PING_INTERVAL_SECS)]
    pub ping_interval_secs: u64,

    /// Seconds to wait for a pong before dropping the connection
    #[arg(long, env = "RENDEZVOUS_PONG_TIMEOUT_SECS", default_value_t = DEFAULT_PONG_TIMEOUT_SECS)]
    pub pong_timeout_secs: u64,

    /// Largest inbound WebSocket message accepted
    #[arg(long, env = "RENDEZVOUS_MAX_MESSAGE_BYTES", default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    pub max_message_bytes: usize,

    /// Log filter (tracing EnvFilter syntax)
    #[arg(long, env = "RUST_LOG", default_value = DEFAULT_LOG_FILTER)]
    pub log_level: String,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_SIGNALING_PORT))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            ping_interval_secs: DEFAULT_PING_INTERVAL_SECS,
            pong_timeout_secs: DEFAULT_PONG_TIMEOUT_SECS,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            log_level: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl Config {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs.max(1))
    }
}
