mod logging;
pub use logging::setup_logging;
mod cache;
pub use cache::{Cache, CacheFlags, CacheKey, CachedAnswer};
mod cli;
pub use cli::Args;
mod config;
pub use config::{load_tls_config, ServerConfig, TlsConfig};
mod connection;
pub use connection::{AsyncUdpSocket, Connection, TransportError};
mod overrides;
pub use overrides::{OverrideRule, OverrideTable};
mod resolver;
pub use resolver::{Resolver, RoundRobin, UpstreamError, UpstreamPolicy};
mod server;
pub use server::{DnsServer, ShutdownHandle};

use std::time::Duration;

/// Recommended EDNS buf size
pub const DEFAULT_EDNS_BUF_CAPACITY: usize = 1232;
/// RFC1035
pub const MAX_STANDARD_DNS_MSG_SIZE: usize = 512;
/// Hard cap on a single length-prefixed stream frame. Anything larger is
/// treated as a hostile peer and the connection is closed.
pub const MAX_STREAM_FRAME: usize = 16_384;
/// Cadence of the cache/pending sweep
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(100);
/// Stream connections idle longer than this are closed
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
