use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(version, name = "pine-dns")]
pub struct Args {
    /// Address to serve on
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1")]
    pub host: IpAddr,
    /// Port for the UDP and TCP listeners
    #[arg(short('p'), long, value_name = "PORT", default_value_t = 53)]
    pub port: u16,
    /// Serve DNS over TLS on this port as well
    #[arg(long, value_name = "PORT")]
    pub tls_port: Option<u16>,
    /// PEM certificate chain for the TLS listener
    #[arg(long, value_name = "PATH", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,
    /// PEM private key for the TLS listener
    #[arg(long, value_name = "PATH", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,
    /// Upstream resolvers, tried round-robin
    #[arg(long = "upstream", value_name = "ADDR:PORT", default_value = "1.1.1.1:53")]
    pub upstreams: Vec<SocketAddr>,
    /// Static overrides: 'name=address' or '*.suffix=address'
    #[arg(long = "override", value_name = "RULE")]
    pub overrides: Vec<String>,
    /// TTL returned with override answers
    #[arg(long, value_name = "SECONDS", default_value_t = 180)]
    pub override_ttl: u32,
    #[arg(long, value_name = "MILLIS", default_value_t = 3000)]
    pub upstream_timeout_ms: u64,
    #[arg(long, value_name = "ENTRIES", default_value_t = 1000)]
    pub cache_capacity: usize,
    /// Persist the cache to this file across restarts
    #[arg(long, value_name = "PATH")]
    pub cache_file: Option<PathBuf>,
    /// Minimum TTL for cached negative answers
    #[arg(long, value_name = "SECONDS", default_value_t = 30)]
    pub negative_ttl: u32,
    /// Cap on concurrently pending upstream queries
    #[arg(long, value_name = "QUERIES", default_value_t = 512)]
    pub max_in_flight: usize,
    #[arg(long, value_name = "CONNECTIONS", default_value_t = 5, value_parser = clap::value_parser!(u8).range(1..=16))]
    pub max_parallel_connections: u8,
    /// Default log level when PINE_DNS_LOG is unset
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}
