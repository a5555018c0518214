use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use rustls::pki_types::CertificateDer;

use crate::overrides::OverrideRule;
use crate::Args;

/// Encrypted-stream listener configuration. The engine consumes a ready
/// [`rustls::ServerConfig`]; certificate lifecycle stays outside.
#[derive(Clone)]
pub struct TlsConfig {
    pub bind: SocketAddr,
    pub server_config: Arc<rustls::ServerConfig>,
}

/// Already-validated structured configuration the engine is built from.
#[derive(Clone)]
pub struct ServerConfig {
    pub udp_bind: SocketAddr,
    pub tcp_bind: SocketAddr,
    pub tls: Option<TlsConfig>,
    pub upstreams: Vec<SocketAddr>,
    pub overrides: Vec<OverrideRule>,
    /// TTL attached to answers synthesized from override rules
    pub override_ttl: u32,
    pub upstream_timeout: Duration,
    /// Cap on concurrently pending upstream queries
    pub max_in_flight: usize,
    /// Minimum lifetime of cached negative answers
    pub negative_ttl_floor: u32,
    pub cache_capacity: usize,
    pub cache_persist_path: Option<PathBuf>,
    pub workers: usize,
}

impl ServerConfig {
    pub fn new(bind: SocketAddr, upstreams: Vec<SocketAddr>) -> Self {
        ServerConfig {
            udp_bind: bind,
            tcp_bind: bind,
            tls: None,
            upstreams,
            overrides: Vec::new(),
            override_ttl: 180,
            upstream_timeout: Duration::from_secs(3),
            max_in_flight: 512,
            negative_ttl_floor: 30,
            cache_capacity: 1000,
            cache_persist_path: None,
            workers: 5,
        }
    }
}

impl TryFrom<Args> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: Args) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !args.upstreams.is_empty(),
            "at least one upstream resolver is required"
        );

        let bind = SocketAddr::new(args.host, args.port);
        let mut config = ServerConfig::new(bind, args.upstreams);

        config.overrides = args
            .overrides
            .iter()
            .map(|rule| OverrideRule::parse(rule))
            .collect::<anyhow::Result<_>>()
            .context("invalid override rule")?;
        config.override_ttl = args.override_ttl;
        config.upstream_timeout = Duration::from_millis(args.upstream_timeout_ms);
        config.max_in_flight = args.max_in_flight;
        config.negative_ttl_floor = args.negative_ttl;
        config.cache_capacity = args.cache_capacity;
        config.cache_persist_path = args.cache_file;
        config.workers = args.max_parallel_connections as usize;

        if let Some(port) = args.tls_port {
            let (cert, key) = args
                .tls_cert
                .as_deref()
                .zip(args.tls_key.as_deref())
                .context("--tls-port requires --tls-cert and --tls-key")?;
            config.tls = Some(TlsConfig {
                bind: SocketAddr::new(args.host, port),
                server_config: load_tls_config(cert, key)?,
            });
        }

        Ok(config)
    }
}

/// Loads a TLS server configuration from PEM-encoded certificate chain and
/// private key files.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cert_file = File::open(cert_path)
        .with_context(|| format!("error while opening the certificate file '{}'", cert_path.display()))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .context("error while parsing the certificate chain")?;
    anyhow::ensure!(!certs.is_empty(), "no certificates found in '{}'", cert_path.display());

    let key_file = File::open(key_path)
        .with_context(|| format!("error while opening the key file '{}'", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .context("error while parsing the private key")?
        .with_context(|| format!("no private key found in '{}'", key_path.display()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("error while building the TLS config")?;

    Ok(Arc::new(config))
}
