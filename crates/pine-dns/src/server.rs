use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_rustls::TlsAcceptor;
use tracing::Instrument as _;

use crate::connection::{Connection, TransportError};
use crate::{
    Resolver, ServerConfig, DEFAULT_EDNS_BUF_CAPACITY, MAINTENANCE_INTERVAL, STREAM_IDLE_TIMEOUT,
};

type HandlerResult = anyhow::Result<()>;

/// Flips the server's run flag, asking every worker to wind down.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

/// Owns the bound listener sockets, the resolver, and the worker tasks
/// multiplexing over them.
///
/// Bind failures are fatal at construction: a listener that cannot bind
/// cannot serve. Everything after that is per-query or per-connection.
pub struct DnsServer {
    udp_socket: Arc<UdpSocket>,
    tcp_listener: Arc<TcpListener>,
    tls_listener: Option<(Arc<TcpListener>, TlsAcceptor)>,
    resolver: Arc<Resolver>,
    workers: JoinSet<HandlerResult>,
    shutdown: Arc<watch::Sender<bool>>,
    config: ServerConfig,
}

impl DnsServer {
    pub async fn new(config: ServerConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !config.upstreams.is_empty(),
            "at least one upstream resolver is required"
        );

        let udp_socket = Arc::new(
            UdpSocket::bind(config.udp_bind)
                .await
                .with_context(|| format!("error while binding a UDP socket to {}", config.udp_bind))?,
        );
        let tcp_listener = Arc::new(
            TcpListener::bind(config.tcp_bind)
                .await
                .with_context(|| format!("error while binding a TCP listener to {}", config.tcp_bind))?,
        );
        let tls_listener = match config.tls.as_ref() {
            Some(tls) => {
                let listener = TcpListener::bind(tls.bind)
                    .await
                    .with_context(|| format!("error while binding a TLS listener to {}", tls.bind))?;
                Some((
                    Arc::new(listener),
                    TlsAcceptor::from(tls.server_config.clone()),
                ))
            }
            None => None,
        };

        let resolver = Arc::new(Resolver::new(&config));

        if let Some(path) = config.cache_persist_path.as_ref() {
            if path.exists() {
                match resolver
                    .cache()
                    .load(path, Instant::now(), config.negative_ttl_floor)
                {
                    Ok(loaded) => tracing::info!(loaded, "restored cache entries"),
                    Err(e) => tracing::warn!("failed to restore the cache: {:#}", e),
                }
            }
        }

        let (shutdown, _) = watch::channel(false);

        Ok(DnsServer {
            udp_socket,
            tcp_listener,
            tls_listener,
            resolver,
            workers: JoinSet::new(),
            shutdown: Arc::new(shutdown),
            config,
        })
    }

    pub fn resolver(&self) -> Arc<Resolver> {
        self.resolver.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    pub fn udp_addr(&self) -> anyhow::Result<SocketAddr> {
        self.udp_socket.local_addr().context("UDP socket is not bound")
    }

    pub fn tcp_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tcp_listener.local_addr().context("TCP listener is not bound")
    }

    pub fn tls_addr(&self) -> Option<SocketAddr> {
        self.tls_listener
            .as_ref()
            .and_then(|(listener, _)| listener.local_addr().ok())
    }

    /// Spawns `n` workers multiplexing over the shared listener sockets,
    /// plus the maintenance task on its fixed cadence.
    pub async fn add_workers(&mut self, n: usize) {
        for idx in 0..n {
            let udp_socket = self.udp_socket.clone();
            let tcp_listener = self.tcp_listener.clone();
            let tls_listener = self.tls_listener.clone();
            let resolver = self.resolver.clone();
            let shutdown = self.shutdown.subscribe();

            self.workers.spawn(
                handle_incoming_requests(udp_socket, tcp_listener, tls_listener, resolver, shutdown)
                    .instrument(tracing::trace_span!("", worker = idx)),
            );
        }

        self.workers.spawn(run_maintenance(
            self.resolver.clone(),
            self.shutdown.subscribe(),
        ));
    }

    /// Runs until every worker has exited (ordinarily after a shutdown
    /// request), then persists the cache if configured. Pending upstream
    /// queries are abandoned at this point: their requesters get no
    /// further response, which is documented best-effort behavior.
    pub async fn block_until_completion(&mut self) -> anyhow::Result<()> {
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result.context("worker task failed to execute")? {
                tracing::debug!("error in a worker: {:#}", e);
            }
        }

        if let Some(path) = self.config.cache_persist_path.as_ref() {
            match self.resolver.cache().persist(path, Instant::now()) {
                Ok(persisted) => tracing::info!(persisted, "persisted cache entries"),
                Err(e) => tracing::warn!("failed to persist the cache: {:#}", e),
            }
        }

        Ok(())
    }
}

/// Accept helper that stays pending forever when no TLS listener is
/// configured, keeping the select loop free of special cases.
async fn accept_tls(
    listener: Option<&(Arc<TcpListener>, TlsAcceptor)>,
) -> std::io::Result<(TcpStream, SocketAddr, TlsAcceptor)> {
    match listener {
        Some((listener, acceptor)) => {
            let (stream, peer) = listener.accept().await?;
            Ok((stream, peer, acceptor.clone()))
        }
        None => std::future::pending().await,
    }
}

async fn handle_incoming_requests(
    udp_socket: Arc<UdpSocket>,
    tcp_listener: Arc<TcpListener>,
    tls_listener: Option<(Arc<TcpListener>, TlsAcceptor)>,
    resolver: Arc<Resolver>,
    mut shutdown: watch::Receiver<bool>,
) -> HandlerResult {
    let mut recv = vec![0u8; DEFAULT_EDNS_BUF_CAPACITY];
    let mut handlers: JoinSet<HandlerResult> = JoinSet::new();
    loop {
        tokio::select! {
            Ok((len, from)) = udp_socket.recv_from(&mut recv) => {
                tracing::trace!(client = %from, "new UDP query");

                let resolver = resolver.clone();
                let mut connection = Connection::Udp(udp_socket.clone(), Some(from));
                let raw = recv[..len].to_vec();
                handlers.spawn(
                    async move { resolver.resolve_query(&mut connection, raw).await }
                        .in_current_span(),
                );
            }
            Ok((stream, peer)) = tcp_listener.accept() => {
                tracing::trace!(client = %peer, "new TCP connection");

                let resolver = resolver.clone();
                handlers.spawn(
                    serve_stream(Connection::Tcp(stream), resolver, peer).in_current_span(),
                );
            }
            Ok((stream, peer, acceptor)) = accept_tls(tls_listener.as_ref()) => {
                tracing::trace!(client = %peer, "new TLS connection");

                let resolver = resolver.clone();
                handlers.spawn(
                    async move {
                        // The handshake produces the authenticated encrypted
                        // stream the framer operates on
                        match acceptor.accept(stream).await {
                            Ok(stream) => {
                                serve_stream(Connection::Tls(Box::new(stream)), resolver, peer).await
                            }
                            Err(e) => {
                                tracing::debug!(client = %peer, "TLS handshake failed: {}", e);
                                Ok(())
                            }
                        }
                    }
                    .in_current_span(),
                );
            }
            Some(result) = handlers.join_next() => {
                result
                    .context("connection handling task failed to execute")?
                    .context("unrecoverable error while handling a query")?;
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }

    handlers.abort_all();
    Ok(())
}

/// Serves one stream connection: length-prefixed queries are answered in
/// order until the peer closes, misbehaves, or goes idle.
async fn serve_stream(
    mut connection: Connection<Arc<UdpSocket>>,
    resolver: Arc<Resolver>,
    peer: SocketAddr,
) -> HandlerResult {
    let mut recv = Vec::new();
    loop {
        let len = match timeout(STREAM_IDLE_TIMEOUT, connection.read(&mut recv)).await {
            Ok(Ok(len)) => len,
            Ok(Err(TransportError::ConnectionClosed)) => {
                tracing::trace!(client = %peer, "stream connection closed by peer");
                break;
            }
            Ok(Err(e)) => {
                // Tearing down this connection doesn't affect any other
                tracing::debug!(client = %peer, "closing a stream connection: {}", e);
                break;
            }
            Err(_) => {
                tracing::trace!(client = %peer, "stream connection idle timeout");
                break;
            }
        };

        resolver
            .clone()
            .resolve_query(&mut connection, recv[..len].to_vec())
            .await?;
    }

    Ok(())
}

/// The periodic maintenance cycle: cache expiry sweep, pending-query
/// timeout sweep, upstream liveness report.
async fn run_maintenance(
    resolver: Arc<Resolver>,
    mut shutdown: watch::Receiver<bool>,
) -> HandlerResult {
    let mut tick = interval(MAINTENANCE_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let (evicted, timed_out) = resolver.run_maintenance(Instant::now());
                if evicted > 0 || timed_out > 0 {
                    tracing::debug!(evicted, timed_out, "maintenance cycle");
                }
            }
            _ = shutdown.changed() => {
                tracing::debug!("maintenance task shutting down");
                break;
            }
        }
    }
    Ok(())
}
