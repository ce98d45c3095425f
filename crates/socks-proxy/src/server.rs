//! Acceptor: listening socket, bounded session pool and graceful drain

use crate::{
    buffer_pool::BufferPool,
    config::ProxyConfig,
    error::{ProxyError, Result},
    metrics::{ConnectionObserver, NoopObserver},
    pool::SessionPool,
    session::Session,
    socks5, transport,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of the acceptor; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    Starting,
    Listening,
    Draining,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Starting => "starting",
            ServerState::Listening => "listening",
            ServerState::Draining => "draining",
            ServerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// SOCKS5 server bound to its listening socket
pub struct ProxyServer {
    listener: TcpListener,
    pool: SessionPool,
    buffers: BufferPool,
    observer: Arc<dyn ConnectionObserver>,
    connect_timeout: Option<Duration>,
    state: watch::Sender<ServerState>,
}

impl ProxyServer {
    /// Bind the listening socket; failing to bind is fatal for the server
    pub async fn bind(config: ProxyConfig, observer: Arc<dyn ConnectionObserver>) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(ServerState::Starting);

        let addr = config.bind_address();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind {
                address: addr.to_string(),
                source,
            })?;

        info!(
            "SOCKS5 proxy server listening on {} (capacity {})",
            listener.local_addr()?,
            config.pool_capacity
        );

        Ok(Self {
            listener,
            pool: SessionPool::new(config.pool_capacity),
            buffers: BufferPool::default(),
            observer,
            connect_timeout: config.timeouts.connect(),
            state,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    /// Follow the server's lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    fn enter(&self, next: ServerState) {
        let previous = self.state.send_replace(next);
        debug!("SOCKS5 server {} -> {}", previous, next);
    }

    /// Accept connections until `shutdown` fires, then wait for every
    /// session to finish
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        self.enter(ServerState::Listening);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.dispatch(stream, peer, &shutdown),
                Err(e) => warn!("{}", ProxyError::Accept(e)),
            }
        }

        self.enter(ServerState::Draining);
        let ProxyServer {
            listener,
            pool,
            state,
            ..
        } = self;
        drop(listener);

        warn!(
            "Shutting down server, waiting for {} sessions",
            pool.in_flight()
        );
        pool.drain().await;

        state.send_replace(ServerState::Stopped);
        info!("Server gracefully shut down");

        Ok(())
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr, shutdown: &CancellationToken) {
        let pool = self.pool.clone();
        let buffers = self.buffers.clone();
        let observer = self.observer.clone();
        let connect_timeout = self.connect_timeout;
        let shutdown = shutdown.clone();

        self.pool.spawn(async move {
            let _slot = tokio::select! {
                slot = pool.acquire() => match slot {
                    Ok(slot) => slot,
                    Err(e) => {
                        warn!("No session slot for {}: {}", peer, e);
                        return;
                    }
                },
                _ = shutdown.cancelled() => {
                    debug!("Dropping queued connection from {} during shutdown", peer);
                    return;
                }
            };

            let _observed = Observed::new(observer, peer);
            handle_connection(stream, peer, &buffers, connect_timeout, &shutdown).await;
        });
    }
}

/// Reports the session to the observer for as long as it is alive
struct Observed {
    observer: Arc<dyn ConnectionObserver>,
    peer: SocketAddr,
}

impl Observed {
    fn new(observer: Arc<dyn ConnectionObserver>, peer: SocketAddr) -> Self {
        observer.opened(peer.ip());
        Self { observer, peer }
    }
}

impl Drop for Observed {
    fn drop(&mut self) {
        self.observer.closed(self.peer.ip());
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    buffers: &BufferPool,
    connect_timeout: Option<Duration>,
    shutdown: &CancellationToken,
) {
    debug!("New SOCKS5 connection from {}", peer);
    let mut session = Session::accept(stream, peer);

    let negotiated = tokio::select! {
        res = socks5::handshake(&mut session, buffers, connect_timeout) => res,
        _ = shutdown.cancelled() => Err(ProxyError::Cancelled),
    };
    if let Err(e) = negotiated {
        if e.is_teardown() {
            debug!("Handshake with {} aborted: {}", peer, e);
        } else {
            warn!("fail in handshake with {}: {}", peer, e);
        }
        return;
    }

    if let Err(e) = transport::tunnel(session, shutdown).await {
        warn!("Tunnel for {} failed: {}", peer, e);
    }
}

/// Serve SOCKS5 on every interface at `listen_port` until `shutdown` fires
pub async fn run(listen_port: u16, shutdown: CancellationToken) -> Result<()> {
    let server = ProxyServer::bind(ProxyConfig::with_port(listen_port), Arc::new(NoopObserver)).await?;
    server.serve(shutdown).await
}
