//! Bidirectional relay between a client and its destination

use crate::{
    copy::copy_with_cancel,
    error::{ProxyError, Result},
    session::{Outbound, Session, StreamCloser},
};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => f.write_str("inbound -> outbound"),
            Direction::Download => f.write_str("outbound -> inbound"),
        }
    }
}

/// Bytes relayed in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub uploaded: u64,
    pub downloaded: u64,
}

impl TunnelStats {
    fn record(&mut self, direction: Direction, bytes: u64) {
        match direction {
            Direction::Upload => self.uploaded = bytes,
            Direction::Download => self.downloaded = bytes,
        }
    }
}

/// Relay bytes both ways until one side finishes or `cancel` fires
///
/// Both directions are always awaited before returning, and every stream
/// half is shut down by then.
pub async fn tunnel<R, W>(session: Session<R, W>, cancel: &CancellationToken) -> Result<TunnelStats>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let peer = session.peer();
    let (inbound_reader, inbound_writer, outbound) = session.into_streams()?;
    let Outbound {
        reader: outbound_reader,
        writer: outbound_writer,
    } = outbound;

    let closer = StreamCloser::new();
    let (done_tx, mut done_rx) = mpsc::channel(2);

    spawn_copy(
        Direction::Upload,
        inbound_reader,
        outbound_writer,
        cancel.clone(),
        closer.clone(),
        done_tx.clone(),
    );
    spawn_copy(
        Direction::Download,
        outbound_reader,
        inbound_writer,
        cancel.clone(),
        closer.clone(),
        done_tx,
    );

    let watcher = {
        let cancel = cancel.clone();
        let closer = closer.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Shutdown requested, closing tunnel for {}", peer);
                    closer.close();
                }
                _ = closer.closed() => {}
            }
        })
    };

    let mut stats = TunnelStats::default();

    // One direction finishing means the other can only idle; unblock it.
    if let Some((direction, bytes)) = done_rx.recv().await {
        stats.record(direction, bytes);
    }
    closer.close();

    if let Some((direction, bytes)) = done_rx.recv().await {
        stats.record(direction, bytes);
    }
    closer.close();

    if let Err(e) = watcher.await {
        warn!("Tunnel watcher for {} failed: {}", peer, e);
    }

    debug!(
        "Transport has completed for {}: {} bytes up, {} bytes down",
        peer, stats.uploaded, stats.downloaded
    );

    Ok(stats)
}

fn spawn_copy<R, W>(
    direction: Direction,
    mut reader: R,
    mut writer: W,
    cancel: CancellationToken,
    closer: StreamCloser,
    done: mpsc::Sender<(Direction, u64)>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let (bytes, result) = copy_with_cancel(&mut reader, &mut writer, &cancel, &closer).await;
        if let Err(e) = result {
            log_copy_error(direction, &e);
        }

        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown after copy {} failed: {}", direction, e);
        }

        let _ = done.send((direction, bytes)).await;
    });
}

fn log_copy_error(direction: Direction, error: &ProxyError) {
    if error.is_teardown() {
        debug!("copy {} failed: {}", direction, error);
    } else {
        warn!("copy {} failed: {}", direction, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::net::{TcpListener, TcpStream};

    type DuplexSession = Session<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    /// Returns (client end, tunneling session, destination end)
    async fn tunneling_session() -> (DuplexStream, DuplexSession, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (destination, _) = listener.accept().await.unwrap();

        let (client, server) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(server);
        let mut session = Session::new(r, w, "127.0.0.1:50000".parse().unwrap());
        session.attach_outbound(Outbound::new(upstream));

        (client, session, destination)
    }

    #[tokio::test]
    async fn test_relays_both_directions() {
        let (mut client, session, mut destination) = tunneling_session().await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(async move { tunnel(session, &cancel).await });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        destination.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        destination.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(destination);

        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("tunnel did not finish")
            .unwrap()
            .unwrap();
        assert_eq!(stats, TunnelStats { uploaded: 4, downloaded: 5 });

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_closes_idle_tunnel() {
        let (mut client, session, mut destination) = tunneling_session().await;
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { tunnel(session, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("tunnel ignored cancellation")
            .unwrap()
            .unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        let n = destination.read(&mut [0u8; 16]).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_rejects_session_without_destination() {
        let (_client, server) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(server);
        let session = Session::new(r, w, "127.0.0.1:50000".parse().unwrap());

        let result = tunnel(session, &CancellationToken::new()).await;
        assert!(matches!(result, Err(ProxyError::Internal(_))));
    }
}
