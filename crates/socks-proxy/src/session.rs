//! Per-connection session state

use crate::error::{ProxyError, Result};
use crate::socks5::Socks5Request;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Whether a session is still negotiating or already relaying bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Tunneling,
}

/// Destination side of a session, present once the CONNECT reply went out
pub struct Outbound {
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
}

impl Outbound {
    pub fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }
}

/// One client-to-destination tunnel
///
/// Owned by the single task serving the connection. The inbound halves are
/// generic so the handshake can run over any byte stream.
pub struct Session<R = OwnedReadHalf, W = OwnedWriteHalf> {
    peer: SocketAddr,
    inbound_reader: BufReader<R>,
    inbound_writer: W,
    request: Option<Socks5Request>,
    outbound: Option<Outbound>,
}

impl Session {
    /// Wrap an accepted client connection
    pub fn accept(stream: TcpStream, peer: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, peer)
    }
}

impl<R: AsyncRead, W> Session<R, W> {
    pub fn new(reader: R, writer: W, peer: SocketAddr) -> Self {
        Self {
            peer,
            inbound_reader: BufReader::new(reader),
            inbound_writer: writer,
            request: None,
            outbound: None,
        }
    }
}

impl<R, W> Session<R, W> {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        if self.outbound.is_some() {
            SessionState::Tunneling
        } else {
            SessionState::Handshaking
        }
    }

    pub fn request(&self) -> Option<&Socks5Request> {
        self.request.as_ref()
    }

    pub(crate) fn inbound(&mut self) -> (&mut BufReader<R>, &mut W) {
        (&mut self.inbound_reader, &mut self.inbound_writer)
    }

    pub(crate) fn inbound_writer(&mut self) -> &mut W {
        &mut self.inbound_writer
    }

    pub(crate) fn set_request(&mut self, request: Socks5Request) {
        self.request = Some(request);
    }

    pub(crate) fn attach_outbound(&mut self, outbound: Outbound) {
        self.outbound = Some(outbound);
    }

    /// Split a tunneling session into its four stream halves
    pub fn into_streams(self) -> Result<(BufReader<R>, W, Outbound)> {
        match self.outbound {
            Some(outbound) => Ok((self.inbound_reader, self.inbound_writer, outbound)),
            None => Err(ProxyError::internal(format!(
                "session from {} has no destination stream",
                self.peer
            ))),
        }
    }
}

/// Idempotent close handle shared by both directions of a tunnel
///
/// Closing aborts whatever read or write the copy loops are blocked on.
#[derive(Clone, Default)]
pub struct StreamCloser {
    token: CancellationToken,
}

impl StreamCloser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        self.token.cancelled().await
    }

    /// Run `op` unless the streams are closed first
    pub async fn guard<T, F>(&self, op: F) -> Result<T>
    where
        F: std::future::Future<Output = std::io::Result<T>>,
    {
        if self.is_closed() {
            return Err(ProxyError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ProxyError::Closed),
            res = op => res.map_err(ProxyError::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks5::AddressType;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_new_session_is_handshaking() {
        let (client, _server) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(client);
        let mut session = Session::new(r, w, peer());

        assert_eq!(session.state(), SessionState::Handshaking);
        assert!(session.request().is_none());

        session.set_request(Socks5Request {
            address_type: AddressType::IPv4,
            address: "10.0.0.1:80".to_string(),
        });
        assert_eq!(session.state(), SessionState::Handshaking);
        assert!(session.into_streams().is_err());
    }

    #[tokio::test]
    async fn test_accept_wraps_tcp_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });

        let (stream, peer) = listener.accept().await.unwrap();
        let session = Session::accept(stream, peer);
        assert_eq!(session.peer(), peer);
        assert_eq!(session.state(), SessionState::Handshaking);
        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn test_closer_is_idempotent() {
        let closer = StreamCloser::new();
        assert!(!closer.is_closed());

        closer.close();
        closer.clone().close();
        assert!(closer.is_closed());
        closer.closed().await;
    }

    #[tokio::test]
    async fn test_guard_aborts_pending_operation() {
        let closer = StreamCloser::new();
        let waiter = closer.clone();
        let pending = tokio::spawn(async move {
            waiter
                .guard(std::future::pending::<std::io::Result<()>>())
                .await
        });

        closer.close();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(ProxyError::Closed)));
    }

    #[tokio::test]
    async fn test_guard_passes_results_through() {
        let closer = StreamCloser::new();
        let value = closer.guard(async { Ok::<_, std::io::Error>(7) }).await.unwrap();
        assert_eq!(value, 7);

        closer.close();
        let result = closer.guard(async { Ok::<_, std::io::Error>(7) }).await;
        assert!(matches!(result, Err(ProxyError::Closed)));
    }
}
