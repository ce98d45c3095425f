//! SOCKS5 handshake: method negotiation, CONNECT request, dial and reply

use super::{protocol, AuthMethod, Reply};
use crate::{
    buffer_pool::BufferPool,
    error::{ProtocolError, ProxyError, Result},
    session::{Outbound, Session},
};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Run the whole handshake over `session`
///
/// On success the final reply has been written and the destination stream
/// is attached, so the session is ready for the tunnel. On failure the
/// caller owns closing the connection.
pub async fn handshake<R, W>(
    session: &mut Session<R, W>,
    buffers: &BufferPool,
    connect_timeout: Option<Duration>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    negotiate_method(session, buffers).await?;

    let request = {
        let (reader, _) = session.inbound();
        protocol::read_request(reader, buffers).await?
    };
    let address = request.address.clone();
    session.set_request(request);

    connect(session, &address, connect_timeout).await
}

/// Only "no authentication" is ever selected
///
/// A list without it is answered with `{0x05, 0xFF}` before the connection
/// closes, as RFC 1928 describes. Some servers close without any reply;
/// clients see the same outcome either way.
async fn negotiate_method<R, W>(session: &mut Session<R, W>, buffers: &BufferPool) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let peer = session.peer();
    let (reader, writer) = session.inbound();
    let methods = protocol::read_auth_methods(reader, buffers).await?;

    if !methods.contains(&AuthMethod::NoAuth) {
        if let Err(e) = protocol::send_method_selection(writer, AuthMethod::NoAcceptable).await {
            debug!("Failed to reject methods from {}: {}", peer, e);
        }
        return Err(ProtocolError::NoAcceptableMethod.into());
    }

    protocol::send_method_selection(writer, AuthMethod::NoAuth).await
}

async fn connect<R, W>(
    session: &mut Session<R, W>,
    address: &str,
    connect_timeout: Option<Duration>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let upstream = match dial(address, connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to connect to {}: {}", address, e);
            protocol::send_reply(session.inbound_writer(), Reply::HostUnreachable).await?;
            return Err(e);
        }
    };

    // On failure `upstream` is dropped here, closing the destination.
    protocol::send_reply(session.inbound_writer(), Reply::Success).await?;

    info!("SOCKS5 CONNECT from {} to {}", session.peer(), address);
    session.attach_outbound(Outbound::new(upstream));

    Ok(())
}

/// Open the destination connection; domain names resolve here
async fn dial(address: &str, connect_timeout: Option<Duration>) -> Result<TcpStream> {
    let connecting = TcpStream::connect(address);
    let result = match connect_timeout {
        Some(limit) => tokio::time::timeout(limit, connecting)
            .await
            .unwrap_or_else(|_| Err(io::Error::from(io::ErrorKind::TimedOut))),
        None => connecting.await,
    };
    let stream = result.map_err(|e| ProxyError::dial(address, e))?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", address, e);
    }

    Ok(stream)
}
