//! SOCKS5 wire framing

use super::{AddressType, AuthMethod, Command, Reply, Socks5Request, SOCKS5_VERSION};
use crate::buffer_pool::BufferPool;
use crate::error::{ProtocolError, Result};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Fill `buf` completely; running out of input is a truncated frame
async fn read_field<R>(reader: &mut R, buf: &mut [u8], field: &'static str) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(ProtocolError::Truncated(field).into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Read the method negotiation request and return the methods we recognise
///
/// ```text
/// +-----+----------+----------+
/// | VER | NMETHODS | METHODS  |
/// +-----+----------+----------+
/// |  1  |    1     | 1 to 255 |
/// +-----+----------+----------+
/// ```
pub async fn read_auth_methods<R>(reader: &mut R, pool: &BufferPool) -> Result<Vec<AuthMethod>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = pool.acquire();

    read_field(reader, &mut buf[..2], "method negotiation header").await?;
    let (version, nmethods) = (buf[0], buf[1] as usize);
    if version != SOCKS5_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version).into());
    }

    read_field(reader, &mut buf[..nmethods], "method list").await?;
    let methods: Vec<AuthMethod> = buf[..nmethods]
        .iter()
        .filter_map(|&b| AuthMethod::from_byte(b))
        .collect();

    debug!("Client supports auth methods: {:?}", methods);

    Ok(methods)
}

/// Read the CONNECT request
///
/// ```text
/// +-----+-----+-------+------+----------+----------+
/// | VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +-----+-----+-------+------+----------+----------+
/// |  1  |  1  | X'00' |  1   | Variable |    2     |
/// +-----+-----+-------+------+----------+----------+
/// ```
pub async fn read_request<R>(reader: &mut R, pool: &BufferPool) -> Result<Socks5Request>
where
    R: AsyncRead + Unpin,
{
    let mut buf = pool.acquire();

    read_field(reader, &mut buf[..4], "request header").await?;
    let (version, command, atyp) = (buf[0], buf[1], buf[3]);

    if version != SOCKS5_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version).into());
    }
    if Command::from_byte(command) != Some(Command::Connect) {
        return Err(ProtocolError::UnsupportedCommand(command).into());
    }

    let address_type =
        AddressType::from_byte(atyp).ok_or(ProtocolError::UnsupportedAddressType(atyp))?;

    let host = match address_type {
        AddressType::IPv4 => {
            read_field(reader, &mut buf[..4], "IPv4 address").await?;
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[..4]);
            Host::V4(Ipv4Addr::from(octets))
        }
        AddressType::DomainName => {
            read_field(reader, &mut buf[..1], "domain length").await?;
            let len = buf[0] as usize;
            read_field(reader, &mut buf[..len], "domain name").await?;
            let domain = std::str::from_utf8(&buf[..len])
                .map_err(|_| ProtocolError::InvalidDomain)?;
            Host::Domain(domain.to_string())
        }
        AddressType::IPv6 => {
            read_field(reader, &mut buf[..16], "IPv6 address").await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            Host::V6(Ipv6Addr::from(octets))
        }
    };

    read_field(reader, &mut buf[..2], "port").await?;
    let port = u16::from_be_bytes([buf[0], buf[1]]);

    let request = Socks5Request {
        address_type,
        address: host.with_port(port),
    };
    debug!("SOCKS5 request: {:?}", request);

    Ok(request)
}

enum Host {
    V4(Ipv4Addr),
    Domain(String),
    V6(Ipv6Addr),
}

impl Host {
    fn with_port(self, port: u16) -> String {
        match self {
            Host::V4(ip) => SocketAddrV4::new(ip, port).to_string(),
            Host::V6(ip) => SocketAddrV6::new(ip, port, 0, 0).to_string(),
            Host::Domain(domain) => format!("{}:{}", domain, port),
        }
    }
}

/// Send the method selection reply
pub async fn send_method_selection<W>(writer: &mut W, method: AuthMethod) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[SOCKS5_VERSION, method as u8]).await?;
    writer.flush().await?;
    Ok(())
}

/// Send a CONNECT reply; the bound address is always reported as 0.0.0.0:0
pub async fn send_reply<W>(writer: &mut W, reply: Reply) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = [
        SOCKS5_VERSION,
        reply as u8,
        0x00,
        AddressType::IPv4 as u8,
        0,
        0,
        0,
        0,
        0,
        0,
    ];

    writer.write_all(&response).await?;
    writer.flush().await?;

    Ok(())
}
