//! SOCKS5 proxy implementation

pub mod handler;
pub mod protocol;

pub use handler::handshake;

/// Protocol version byte carried by every SOCKS5 frame
pub const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS5 authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    GssApi = 0x01,
    UserPass = 0x02,
    NoAcceptable = 0xFF,
}

impl AuthMethod {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::NoAuth),
            0x01 => Some(Self::GssApi),
            0x02 => Some(Self::UserPass),
            0xFF => Some(Self::NoAcceptable),
            _ => None,
        }
    }
}

/// SOCKS5 command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl Command {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Connect),
            0x02 => Some(Self::Bind),
            0x03 => Some(Self::UdpAssociate),
            _ => None,
        }
    }
}

/// SOCKS5 address type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    IPv4 = 0x01,
    DomainName = 0x03,
    IPv6 = 0x04,
}

impl AddressType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::IPv4),
            0x03 => Some(Self::DomainName),
            0x04 => Some(Self::IPv6),
            _ => None,
        }
    }
}

/// SOCKS5 reply code
///
/// Only `Success` and `HostUnreachable` are sent by the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Success = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// A parsed CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Request {
    pub address_type: AddressType,
    /// `host:port` as handed to the dialer; domain names are left unresolved
    pub address: String,
}
