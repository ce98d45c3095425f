//! Error types for the proxy server

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Malformed or unsupported handshake input
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("domain name is not valid UTF-8")]
    InvalidDomain,
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("SOCKS5 protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Failed to connect to {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Connection closed")]
    Closed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn dial(address: impl Into<String>, source: io::Error) -> Self {
        Self::Dial {
            address: address.into(),
            source,
        }
    }

    /// Errors expected while a tunnel is being torn down, either by the
    /// peer direction finishing first or by shutdown.
    pub fn is_teardown(&self) -> bool {
        match self {
            Self::Closed | Self::Cancelled => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl From<prometheus::Error> for ProxyError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}
