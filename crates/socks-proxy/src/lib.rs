//! SOCKS5 Proxy Server Implementation
//!
//! This crate provides a no-authentication SOCKS5 CONNECT proxy: a
//! handshake engine, a cancellable bidirectional tunnel, and a bounded
//! acceptor that drains in-flight sessions on shutdown.

pub mod buffer_pool;
pub mod config;
pub mod copy;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod server;
pub mod session;
pub mod socks5;
pub mod transport;

pub use config::ProxyConfig;
pub use error::{ProtocolError, ProxyError, Result};
pub use metrics::{ConnectionObserver, NoopObserver, PrometheusObserver};
pub use server::{run, ProxyServer, ServerState};
pub use session::{Session, SessionState};
