//! Transport abstraction for the instrument byte stream.
//!
//! The connection logic only needs something it can write a command line to
//! and read a response line from. Production uses TCP; tests and the
//! simulator plug in `tokio::io::duplex` pairs through the same [`Connector`]
//! seam.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::ConnectionError;

/// Trait alias for an async instrument stream.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` qualifies:
/// - `tokio::net::TcpStream` (real balance on the network)
/// - `tokio::io::DuplexStream` (tests, simulator)
pub trait InstrumentIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> InstrumentIo for T {}

/// Type-erased boxed instrument stream.
pub type DynStream = Box<dyn InstrumentIo>;

/// Network address of the instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Opens byte streams to an instrument.
///
/// Implementations must honour `timeout` and must not retry internally;
/// retry policy belongs to the reconnect supervisor.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh stream to `endpoint`.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<DynStream, ConnectionError>;
}

/// Plain TCP connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<DynStream, ConnectionError> {
        let addr = (endpoint.host.as_str(), endpoint.port);
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ConnectionError::from(e)),
            Err(_) => return Err(ConnectionError::Timeout),
        };
        // MT-SICS commands are a few bytes each
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(endpoint = %endpoint, error = %e, "failed to set TCP_NODELAY");
        }
        Ok(Box::new(stream))
    }
}
