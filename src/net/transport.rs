//! Platform socket capability.
//!
//! Servers and agents never open sockets themselves; they are handed a
//! [`Transport`] at construction and ask it to `connect` or `listen`. The
//! production implementation is [`TcpTransport`]; tests and embedders can use
//! [`MemoryTransport`](crate::net::memory::MemoryTransport).

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::config::TransportConfig;
use crate::net::listener::Listener;
use crate::net::socket::{Socket, SocketEvents, SocketInfo};

/// URL scheme of a connection target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl Protocol {
    /// Port implied when a URL names none.
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }

    /// Scheme with trailing colon, e.g. `http:`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http:",
            Protocol::Https => "https:",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_end_matches(':').to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported protocol {:?}", other),
            )),
        }
    }
}

/// A socket accepted by a listener.
#[derive(Debug)]
pub struct Accepted {
    pub socket: Socket,
    pub events: SocketEvents,
    pub peer_addr: Option<SocketAddr>,
}

/// Source of inbound sockets for a listening server.
pub trait Acceptor: Send {
    /// Wait for the next inbound connection.
    fn accept(&mut self) -> BoxFuture<'_, io::Result<Accepted>>;

    /// Address the acceptor is bound to.
    fn local_addr(&self) -> SocketAddr;
}

/// Ability to open outbound and inbound sockets.
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to `host:port`.
    fn connect(
        &self,
        host: &str,
        port: u16,
        protocol: Protocol,
    ) -> BoxFuture<'static, io::Result<(Socket, SocketEvents)>>;

    /// Start listening on `host:port`.
    fn listen(
        &self,
        host: &str,
        port: u16,
        backlog: u32,
    ) -> BoxFuture<'static, io::Result<Box<dyn Acceptor>>>;
}

/// Plain TCP transport backed by tokio.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TransportConfig,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl Transport for TcpTransport {
    fn connect(
        &self,
        host: &str,
        port: u16,
        protocol: Protocol,
    ) -> BoxFuture<'static, io::Result<(Socket, SocketEvents)>> {
        let host = host.to_string();
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let nodelay = self.config.nodelay;

        Box::pin(async move {
            if protocol == Protocol::Https {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "TLS is not provided by the TCP transport",
                ));
            }

            let stream = tokio::time::timeout(connect_timeout, TcpStream::connect((host.as_str(), port)))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {}:{} timed out", host, port),
                    )
                })??;
            if nodelay {
                stream.set_nodelay(true)?;
            }

            let info = SocketInfo {
                peer_addr: stream.peer_addr().ok(),
                local_addr: stream.local_addr().ok(),
                permit: None,
            };
            tracing::debug!(host = %host, port, peer_addr = ?info.peer_addr, "Connected");
            Ok(Socket::spawn(stream, info))
        })
    }

    fn listen(
        &self,
        host: &str,
        port: u16,
        backlog: u32,
    ) -> BoxFuture<'static, io::Result<Box<dyn Acceptor>>> {
        let host = host.to_string();
        let max_connections = self.config.max_connections;

        Box::pin(async move {
            let listener = Listener::bind(&host, port, backlog, max_connections).await?;
            Ok(Box::new(listener) as Box<dyn Acceptor>)
        })
    }
}
