//! TCP listener implementation with backpressure.
//!
//! # Responsibilities
//! - Bind to the requested host/port with an explicit accept backlog
//! - Accept incoming TCP connections and wrap them in [`Socket`]s
//! - Enforce max_connections limit via semaphore
//! - Graceful handling of accept errors

use futures_util::future::BoxFuture;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Semaphore;

use crate::net::socket::{Socket, SocketInfo};
use crate::net::transport::{Accepted, Acceptor};

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to resolve the bind address.
    Resolve(io::Error),
    /// Failed to bind to address.
    Bind(io::Error),
    /// Failed to accept connection.
    Accept(io::Error),
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Resolve(e) => write!(f, "Failed to resolve: {}", e),
            ListenerError::Bind(e) => write!(f, "Failed to bind: {}", e),
            ListenerError::Accept(e) => write!(f, "Failed to accept: {}", e),
        }
    }
}

impl std::error::Error for ListenerError {}

impl From<ListenerError> for io::Error {
    fn from(err: ListenerError) -> Self {
        match err {
            ListenerError::Resolve(e) | ListenerError::Bind(e) | ListenerError::Accept(e) => e,
        }
    }
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
pub struct Listener {
    /// The underlying TCP listener.
    inner: TcpListener,
    /// Address actually bound (resolves port 0).
    local_addr: SocketAddr,
    /// Semaphore to limit concurrent connections.
    connection_limit: Arc<Semaphore>,
    /// Configured maximum connections.
    max_connections: usize,
}

impl Listener {
    /// Bind to `host:port` with the given accept backlog and connection limit.
    pub async fn bind(
        host: &str,
        port: u16,
        backlog: u32,
        max_connections: usize,
    ) -> Result<Self, ListenerError> {
        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(ListenerError::Resolve)?
            .next()
            .ok_or_else(|| {
                ListenerError::Resolve(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no address for {}", host),
                ))
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(ListenerError::Bind)?;
        socket.set_reuseaddr(true).map_err(ListenerError::Bind)?;
        socket.bind(addr).map_err(ListenerError::Bind)?;
        let listener = socket.listen(backlog).map_err(ListenerError::Bind)?;

        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(
            address = %local_addr,
            backlog,
            max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            local_addr,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// This will wait if the connection limit has been reached. The returned
    /// socket holds its slot until it closes.
    pub async fn accept(&self) -> Result<Accepted, ListenerError> {
        // Acquire permit first (backpressure)
        let permit = Arc::clone(&self.connection_limit)
            .acquire_owned()
            .await
            .map_err(|_| {
                ListenerError::Accept(io::Error::new(
                    io::ErrorKind::Other,
                    "connection limit semaphore closed",
                ))
            })?;

        // Then accept the connection
        let (stream, peer_addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
        }

        tracing::debug!(
            peer_addr = %peer_addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        let info = SocketInfo {
            peer_addr: Some(peer_addr),
            local_addr: Some(self.local_addr),
            permit: Some(ConnectionPermit { _permit: permit }),
        };
        let (socket, events) = Socket::spawn(stream, info);
        Ok(Accepted {
            socket,
            events,
            peer_addr: Some(peer_addr),
        })
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

impl Acceptor for Listener {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<Accepted>> {
        Box::pin(async move { Listener::accept(self).await.map_err(io::Error::from) })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// The socket driver owns it, so the slot frees even if the consumer panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_ephemeral_port_and_limits_connections() {
        let mut listener = Listener::bind("127.0.0.1", 0, 16, 1).await.unwrap();
        let addr = Acceptor::local_addr(&listener);
        assert_ne!(addr.port(), 0);

        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let accepted = Acceptor::accept(&mut listener).await.unwrap();
        assert_eq!(listener.available_permits(), 0);

        accepted.socket.destroy(None);
        let mut events = accepted.events;
        while let Some(ev) = events.recv().await {
            if matches!(ev, crate::net::socket::SocketEvent::Close { .. }) {
                break;
            }
        }
        assert_eq!(listener.available_permits(), 1);
    }
}
