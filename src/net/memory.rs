//! In-process transport over `tokio::io::duplex` pipes.
//!
//! Every `connect` creates a pipe, keeps one end as the client [`Socket`] and
//! hands the other end to whoever holds the [`MemoryPeer`] receiver, which
//! plays the remote side. `listen` is served by [`MemoryTransport::dial`],
//! which feeds the far end of a fresh pipe into the listening acceptor.

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;

use crate::net::socket::{Socket, SocketEvents, SocketInfo};
use crate::net::transport::{Accepted, Acceptor, Protocol, Transport};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Remote end of an outbound in-memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub stream: DuplexStream,
}

#[derive(Default)]
struct Registry {
    listeners: HashMap<u16, mpsc::UnboundedSender<DuplexStream>>,
    refused: HashMap<(String, u16), io::ErrorKind>,
}

/// Transport whose connections never leave the process.
#[derive(Clone)]
pub struct MemoryTransport {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    registry: Arc<Mutex<Registry>>,
    connects: Arc<AtomicUsize>,
}

impl MemoryTransport {
    /// Create a transport and the stream of remote ends for its connections.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                registry: Arc::new(Mutex::new(Registry::default())),
                connects: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Number of successful `connect` calls so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make future connects to `host:port` fail with `kind`.
    pub fn refuse(&self, host: &str, port: u16, kind: io::ErrorKind) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .refused
            .insert((host.to_string(), port), kind);
    }

    /// Open a client pipe to a listener registered on `port`.
    pub fn dial(&self, port: u16) -> io::Result<DuplexStream> {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let listener = registry
            .listeners
            .get(&port)
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no listener"))?;
        let (near, far) = duplex(PIPE_CAPACITY);
        listener
            .send(far)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed"))?;
        Ok(near)
    }
}

impl Transport for MemoryTransport {
    fn connect(
        &self,
        host: &str,
        port: u16,
        protocol: Protocol,
    ) -> BoxFuture<'static, io::Result<(Socket, SocketEvents)>> {
        let refused = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .refused
            .get(&(host.to_string(), port))
            .copied();
        let peers = self.peers.clone();
        let connects = Arc::clone(&self.connects);
        let host = host.to_string();

        Box::pin(async move {
            if let Some(kind) = refused {
                return Err(io::Error::new(kind, format!("connect to {}:{} refused", host, port)));
            }
            let (near, far) = duplex(PIPE_CAPACITY);
            peers
                .send(MemoryPeer {
                    host,
                    port,
                    protocol,
                    stream: far,
                })
                .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "peer gone"))?;
            connects.fetch_add(1, Ordering::SeqCst);
            Ok(Socket::spawn(near, SocketInfo::default()))
        })
    }

    fn listen(
        &self,
        _host: &str,
        port: u16,
        _backlog: u32,
    ) -> BoxFuture<'static, io::Result<Box<dyn Acceptor>>> {
        let registry = Arc::clone(&self.registry);

        Box::pin(async move {
            let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
            if registry.listeners.get(&port).is_some_and(|tx| !tx.is_closed()) {
                return Err(io::Error::new(io::ErrorKind::AddrInUse, "port in use"));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            registry.listeners.insert(port, tx);
            let acceptor = MemoryAcceptor {
                incoming: rx,
                local_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            };
            Ok(Box::new(acceptor) as Box<dyn Acceptor>)
        })
    }
}

struct MemoryAcceptor {
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
    local_addr: SocketAddr,
}

impl Acceptor for MemoryAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<Accepted>> {
        Box::pin(async move {
            let stream = self.incoming.recv().await.ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "memory transport dropped")
            })?;
            let info = SocketInfo {
                local_addr: Some(self.local_addr),
                ..SocketInfo::default()
            };
            let (socket, events) = Socket::spawn(stream, info);
            Ok(Accepted {
                socket,
                events,
                peer_addr: None,
            })
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::socket::SocketEvent;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn connect_hands_far_end_to_peer_receiver() {
        let (transport, mut peers) = MemoryTransport::new();
        let (_socket, mut events) = transport
            .connect("example.test", 80, Protocol::Http)
            .await
            .unwrap();

        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.host, "example.test");
        assert_eq!(transport.connect_count(), 1);

        peer.stream.write_all(b"hi").await.unwrap();
        assert!(matches!(events.recv().await, Some(SocketEvent::Data(_))));
    }

    #[tokio::test]
    async fn refused_hosts_fail_to_connect() {
        let (transport, _peers) = MemoryTransport::new();
        transport.refuse("down.test", 81, io::ErrorKind::ConnectionRefused);

        let err = transport
            .connect("down.test", 81, Protocol::Http)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test]
    async fn dial_reaches_listener() {
        let (transport, _peers) = MemoryTransport::new();
        let mut acceptor = transport.listen("localhost", 8080, 1).await.unwrap();

        let _client = transport.dial(8080).unwrap();
        let accepted = acceptor.accept().await.unwrap();
        assert_eq!(accepted.socket.local_addr().map(|a| a.port()), Some(8080));
        assert!(transport.dial(9090).is_err());
    }
}
