//! Keep-alive socket pool.
//!
//! # Responsibilities
//! - Hand out sockets per key, reusing free ones before connecting
//! - Move released sockets to the free partition when keep-alive allows
//! - Evict free sockets that close, error, receive data or sit idle
//! - Bound concurrent sockets per key when `max_sockets` is set
//!
//! # Design Decisions
//! - Both partitions live under one lock, so a socket moves between them
//!   in a single critical section and is never in both
//! - While free, a socket's notification stream is owned by a watcher task;
//!   reuse asks the watcher to hand the stream back, and a socket evicted in
//!   the meantime is skipped

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;

use crate::agent::key::AgentKey;
use crate::agent::lease::{Lease, LeaseParts};
use crate::config::{AgentConfig, Scheduling};
use crate::http::error::HttpError;
use crate::net::{ConnectionId, Socket, SocketEvent, SocketEvents, Transport};
use crate::observability::metrics;

struct FreeEntry {
    socket: Socket,
    reclaim: oneshot::Sender<()>,
    watcher: JoinHandle<Option<SocketEvents>>,
}

#[derive(Default)]
struct Partitions {
    active: HashMap<AgentKey, HashMap<ConnectionId, Socket>>,
    free: HashMap<AgentKey, VecDeque<FreeEntry>>,
}

impl Partitions {
    fn remove_active(&mut self, key: &AgentKey, id: ConnectionId) -> bool {
        let Some(sockets) = self.active.get_mut(key) else {
            return false;
        };
        let removed = sockets.remove(&id).is_some();
        if sockets.is_empty() {
            self.active.remove(key);
        }
        removed
    }

    fn remove_free(&mut self, key: &AgentKey, id: ConnectionId) -> Option<FreeEntry> {
        let entries = self.free.get_mut(key)?;
        let pos = entries.iter().position(|e| e.socket.id() == id)?;
        let entry = entries.remove(pos);
        if entries.is_empty() {
            self.free.remove(key);
        }
        entry
    }

    fn pop_free(&mut self, key: &AgentKey, scheduling: Scheduling) -> Option<FreeEntry> {
        let entries = self.free.get_mut(key)?;
        let entry = match scheduling {
            Scheduling::Lifo => entries.pop_back(),
            Scheduling::Fifo => entries.pop_front(),
        };
        if entries.is_empty() {
            self.free.remove(key);
        }
        entry
    }
}

pub(crate) struct PoolShared {
    transport: Arc<dyn Transport>,
    config: AgentConfig,
    partitions: Mutex<Partitions>,
    slots: Mutex<HashMap<AgentKey, Arc<Semaphore>>>,
}

impl PoolShared {
    fn partitions(&self) -> MutexGuard<'_, Partitions> {
        self.partitions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, key: &AgentKey, max: usize) -> Arc<Semaphore> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(max))),
        )
    }

    /// Drop a lease that was never released.
    pub(crate) fn discard(&self, parts: LeaseParts) {
        self.partitions().remove_active(&parts.key, parts.socket.id());
        tracing::debug!(
            key = %parts.key,
            connection_id = %parts.socket.id(),
            "Unreleased lease dropped; socket destroyed"
        );
        parts.socket.destroy(None);
    }
}

/// Connection pool keyed by `(host, port, protocol)`. Cloning yields another
/// handle to the same pool.
#[derive(Clone)]
pub struct Agent {
    shared: Arc<PoolShared>,
}

impl Agent {
    pub fn new(transport: Arc<dyn Transport>, config: AgentConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                transport,
                config,
                partitions: Mutex::new(Partitions::default()),
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.shared.config
    }

    pub fn keep_alive(&self) -> bool {
        self.shared.config.keep_alive
    }

    /// Obtain a socket for `key`: a free one if available, otherwise a new
    /// connection. Waits for a slot when `max_sockets` is reached.
    pub async fn get_connection(&self, key: &AgentKey) -> Result<Lease, HttpError> {
        let permit = match self.shared.config.max_sockets {
            Some(max) => Some(
                self.shared
                    .slot(key, max)
                    .acquire_owned()
                    .await
                    .map_err(|_| io::Error::other("agent slot closed"))?,
            ),
            None => None,
        };

        loop {
            let entry = {
                let mut partitions = self.shared.partitions();
                let entry = partitions.pop_free(key, self.shared.config.scheduling);
                if let Some(entry) = &entry {
                    partitions
                        .active
                        .entry(key.clone())
                        .or_default()
                        .insert(entry.socket.id(), entry.socket.clone());
                }
                entry
            };
            let Some(entry) = entry else { break };
            metrics::dec_free_sockets();

            let id = entry.socket.id();
            let _ = entry.reclaim.send(());
            match entry.watcher.await {
                Ok(Some(events)) => {
                    metrics::record_pool_lookup(true);
                    tracing::debug!(key = %key, connection_id = %id, "Reusing free socket");
                    let parts = LeaseParts {
                        key: key.clone(),
                        socket: entry.socket,
                        events,
                        permit,
                    };
                    return Ok(Lease::new(parts, true, Arc::clone(&self.shared)));
                }
                _ => {
                    tracing::trace!(key = %key, connection_id = %id, "Free socket evicted during reuse");
                    self.shared.partitions().remove_active(key, id);
                }
            }
        }

        metrics::record_pool_lookup(false);
        let (socket, events) = self
            .shared
            .transport
            .connect(&key.host, key.port, key.protocol)
            .await?;
        tracing::debug!(key = %key, connection_id = %socket.id(), "Opened new socket");
        self.shared
            .partitions()
            .active
            .entry(key.clone())
            .or_default()
            .insert(socket.id(), socket.clone());

        let parts = LeaseParts {
            key: key.clone(),
            socket,
            events,
            permit,
        };
        Ok(Lease::new(parts, false, Arc::clone(&self.shared)))
    }

    /// Return a socket after its request completed.
    ///
    /// With keep-alive on and room in the free partition the socket is
    /// pooled; otherwise it is destroyed.
    pub fn release(&self, lease: Lease) {
        if !Arc::ptr_eq(lease.pool(), &self.shared) {
            tracing::warn!(key = %lease.key(), "Lease released to a foreign agent");
            return;
        }
        let Some(parts) = lease.into_parts() else {
            return;
        };
        let LeaseParts {
            key, socket, events, ..
        } = parts;
        let id = socket.id();
        let config = &self.shared.config;

        let mut partitions = self.shared.partitions();
        partitions.remove_active(&key, id);
        let free_len = partitions.free.get(&key).map_or(0, VecDeque::len);

        if !config.keep_alive || !socket.is_writable() || free_len >= config.max_free_sockets {
            drop(partitions);
            tracing::debug!(
                key = %key,
                connection_id = %id,
                keep_alive = config.keep_alive,
                free_sockets = free_len,
                "Socket not pooled; destroying"
            );
            socket.destroy(None);
            return;
        }

        socket.set_timeout(None);
        let (reclaim, reclaim_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_free(
            Arc::downgrade(&self.shared),
            key.clone(),
            socket.clone(),
            events,
            reclaim_rx,
            Duration::from_millis(config.keep_alive_msecs),
        ));
        partitions.free.entry(key.clone()).or_default().push_back(FreeEntry {
            socket,
            reclaim,
            watcher,
        });
        drop(partitions);

        metrics::inc_free_sockets();
        tracing::debug!(key = %key, connection_id = %id, "Socket returned to free pool");
    }

    /// Destroy every active and free socket and clear both partitions.
    pub fn destroy(&self) {
        let (active, free) = {
            let mut partitions = self.shared.partitions();
            (
                std::mem::take(&mut partitions.active),
                std::mem::take(&mut partitions.free),
            )
        };

        let mut destroyed = 0usize;
        for socket in active.into_values().flat_map(HashMap::into_values) {
            socket.destroy(None);
            destroyed += 1;
        }
        for entry in free.into_values().flatten() {
            metrics::dec_free_sockets();
            entry.socket.destroy(None);
            destroyed += 1;
        }
        tracing::info!(sockets = destroyed, "Agent destroyed");
    }

    pub fn active_count(&self, key: &AgentKey) -> usize {
        self.shared.partitions().active.get(key).map_or(0, HashMap::len)
    }

    pub fn free_count(&self, key: &AgentKey) -> usize {
        self.shared.partitions().free.get(key).map_or(0, VecDeque::len)
    }

    pub fn is_active(&self, key: &AgentKey, id: ConnectionId) -> bool {
        self.shared
            .partitions()
            .active
            .get(key)
            .is_some_and(|s| s.contains_key(&id))
    }

    pub fn is_free(&self, key: &AgentKey, id: ConnectionId) -> bool {
        self.shared
            .partitions()
            .free
            .get(key)
            .is_some_and(|e| e.iter().any(|e| e.socket.id() == id))
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

/// Own a free socket's notifications until it is reclaimed or evicted.
///
/// Returns the stream on reclaim, `None` on eviction.
async fn watch_free(
    pool: Weak<PoolShared>,
    key: AgentKey,
    socket: Socket,
    mut events: SocketEvents,
    mut reclaim: oneshot::Receiver<()>,
    idle: Duration,
) -> Option<SocketEvents> {
    let timer = tokio::time::sleep(idle);
    tokio::pin!(timer);

    let reason = loop {
        tokio::select! {
            biased;
            reclaimed = &mut reclaim => match reclaimed {
                Ok(()) => return Some(events),
                Err(_) => break "pool destroyed",
            },
            event = events.recv() => match event {
                Some(SocketEvent::Data(_)) => break "unexpected data",
                Some(SocketEvent::End) => break "peer closed",
                Some(SocketEvent::Error(_)) => break "socket error",
                Some(SocketEvent::Close { .. }) | None => break "socket closed",
                Some(SocketEvent::Drain) | Some(SocketEvent::Timeout) => {}
            },
            _ = &mut timer => break "idle",
        }
    };

    if let Some(pool) = pool.upgrade() {
        if pool.partitions().remove_free(&key, socket.id()).is_some() {
            metrics::dec_free_sockets();
        }
    }
    tracing::debug!(key = %key, connection_id = %socket.id(), reason, "Evicting free socket");
    socket.destroy(None);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{MemoryPeer, MemoryTransport, Protocol};
    use tokio::sync::mpsc;

    fn key() -> AgentKey {
        AgentKey::new("example.test", 80, Protocol::Http)
    }

    fn agent(config: AgentConfig) -> (Agent, MemoryTransport, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (transport, peers) = MemoryTransport::new();
        (Agent::new(Arc::new(transport.clone()), config), transport, peers)
    }

    fn keep_alive() -> AgentConfig {
        AgentConfig {
            keep_alive: true,
            keep_alive_msecs: 10_000,
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn released_socket_is_reused() {
        let (agent, transport, mut peers) = agent(keep_alive());

        let first = agent.get_connection(&key()).await.unwrap();
        let _peer = peers.recv().await.unwrap();
        let socket = first.socket().clone();
        assert!(!first.is_reused());
        assert!(agent.is_active(&key(), socket.id()));

        agent.release(first);
        assert!(agent.is_free(&key(), socket.id()));
        assert!(!agent.is_active(&key(), socket.id()));

        let second = agent.get_connection(&key()).await.unwrap();
        assert!(second.is_reused());
        assert_eq!(second.socket(), &socket);
        assert_eq!(transport.connect_count(), 1);
        assert_eq!(agent.free_count(&key()), 0);
        assert_eq!(agent.active_count(&key()), 1);
    }

    #[tokio::test]
    async fn without_keep_alive_release_destroys() {
        let (agent, _transport, mut peers) = agent(AgentConfig::default());

        let lease = agent.get_connection(&key()).await.unwrap();
        let _peer = peers.recv().await.unwrap();
        let socket = lease.socket().clone();

        agent.release(lease);
        assert!(socket.is_destroyed());
        assert_eq!(agent.free_count(&key()), 0);
        assert_eq!(agent.active_count(&key()), 0);
    }

    #[tokio::test]
    async fn sockets_beyond_max_free_are_destroyed() {
        let config = AgentConfig {
            max_free_sockets: 1,
            ..keep_alive()
        };
        let (agent, _transport, mut peers) = agent(config);

        let a = agent.get_connection(&key()).await.unwrap();
        let b = agent.get_connection(&key()).await.unwrap();
        let _pa = peers.recv().await.unwrap();
        let _pb = peers.recv().await.unwrap();
        let b_socket = b.socket().clone();

        agent.release(a);
        agent.release(b);
        assert_eq!(agent.free_count(&key()), 1);
        assert!(b_socket.is_destroyed());
    }

    #[tokio::test]
    async fn scheduling_controls_reuse_order() {
        for (scheduling, expect_last) in [(Scheduling::Lifo, true), (Scheduling::Fifo, false)] {
            let config = AgentConfig {
                scheduling,
                ..keep_alive()
            };
            let (agent, _transport, mut peers) = agent(config);

            let a = agent.get_connection(&key()).await.unwrap();
            let b = agent.get_connection(&key()).await.unwrap();
            let _pa = peers.recv().await.unwrap();
            let _pb = peers.recv().await.unwrap();
            let (a_id, b_id) = (a.socket().id(), b.socket().id());

            agent.release(a);
            agent.release(b);

            let next = agent.get_connection(&key()).await.unwrap();
            let expected = if expect_last { b_id } else { a_id };
            assert_eq!(next.socket().id(), expected, "{:?}", scheduling);
        }
    }

    #[tokio::test]
    async fn idle_free_socket_is_evicted() {
        let config = AgentConfig {
            keep_alive_msecs: 20,
            ..keep_alive()
        };
        let (agent, transport, mut peers) = agent(config);

        let lease = agent.get_connection(&key()).await.unwrap();
        let _peer = peers.recv().await.unwrap();
        let socket = lease.socket().clone();
        agent.release(lease);
        assert_eq!(agent.free_count(&key()), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(agent.free_count(&key()), 0);
        assert!(socket.is_destroyed());

        let _fresh = agent.get_connection(&key()).await.unwrap();
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn peer_close_evicts_free_socket() {
        let (agent, _transport, mut peers) = agent(keep_alive());

        let lease = agent.get_connection(&key()).await.unwrap();
        let peer = peers.recv().await.unwrap();
        agent.release(lease);

        drop(peer);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(agent.free_count(&key()), 0);
    }

    #[tokio::test]
    async fn dropped_lease_leaves_active_and_destroys() {
        let (agent, _transport, mut peers) = agent(keep_alive());

        let lease = agent.get_connection(&key()).await.unwrap();
        let _peer = peers.recv().await.unwrap();
        let socket = lease.socket().clone();

        drop(lease);
        assert_eq!(agent.active_count(&key()), 0);
        assert_eq!(agent.free_count(&key()), 0);
        assert!(socket.is_destroyed());
    }

    #[tokio::test]
    async fn max_sockets_waits_for_a_release() {
        let config = AgentConfig {
            max_sockets: Some(1),
            ..keep_alive()
        };
        let (agent, transport, mut peers) = agent(config);

        let first = agent.get_connection(&key()).await.unwrap();
        let _peer = peers.recv().await.unwrap();

        let waiting = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.get_connection(&key()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        agent.release(first);
        let second = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(second.is_reused());
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn destroy_clears_both_partitions() {
        let (agent, _transport, mut peers) = agent(keep_alive());

        let pooled = agent.get_connection(&key()).await.unwrap();
        let busy = agent.get_connection(&key()).await.unwrap();
        let _pa = peers.recv().await.unwrap();
        let _pb = peers.recv().await.unwrap();
        let (pooled_socket, busy_socket) = (pooled.socket().clone(), busy.socket().clone());
        agent.release(pooled);

        agent.destroy();
        assert_eq!(agent.free_count(&key()), 0);
        assert_eq!(agent.active_count(&key()), 0);
        assert!(pooled_socket.is_destroyed());
        assert!(busy_socket.is_destroyed());
    }

    #[tokio::test]
    async fn connect_failure_is_connection_error() {
        let (agent, transport, _peers) = agent(keep_alive());
        transport.refuse("example.test", 80, io::ErrorKind::ConnectionRefused);

        let err = agent.get_connection(&key()).await.unwrap_err();
        assert!(matches!(err, HttpError::Connection(_)));
        assert_eq!(agent.active_count(&key()), 0);
    }
}
