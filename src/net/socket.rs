//! Socket handle and its I/O driver task.
//!
//! # Responsibilities
//! - Own one byte stream (TCP, duplex pipe, ...) on a dedicated task
//! - Turn reads into ordered `Data` notifications
//! - Accept fire-and-forget writes, reporting back-pressure and `Drain`
//! - Arm an inactivity timer that reports `Timeout` without closing
//! - Report `Error` (if any) strictly before the single `Close`
//!
//! # Design Decisions
//! - Half-open: a peer EOF is reported as `End`; our side stays writable
//!   until `end()` or `destroy()`, so consumers decide the close policy
//! - Writes queued before `end()` are flushed before the shutdown;
//!   `destroy()` drops whatever is still queued
//! - The first subscriber is registered before the driver starts, so no
//!   notification can be lost between creation and subscription

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::events::Emitter;
use crate::net::connection::ConnectionId;
use crate::net::listener::ConnectionPermit;

/// Queued-but-unwritten bytes above which `write` reports back-pressure.
pub const HIGH_WATER_MARK: usize = 16 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// Primary notification stream of a socket.
pub type SocketEvents = mpsc::UnboundedReceiver<SocketEvent>;

/// Notifications delivered by a socket, in the order they happen.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Bytes received from the peer.
    Data(Bytes),
    /// The peer finished sending (read side reached EOF).
    End,
    /// Queued writes drained after `write` reported back-pressure.
    Drain,
    /// No activity within the configured timeout.
    Timeout,
    /// Transport failure; always followed by `Close { had_error: true }`.
    Error(Arc<io::Error>),
    /// The socket is fully closed. Delivered exactly once.
    Close { had_error: bool },
}

/// Addresses and resources attached to a socket at creation.
#[derive(Debug, Default)]
pub struct SocketInfo {
    pub peer_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    /// Listener slot held until the socket closes.
    pub permit: Option<ConnectionPermit>,
}

enum Command {
    Write(Bytes),
    End,
    Destroy(Option<io::Error>),
    SetTimeout(Option<Duration>),
}

#[derive(Debug, Default)]
struct Status {
    ending: bool,
    destroyed: bool,
    closed: bool,
    needs_drain: bool,
}

struct Shared {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    commands: mpsc::UnboundedSender<Command>,
    status: Mutex<Status>,
    queued: AtomicUsize,
    events: Emitter<SocketEvent>,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheap, cloneable handle to a connected byte stream.
#[derive(Clone)]
pub struct Socket {
    shared: Arc<Shared>,
}

impl Socket {
    /// Start driving `stream` on a new task.
    ///
    /// Returns the handle and the primary notification stream.
    pub fn spawn<S>(stream: S, info: SocketInfo) -> (Self, SocketEvents)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id: ConnectionId::next(),
            peer_addr: info.peer_addr,
            local_addr: info.local_addr,
            commands,
            status: Mutex::new(Status::default()),
            queued: AtomicUsize::new(0),
            events: Emitter::new(),
        });
        let events = shared.events.subscribe();

        tracing::trace!(
            connection_id = %shared.id,
            peer_addr = ?shared.peer_addr,
            "Socket opened"
        );

        tokio::spawn(drive(stream, command_rx, Arc::clone(&shared), info.permit));
        (Self { shared }, events)
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    /// Register an additional subscriber for this socket's notifications.
    pub fn subscribe(&self) -> SocketEvents {
        self.shared.events.subscribe()
    }

    /// Queue `data` for writing.
    ///
    /// Returns `false` when the queue is above [`HIGH_WATER_MARK`] (a `Drain`
    /// notification follows once it empties) or when the socket no longer
    /// accepts writes.
    pub fn write(&self, data: impl Into<Bytes>) -> bool {
        let data = data.into();
        let mut status = self.shared.status();
        if status.ending || status.destroyed {
            tracing::trace!(connection_id = %self.shared.id, "Write after end ignored");
            return false;
        }
        if data.is_empty() {
            return true;
        }

        let len = data.len();
        let queued = self.shared.queued.fetch_add(len, Ordering::SeqCst) + len;
        if self.shared.commands.send(Command::Write(data)).is_err() {
            return false;
        }
        if queued >= HIGH_WATER_MARK {
            status.needs_drain = true;
            false
        } else {
            true
        }
    }

    /// Half-close: flush queued writes, then shut down the write side.
    pub fn end(&self) {
        let mut status = self.shared.status();
        if status.ending || status.destroyed {
            return;
        }
        status.ending = true;
        let _ = self.shared.commands.send(Command::End);
    }

    /// Close immediately, dropping queued writes. Idempotent.
    pub fn destroy(&self, error: Option<io::Error>) {
        let mut status = self.shared.status();
        if status.destroyed || status.closed {
            return;
        }
        status.destroyed = true;
        let _ = self.shared.commands.send(Command::Destroy(error));
    }

    /// Arm (`Some`) or disarm (`None`) the inactivity timer.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        let _ = self.shared.commands.send(Command::SetTimeout(timeout));
    }

    /// Whether the socket still accepts writes.
    pub fn is_writable(&self) -> bool {
        let status = self.shared.status();
        !(status.ending || status.destroyed || status.closed)
    }

    /// Whether the socket was destroyed or has closed.
    pub fn is_destroyed(&self) -> bool {
        let status = self.shared.status();
        status.destroyed || status.closed
    }

    /// Bytes accepted by `write` but not yet handed to the transport.
    pub fn buffered_amount(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.shared.id)
            .field("peer_addr", &self.shared.peer_addr)
            .finish()
    }
}

impl PartialEq for Socket {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Socket {}

/// One step of write-side progress.
enum Flushed {
    Wrote(usize),
    ShutDown,
}

/// Write part of `front`, or shut the write side down once nothing is queued.
async fn flush_step<W>(writer: &mut W, front: Option<&Bytes>) -> io::Result<Flushed>
where
    W: AsyncWrite + Unpin,
{
    match front {
        Some(data) => match writer.write(data).await? {
            0 => Err(io::Error::from(io::ErrorKind::WriteZero)),
            n => Ok(Flushed::Wrote(n)),
        },
        None => writer.shutdown().await.map(|()| Flushed::ShutDown),
    }
}

async fn drive<S>(
    stream: S,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
    permit: Option<ConnectionPermit>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut pending: VecDeque<Bytes> = VecDeque::new();
    let mut read_open = true;
    let mut end_requested = false;
    let mut write_closed = false;
    let mut timeout: Option<Duration> = None;
    let timer = tokio::time::sleep(Duration::from_secs(3600));
    tokio::pin!(timer);
    let mut timer_armed = false;

    // Writes are polled alongside commands, so a peer that stops reading
    // cannot hold off `destroy`.
    let failure: Option<io::Error> = loop {
        let flushing = !write_closed && (!pending.is_empty() || end_requested);
        tokio::select! {
            res = reader.read_buf(&mut buf), if read_open => match res {
                Ok(0) => {
                    read_open = false;
                    shared.events.emit(SocketEvent::End);
                    if write_closed {
                        break None;
                    }
                }
                Ok(_) => {
                    if let Some(d) = timeout {
                        timer.as_mut().reset(Instant::now() + d);
                        timer_armed = true;
                    }
                    shared.events.emit(SocketEvent::Data(buf.split().freeze()));
                    buf.reserve(READ_CHUNK);
                }
                Err(e) => break Some(e),
            },
            res = flush_step(&mut writer, pending.front()), if flushing => match res {
                Ok(Flushed::Wrote(n)) => {
                    if let Some(front) = pending.front_mut() {
                        if n >= front.len() {
                            pending.pop_front();
                        } else {
                            front.advance(n);
                        }
                    }
                    let left = shared.queued.fetch_sub(n, Ordering::SeqCst) - n;
                    if let Some(d) = timeout {
                        timer.as_mut().reset(Instant::now() + d);
                        timer_armed = true;
                    }
                    if left == 0 && std::mem::take(&mut shared.status().needs_drain) {
                        shared.events.emit(SocketEvent::Drain);
                    }
                }
                Ok(Flushed::ShutDown) => {
                    write_closed = true;
                    if !read_open {
                        break None;
                    }
                }
                Err(e) => break Some(e),
            },
            cmd = commands.recv() => match cmd {
                Some(Command::Write(data)) => pending.push_back(data),
                Some(Command::End) => end_requested = true,
                Some(Command::Destroy(error)) => break error,
                Some(Command::SetTimeout(d)) => {
                    timeout = d;
                    match d {
                        Some(d) => {
                            timer.as_mut().reset(Instant::now() + d);
                            timer_armed = true;
                        }
                        None => timer_armed = false,
                    }
                }
                None => break None,
            },
            _ = &mut timer, if timer_armed => {
                timer_armed = false;
                tracing::trace!(connection_id = %shared.id, "Socket timeout");
                shared.events.emit(SocketEvent::Timeout);
            }
        }
    };

    let dropped: usize = pending.iter().map(Bytes::len).sum();
    if dropped > 0 {
        shared.queued.fetch_sub(dropped, Ordering::SeqCst);
        tracing::trace!(connection_id = %shared.id, bytes = dropped, "Queued writes dropped");
    }
    {
        let mut status = shared.status();
        status.closed = true;
        status.destroyed = true;
    }
    drop(writer);
    drop(reader);
    drop(permit);

    let had_error = failure.is_some();
    if let Some(e) = failure {
        tracing::debug!(connection_id = %shared.id, error = %e, "Socket error");
        shared.events.emit(SocketEvent::Error(Arc::new(e)));
    }
    tracing::trace!(connection_id = %shared.id, had_error, "Socket closed");
    shared.events.emit(SocketEvent::Close { had_error });
}
