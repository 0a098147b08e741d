//! HTTP/1.1 server.
//!
//! # Responsibilities
//! - Ask the transport for a listener and run the accept loop
//! - Track every open connection until its socket reports `Close`
//! - Buffer bytes per connection until a request head parses
//! - Pair each request with a `ServerResponse` and emit `Request`
//! - Surface malformed input as `ClientError`, leaving the socket open
//! - Drive the headers, idle and keep-alive timers
//!
//! # Design Decisions
//! - One task per connection owns that connection's parse buffer
//! - A connection is removed from the set only by its own close handling
//! - One message per connection; bytes beyond it are discarded

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::future::pending;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Instant};

use crate::config::ServerConfig;
use crate::events::Emitter;
use crate::http::codec::{parse_message_head, parse_request_line};
use crate::http::error::{HttpError, InvalidState, TimeoutKind};
use crate::http::incoming::IncomingMessage;
use crate::http::outgoing::OutgoingEvent;
use crate::http::response::ServerResponse;
use crate::net::{Acceptor, ConnectionId, Socket, SocketEvent, SocketEvents, Transport};
use crate::observability::metrics::{self, Side};

/// Notifications from a server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The listener is bound.
    Listening(SocketAddr),
    /// A socket joined the connection set.
    Connection(Socket),
    /// A complete request head arrived. Body bytes already received are
    /// buffered in the message.
    Request(IncomingMessage, ServerResponse),
    /// Malformed input or a socket failure on one connection.
    ClientError { error: HttpError, socket: Socket },
    /// A timer expired; the connection is left open.
    Timeout { socket: Socket, kind: TimeoutKind },
    /// The listener could not be created or failed.
    Error(HttpError),
    /// The server closed.
    Close,
}

/// Primary notification stream of a server.
pub type ServerEvents = mpsc::UnboundedReceiver<ServerEvent>;

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    NotListening,
    Listening,
    Closed,
}

#[derive(Debug)]
struct Phase {
    state: ServerState,
    listen_pending: bool,
    local_addr: Option<SocketAddr>,
    stop: Option<oneshot::Sender<()>>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    config: ServerConfig,
    phase: Mutex<Phase>,
    connections: Mutex<HashMap<ConnectionId, Socket>>,
    events: Emitter<ServerEvent>,
}

impl Shared {
    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Socket>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// HTTP/1.1 server. Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    /// Create a server and its primary notification stream.
    pub fn new(transport: Arc<dyn Transport>, config: ServerConfig) -> (Self, ServerEvents) {
        let shared = Arc::new(Shared {
            transport,
            config,
            phase: Mutex::new(Phase {
                state: ServerState::NotListening,
                listen_pending: false,
                local_addr: None,
                stop: None,
            }),
            connections: Mutex::new(HashMap::new()),
            events: Emitter::new(),
        });
        let events = shared.events.subscribe();
        (Self { shared }, events)
    }

    pub fn subscribe(&self) -> ServerEvents {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ServerState {
        self.shared.phase().state
    }

    /// Bound address once `Listening` has been reported.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.phase().local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections().len()
    }

    /// Request a listener on `host:port`.
    ///
    /// Binding happens on a spawned task; the outcome arrives as `Listening`
    /// or `Error`. Listening twice, or after `close`, fails immediately.
    pub fn listen(&self, port: u16, host: &str, backlog: u32) -> Result<(), HttpError> {
        {
            let mut phase = self.shared.phase();
            match phase.state {
                ServerState::Closed => return Err(InvalidState::ServerClosed.into()),
                ServerState::Listening => return Err(InvalidState::AlreadyListening.into()),
                ServerState::NotListening if phase.listen_pending => {
                    return Err(InvalidState::AlreadyListening.into());
                }
                ServerState::NotListening => phase.listen_pending = true,
            }
        }

        let bind = self.shared.transport.listen(host, port, backlog);
        let shared = Arc::clone(&self.shared);
        let host = host.to_string();

        tokio::spawn(async move {
            let acceptor = match bind.await {
                Ok(acceptor) => acceptor,
                Err(e) => {
                    shared.phase().listen_pending = false;
                    tracing::warn!(host = %host, port, error = %e, "Listen failed");
                    shared.events.emit(ServerEvent::Error(e.into()));
                    return;
                }
            };

            let addr = acceptor.local_addr();
            let (stop_tx, stop_rx) = oneshot::channel();
            {
                let mut phase = shared.phase();
                phase.listen_pending = false;
                if phase.state == ServerState::Closed {
                    return;
                }
                phase.state = ServerState::Listening;
                phase.local_addr = Some(addr);
                phase.stop = Some(stop_tx);
            }

            tracing::info!(address = %addr, "HTTP server listening");
            shared.events.emit(ServerEvent::Listening(addr));
            accept_loop(Server { shared }, acceptor, stop_rx).await;
        });
        Ok(())
    }

    /// Serve an already connected socket as if the listener had accepted it.
    pub fn accept_connection(&self, socket: Socket, events: SocketEvents) {
        {
            // Lock order is phase then connections, matching `close`.
            let phase = self.shared.phase();
            if phase.state == ServerState::Closed {
                drop(phase);
                tracing::debug!(connection_id = %socket.id(), "Server closed; dropping connection");
                socket.destroy(None);
                return;
            }
            self.shared.connections().insert(socket.id(), socket.clone());
        }
        metrics::inc_connections();
        tracing::debug!(
            connection_id = %socket.id(),
            peer_addr = ?socket.peer_addr(),
            "Connection accepted"
        );
        self.shared.events.emit(ServerEvent::Connection(socket.clone()));
        tokio::spawn(serve_connection(Arc::clone(&self.shared), socket, events));
    }

    /// Stop listening and destroy every open connection. Idempotent.
    pub fn close(&self) {
        let (stop, sockets) = {
            let mut phase = self.shared.phase();
            if phase.state == ServerState::Closed {
                return;
            }
            phase.state = ServerState::Closed;
            let sockets: Vec<Socket> = self.shared.connections().values().cloned().collect();
            (phase.stop.take(), sockets)
        };
        if let Some(stop) = stop {
            let _ = stop.send(());
        }

        tracing::info!(connections = sockets.len(), "HTTP server closing");
        for socket in sockets {
            socket.destroy(None);
        }
        self.shared.events.emit(ServerEvent::Close);
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = self.shared.phase();
        f.debug_struct("Server")
            .field("state", &phase.state)
            .field("local_addr", &phase.local_addr)
            .finish()
    }
}

async fn accept_loop(
    server: Server,
    mut acceptor: Box<dyn Acceptor>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => break,
            accepted = acceptor.accept() => match accepted {
                Ok(accepted) => server.accept_connection(accepted.socket, accepted.events),
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    if server.state() == ServerState::Closed {
                        break;
                    }
                    sleep(Duration::from_millis(10)).await;
                }
            },
        }
    }
    tracing::debug!(address = %acceptor.local_addr(), "Listener released");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnPhase {
    AwaitingHead,
    Body,
    Responded,
    Errored,
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

async fn wait_finish(rx: &mut Option<oneshot::Receiver<OutgoingEvent>>) {
    match rx {
        Some(rx) => {
            let _ = rx.await;
        }
        None => pending().await,
    }
}

async fn serve_connection(shared: Arc<Shared>, socket: Socket, mut events: SocketEvents) {
    let config = &shared.config;
    if let Some(idle) = millis(config.idle_timeout_ms) {
        socket.set_timeout(Some(idle));
    }

    let mut buf = BytesMut::new();
    let mut phase = ConnPhase::AwaitingHead;
    let mut current: Option<(IncomingMessage, ServerResponse)> = None;
    let mut finish: Option<oneshot::Receiver<OutgoingEvent>> = None;

    let headers_timer = sleep(Duration::ZERO);
    tokio::pin!(headers_timer);
    let mut headers_armed = false;
    if let Some(d) = millis(config.headers_timeout_ms) {
        headers_timer.as_mut().reset(Instant::now() + d);
        headers_armed = true;
    }

    let linger = sleep(Duration::ZERO);
    tokio::pin!(linger);
    let mut linger_armed = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Some(event) => event,
                    None => break,
                };
                match event {
                    SocketEvent::Data(data) => match phase {
                        ConnPhase::AwaitingHead => {
                            buf.extend_from_slice(&data);
                            match start_request(&shared, &socket, &mut buf) {
                                Ok(Some((req, res, finished))) => {
                                    headers_armed = false;
                                    phase = ConnPhase::Body;
                                    finish = Some(finished);
                                    current = Some((req, res));
                                }
                                Ok(None) => {}
                                Err(error) => {
                                    headers_armed = false;
                                    phase = ConnPhase::Errored;
                                    buf.clear();
                                    client_error(&shared, &socket, error);
                                }
                            }
                        }
                        ConnPhase::Body | ConnPhase::Responded => {
                            if let Some((req, _)) = &current {
                                let surplus = req.push(data);
                                if !surplus.is_empty() {
                                    tracing::trace!(
                                        connection_id = %socket.id(),
                                        bytes = surplus.len(),
                                        "Discarding bytes after message"
                                    );
                                }
                            }
                        }
                        ConnPhase::Errored => {}
                    },
                    SocketEvent::End => match phase {
                        ConnPhase::Body => {
                            if let Some((req, _)) = &current {
                                req.abort();
                            }
                        }
                        ConnPhase::AwaitingHead | ConnPhase::Errored => {
                            if phase == ConnPhase::AwaitingHead {
                                socket.end();
                            }
                        }
                        ConnPhase::Responded => {}
                    },
                    SocketEvent::Drain => {
                        if let Some((_, res)) = &current {
                            res.notify_drain();
                        }
                    }
                    SocketEvent::Timeout => {
                        tracing::debug!(connection_id = %socket.id(), "Connection idle");
                        shared.events.emit(ServerEvent::Timeout {
                            socket: socket.clone(),
                            kind: TimeoutKind::Idle,
                        });
                    }
                    SocketEvent::Error(e) => {
                        if phase != ConnPhase::Responded {
                            shared.events.emit(ServerEvent::ClientError {
                                error: HttpError::Connection(e),
                                socket: socket.clone(),
                            });
                        }
                    }
                    SocketEvent::Close { had_error } => {
                        if let Some((req, res)) = &current {
                            req.finish_on_close();
                            res.notify_close();
                        }
                        tracing::debug!(connection_id = %socket.id(), had_error, "Connection closed");
                        break;
                    }
                }
            }
            _ = &mut headers_timer, if headers_armed => {
                headers_armed = false;
                tracing::debug!(connection_id = %socket.id(), "Request head timed out");
                shared.events.emit(ServerEvent::Timeout {
                    socket: socket.clone(),
                    kind: TimeoutKind::Headers,
                });
            }
            _ = wait_finish(&mut finish) => {
                finish = None;
                if phase == ConnPhase::Body {
                    phase = ConnPhase::Responded;
                }
                if let Some(d) = millis(config.keep_alive_timeout_ms) {
                    linger.as_mut().reset(Instant::now() + d);
                    linger_armed = true;
                }
            }
            _ = &mut linger, if linger_armed => {
                linger_armed = false;
                tracing::trace!(connection_id = %socket.id(), "Keep-alive window elapsed");
                socket.destroy(None);
            }
        }
    }

    shared.connections().remove(&socket.id());
    metrics::dec_connections();
}

type Started = (IncomingMessage, ServerResponse, oneshot::Receiver<OutgoingEvent>);

/// Try to turn buffered bytes into a request. On success the remainder is
/// pushed as body and `Request` is emitted.
fn start_request(
    shared: &Shared,
    socket: &Socket,
    buf: &mut BytesMut,
) -> Result<Option<Started>, HttpError> {
    let head = match parse_message_head(buf, &shared.config.limits)? {
        Some(head) => head,
        None => return Ok(None),
    };
    let line = parse_request_line(&head.start_line)?;
    let remainder: Bytes = buf.split_off(head.len).freeze();
    buf.clear();

    let req = IncomingMessage::request(line, head.headers, socket.clone())?;
    let res = ServerResponse::new(req.clone());
    let finished = res.on_finish();

    let surplus = req.push(remainder);
    if !surplus.is_empty() {
        tracing::trace!(
            connection_id = %socket.id(),
            bytes = surplus.len(),
            "Discarding bytes after message"
        );
    }

    metrics::record_request(req.method().unwrap_or_default());
    tracing::debug!(
        connection_id = %socket.id(),
        method = req.method().unwrap_or_default(),
        url = req.url().unwrap_or_default(),
        "Request received"
    );
    shared
        .events
        .emit(ServerEvent::Request(req.clone(), res.clone()));
    Ok(Some((req, res, finished)))
}

fn client_error(shared: &Shared, socket: &Socket, error: HttpError) {
    metrics::record_parse_error(Side::Server);
    tracing::debug!(connection_id = %socket.id(), error = %error, "Client error");
    shared.events.emit(ServerEvent::ClientError {
        error,
        socket: socket.clone(),
    });
}
