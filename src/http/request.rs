//! Client-side request writer and response reader.
//!
//! # Lifecycle
//! ```text
//! Unconnected → Connecting → Connected → AwaitingResponse
//!     → ResponseReceived → Finished
//! (any state) → Aborted
//! ```
//!
//! # Responsibilities
//! - Obtain a socket from the agent on a spawned task
//! - Write the head on connect, then any body buffered before it
//! - Parse the response head (skipping 1xx) and feed the body
//! - Return the socket to the agent when the exchange allows reuse

use bytes::{Bytes, BytesMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::agent::{Agent, AgentKey, Lease};
use crate::config::ParseLimits;
use crate::events::Emitter;
use crate::http::codec::{parse_message_head, parse_status_line, serialize_head, Head};
use crate::http::error::{HttpError, InvalidState, TimeoutKind};
use crate::http::headers::HeaderValue;
use crate::http::incoming::{BodyReadable, IncomingMessage};
use crate::http::method::Method;
use crate::http::outgoing::{HeaderWritable, OutgoingMessage};
use crate::net::{Protocol, Socket, SocketEvent};
use crate::observability::metrics::{self, Side};

/// Where and how to send a request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub protocol: Protocol,
    pub headers: Vec<(String, String)>,
    /// Socket inactivity window before a `Timeout` notification.
    pub timeout: Option<Duration>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::Get.as_str().to_string(),
            host: "localhost".to_string(),
            port: Protocol::Http.default_port(),
            path: "/".to_string(),
            protocol: Protocol::Http,
            headers: Vec::new(),
            timeout: None,
        }
    }
}

impl RequestOptions {
    /// Options targeting an absolute `http:`/`https:` URL.
    pub fn from_url(input: &str) -> Result<Self, HttpError> {
        let invalid = |reason: &str| HttpError::InvalidUrl {
            url: input.to_string(),
            reason: reason.to_string(),
        };

        let url = url::Url::parse(input).map_err(|e| invalid(&e.to_string()))?;
        let protocol: Protocol = url
            .scheme()
            .parse()
            .map_err(|_| invalid("scheme must be http or https"))?;
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = url.port().unwrap_or_else(|| protocol.default_port());
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        Ok(Self {
            host: host.to_string(),
            port,
            path,
            protocol,
            ..Self::default()
        })
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method.as_str().to_string();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn key(&self) -> AgentKey {
        AgentKey::new(self.host.clone(), self.port, self.protocol)
    }
}

/// Progress of a client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Unconnected,
    Connecting,
    Connected,
    AwaitingResponse,
    ResponseReceived,
    Finished,
    Aborted,
}

/// Notifications from a client request.
#[derive(Debug, Clone)]
pub enum RequestEvent {
    /// A socket was assigned.
    Socket(Socket),
    Connect,
    /// An interim 1xx response was received and skipped.
    Information { status_code: u16 },
    /// The final response head arrived.
    Response(IncomingMessage),
    /// The socket timeout expired; the request is left running.
    Timeout,
    Abort,
    Error(HttpError),
    /// The request was fully handed to the socket.
    Finish,
    Drain,
    Close,
}

/// Primary notification stream of a client request.
pub type RequestEvents = mpsc::UnboundedReceiver<RequestEvent>;

#[derive(Debug)]
struct RequestInner {
    outgoing: OutgoingMessage,
    state: RequestState,
    socket: Option<Socket>,
    pending: Vec<Bytes>,
    timeout: Option<Duration>,
    aborted: bool,
    response: Option<IncomingMessage>,
}

struct Shared {
    limits: ParseLimits,
    method: String,
    path: String,
    key: AgentKey,
    inner: Mutex<RequestInner>,
    events: Emitter<RequestEvent>,
    abort: watch::Sender<bool>,
}

impl Shared {
    fn inner(&self) -> MutexGuard<'_, RequestInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: RequestEvent) {
        self.events.emit(event);
    }
}

/// An outgoing request. Cloning yields another handle to the same request.
#[derive(Clone)]
pub struct ClientRequest {
    shared: Arc<Shared>,
}

impl ClientRequest {
    /// Create the request and start connecting through `agent`.
    pub fn new(agent: &Agent, options: RequestOptions) -> Result<(Self, RequestEvents), HttpError> {
        let mut outgoing = OutgoingMessage::new();
        for (name, value) in &options.headers {
            outgoing.set_header(name, HeaderValue::from(value.as_str()))?;
        }

        let (abort, abort_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            limits: agent.config().limits,
            key: options.key(),
            method: options.method,
            path: options.path,
            inner: Mutex::new(RequestInner {
                outgoing,
                state: RequestState::Connecting,
                socket: None,
                pending: Vec::new(),
                timeout: options.timeout,
                aborted: false,
                response: None,
            }),
            events: Emitter::new(),
            abort,
        });
        let events = shared.events.subscribe();

        tracing::debug!(
            method = %shared.method,
            key = %shared.key,
            path = %shared.path,
            "Client request created"
        );
        tokio::spawn(run(Arc::clone(&shared), agent.clone(), abort_rx));
        Ok((Self { shared }, events))
    }

    pub fn subscribe(&self) -> RequestEvents {
        self.shared.events.subscribe()
    }

    pub fn method(&self) -> &str {
        &self.shared.method
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn key(&self) -> &AgentKey {
        &self.shared.key
    }

    pub fn state(&self) -> RequestState {
        self.shared.inner().state
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.inner().aborted
    }

    pub fn socket(&self) -> Option<Socket> {
        self.shared.inner().socket.clone()
    }

    /// The response, once its head has arrived.
    pub fn response(&self) -> Option<IncomingMessage> {
        self.shared.inner().response.clone()
    }

    /// Write a body chunk.
    ///
    /// Returns `Ok(false)` while no socket exists (the chunk is buffered and
    /// sent on connect) or when the socket reports back-pressure.
    pub fn write(&self, chunk: impl Into<Bytes>) -> Result<bool, HttpError> {
        let chunk = chunk.into();
        let mut inner = self.shared.inner();
        if inner.outgoing.finished {
            return Err(InvalidState::WriteAfterEnd.into());
        }
        if inner.aborted {
            return Ok(false);
        }
        match &inner.socket {
            Some(socket) => Ok(chunk.is_empty() || socket.write(chunk)),
            None => {
                if !chunk.is_empty() {
                    inner.pending.push(chunk);
                }
                Ok(false)
            }
        }
    }

    /// Finish sending the request. A second call, or a call after the
    /// exchange closed, is a no-op.
    pub fn end(&self) {
        let mut inner = self.shared.inner();
        if inner.outgoing.finished || inner.aborted {
            return;
        }
        inner.outgoing.finished = true;
        if inner.socket.is_none() {
            return;
        }
        match inner.state {
            RequestState::Connected => inner.state = RequestState::AwaitingResponse,
            RequestState::ResponseReceived => {}
            // The exchange already closed; nothing is left to hand over.
            _ => return,
        }
        drop(inner);
        self.shared.emit(RequestEvent::Finish);
    }

    /// Write `chunk` and finish sending the request.
    pub fn end_with(&self, chunk: impl Into<Bytes>) -> Result<(), HttpError> {
        {
            let inner = self.shared.inner();
            if inner.outgoing.finished {
                return Err(InvalidState::WriteAfterEnd.into());
            }
        }
        self.write(chunk)?;
        self.end();
        Ok(())
    }

    /// Cut the request short. Idempotent.
    pub fn abort(&self) {
        let socket = {
            let mut inner = self.shared.inner();
            if inner.aborted {
                return;
            }
            inner.aborted = true;
            inner.state = RequestState::Aborted;
            inner.socket.clone()
        };
        self.shared.abort.send_replace(true);
        if let Some(socket) = socket {
            socket.destroy(None);
        }
        tracing::debug!(key = %self.shared.key, "Client request aborted");
        self.shared.emit(RequestEvent::Abort);
    }

    /// Arm the socket inactivity timer. Expiry emits `Timeout` only.
    pub fn set_timeout(&self, timeout: Duration) {
        let mut inner = self.shared.inner();
        inner.timeout = Some(timeout);
        if let Some(socket) = &inner.socket {
            socket.set_timeout(Some(timeout));
        }
    }
}

impl HeaderWritable for ClientRequest {
    fn with_outgoing<R>(&self, f: impl FnOnce(&mut OutgoingMessage) -> R) -> R {
        f(&mut self.shared.inner().outgoing)
    }
}

impl std::fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRequest")
            .field("method", &self.shared.method)
            .field("key", &self.shared.key)
            .field("path", &self.shared.path)
            .field("state", &self.state())
            .finish()
    }
}

async fn wait_abort(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|aborted| *aborted).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn run(shared: Arc<Shared>, agent: Agent, mut abort: watch::Receiver<bool>) {
    let connected = tokio::select! {
        _ = wait_abort(&mut abort) => None,
        lease = agent.get_connection(&shared.key) => Some(lease),
    };

    let mut lease = match connected {
        None => {
            shared.emit(RequestEvent::Close);
            return;
        }
        Some(Err(error)) => {
            tracing::debug!(key = %shared.key, error = %error, "Client connect failed");
            let aborted = {
                let mut inner = shared.inner();
                if !inner.aborted {
                    inner.state = RequestState::Aborted;
                }
                inner.aborted
            };
            if !aborted {
                shared.emit(RequestEvent::Error(error));
            }
            shared.emit(RequestEvent::Close);
            return;
        }
        Some(Ok(lease)) => lease,
    };

    if !attach_socket(&shared, &lease) {
        drop(lease);
        shared.emit(RequestEvent::Close);
        return;
    }

    let outcome = read_response(&shared, &mut lease, &mut abort).await;
    finish_exchange(&shared, &agent, lease, outcome);
}

/// Bind the socket, write the head and any buffered body.
///
/// Returns `false` when the request was aborted while connecting.
fn attach_socket(shared: &Shared, lease: &Lease) -> bool {
    let socket = lease.socket().clone();
    let mut inner = shared.inner();
    if inner.aborted {
        return false;
    }

    inner.socket = Some(socket.clone());
    inner.state = RequestState::Connected;
    // A reused socket may still carry the previous request's timer.
    socket.set_timeout(inner.timeout);
    shared.emit(RequestEvent::Socket(socket.clone()));
    shared.emit(RequestEvent::Connect);

    let body_len: usize = inner.pending.iter().map(Bytes::len).sum();
    if inner.outgoing.finished && body_len > 0 && !inner.outgoing.has_framing_header() {
        inner.outgoing.headers.set("content-length", body_len.into());
    }
    let head = serialize_head(
        &Head::Request {
            method: &shared.method,
            path: &shared.path,
            host: &shared.key.host,
            port: shared.key.port,
            protocol: shared.key.protocol,
        },
        &inner.outgoing.headers,
    );
    inner.outgoing.headers_sent = true;
    socket.write(head);
    for chunk in inner.pending.drain(..) {
        socket.write(chunk);
    }

    tracing::trace!(
        connection_id = %socket.id(),
        reused = lease.is_reused(),
        "Request head written"
    );
    if inner.outgoing.finished {
        inner.state = RequestState::AwaitingResponse;
        shared.emit(RequestEvent::Finish);
    }
    true
}

#[derive(Debug)]
enum Outcome {
    /// The response completed; `surplus` is true if bytes followed it.
    Complete { surplus: bool },
    /// The socket went away or the response could not be read.
    Broken,
    Aborted,
}

async fn read_response(
    shared: &Shared,
    lease: &mut Lease,
    abort: &mut watch::Receiver<bool>,
) -> Outcome {
    let socket = lease.socket().clone();
    let mut buf = BytesMut::new();
    let mut response: Option<IncomingMessage> = None;
    let mut surplus = false;
    let mut errored = false;

    loop {
        let event = tokio::select! {
            _ = wait_abort(abort) => {
                if let Some(msg) = &response {
                    msg.abort();
                }
                return Outcome::Aborted;
            }
            event = lease.events().recv() => event,
        };

        match event {
            Some(SocketEvent::Data(data)) => {
                match &response {
                    Some(msg) => surplus |= !msg.push(data).is_empty(),
                    None => {
                        buf.extend_from_slice(&data);
                        match parse_response(shared, &socket, &mut buf) {
                            Ok(Some((msg, rest))) => {
                                surplus |= !msg.push(rest).is_empty();
                                response = Some(msg);
                            }
                            Ok(None) => {}
                            Err(error) => {
                                metrics::record_parse_error(Side::Client);
                                tracing::debug!(connection_id = %socket.id(), error = %error, "Response parse failed");
                                shared.emit(RequestEvent::Error(error));
                                socket.destroy(None);
                                return Outcome::Broken;
                            }
                        }
                    }
                }
                if let Some(msg) = &response {
                    if msg.is_complete() {
                        return Outcome::Complete { surplus };
                    }
                }
            }
            Some(SocketEvent::End) => {
                match &response {
                    Some(msg) => {
                        msg.finish_on_close();
                        if msg.is_complete() {
                            return Outcome::Complete { surplus: true };
                        }
                    }
                    None => {
                        if !errored {
                            shared.emit(RequestEvent::Error(HttpError::SocketHangUp));
                        }
                    }
                }
                socket.destroy(None);
                return Outcome::Broken;
            }
            Some(SocketEvent::Drain) => shared.emit(RequestEvent::Drain),
            Some(SocketEvent::Timeout) => {
                tracing::debug!(
                    connection_id = %socket.id(),
                    kind = %TimeoutKind::Request,
                    "Client request timed out"
                );
                shared.emit(RequestEvent::Timeout);
            }
            Some(SocketEvent::Error(e)) => {
                if response.is_none() && !errored {
                    errored = true;
                    shared.emit(RequestEvent::Error(HttpError::Connection(e)));
                }
            }
            Some(SocketEvent::Close { .. }) | None => {
                match &response {
                    Some(msg) => msg.finish_on_close(),
                    None => {
                        if !errored {
                            shared.emit(RequestEvent::Error(HttpError::SocketHangUp));
                        }
                    }
                }
                return Outcome::Broken;
            }
        }
    }
}

/// Parse buffered bytes into the final response, skipping interim heads.
fn parse_response(
    shared: &Shared,
    socket: &Socket,
    buf: &mut BytesMut,
) -> Result<Option<(IncomingMessage, Bytes)>, HttpError> {
    loop {
        let head = match parse_message_head(buf, &shared.limits)? {
            Some(head) => head,
            None => return Ok(None),
        };
        let line = parse_status_line(&head.start_line)?;
        let _ = buf.split_to(head.len);

        if (100..200).contains(&line.status_code) && line.status_code != 101 {
            tracing::trace!(status = line.status_code, "Interim response skipped");
            shared.emit(RequestEvent::Information {
                status_code: line.status_code,
            });
            continue;
        }

        let msg = IncomingMessage::response(line, head.headers, socket.clone(), &shared.method)?;
        let rest = buf.split().freeze();
        {
            let mut inner = shared.inner();
            if !inner.aborted {
                inner.state = RequestState::ResponseReceived;
            }
            inner.response = Some(msg.clone());
        }
        tracing::debug!(
            connection_id = %socket.id(),
            status = msg.status_code().unwrap_or_default(),
            "Response received"
        );
        shared.emit(RequestEvent::Response(msg.clone()));
        return Ok(Some((msg, rest)));
    }
}

fn finish_exchange(shared: &Shared, agent: &Agent, lease: Lease, outcome: Outcome) {
    let (finished, response) = {
        let inner = shared.inner();
        (inner.outgoing.finished, inner.response.clone())
    };

    match outcome {
        Outcome::Complete { surplus } => {
            let close_requested = response.as_ref().is_some_and(|msg| {
                msg.headers()
                    .get("connection")
                    .is_some_and(|v| v.values().any(|v| v.eq_ignore_ascii_case("close")))
            });
            let delimited = response.as_ref().is_some_and(IncomingMessage::is_length_delimited);
            let reusable =
                agent.keep_alive() && delimited && !close_requested && !surplus && finished;

            if reusable {
                agent.release(lease);
            } else {
                lease.socket().destroy(None);
                drop(lease);
                if let Some(msg) = &response {
                    msg.finish_on_close();
                }
            }
            tracing::debug!(key = %shared.key, reused_socket = reusable, "Client exchange complete");
        }
        Outcome::Broken | Outcome::Aborted => drop(lease),
    }

    {
        let mut inner = shared.inner();
        if !inner.aborted {
            inner.state = RequestState::Finished;
        }
    }
    shared.emit(RequestEvent::Close);
}
