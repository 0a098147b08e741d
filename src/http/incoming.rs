//! Received messages: a parsed head plus a readable body.
//!
//! The same type represents a request on the server side and a response on
//! the client side. The owner of the socket feeds body bytes in with
//! [`IncomingMessage::push`]; consumers pull them out through
//! [`BodyReadable`].
//!
//! # Body framing
//! - `content-length` present: exactly that many bytes
//! - requests without it: no body
//! - responses to `HEAD`, and 1xx/204/304 responses: no body
//! - any other response: everything until the socket closes

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, Notify};

use crate::events::Emitter;
use crate::http::codec::{RequestLine, StatusLine};
use crate::http::error::{HttpError, ParseError};
use crate::http::headers::{HeaderMap, RawHeader};
use crate::http::status;
use crate::net::Socket;

/// How the end of a body is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// Exactly this many bytes follow the head.
    Exact(u64),
    /// The body ends when the connection closes.
    UntilClose,
    /// No body.
    Empty,
}

/// Notifications from an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageEvent {
    /// The whole body has been received.
    End,
    /// The connection went away before the body completed.
    Aborted,
    /// The underlying connection closed.
    Close,
}

/// Start-line data distinguishing requests from responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Request { method: String, url: String },
    Response { status_code: u16, reason: String },
}

/// Pull-based body access.
pub trait BodyReadable: Send + Sync {
    /// Next body chunk, or `None` once the body is complete or aborted.
    fn chunk(&self) -> impl Future<Output = Option<Bytes>> + Send;

    fn is_complete(&self) -> bool;

    fn is_aborted(&self) -> bool;

    /// Collect the remaining body.
    fn read_to_end(&self) -> impl Future<Output = Result<Bytes, HttpError>> + Send {
        async move {
            let mut body = BytesMut::new();
            while let Some(chunk) = self.chunk().await {
                body.extend_from_slice(&chunk);
            }
            if self.is_aborted() {
                return Err(HttpError::Aborted);
            }
            Ok(body.freeze())
        }
    }
}

#[derive(Debug, Default)]
struct BodyState {
    chunks: VecDeque<Bytes>,
    received: u64,
    complete: bool,
    aborted: bool,
    destroyed: bool,
    closed: bool,
}

struct Inner {
    version: String,
    kind: MessageKind,
    headers: HeaderMap,
    raw_headers: Vec<RawHeader>,
    trailers: HeaderMap,
    length: BodyLength,
    socket: Socket,
    body: Mutex<BodyState>,
    readable: Notify,
    events: Emitter<MessageEvent>,
}

/// A received request or response. Cloning yields another handle to the
/// same message.
#[derive(Clone)]
pub struct IncomingMessage {
    inner: Arc<Inner>,
}

impl IncomingMessage {
    /// Build a server-side request from its parsed head.
    pub fn request(
        line: RequestLine,
        raw_headers: Vec<RawHeader>,
        socket: Socket,
    ) -> Result<Self, ParseError> {
        let headers = HeaderMap::fold(&raw_headers);
        let length = match content_length(&headers)? {
            Some(n) => BodyLength::Exact(n),
            None => BodyLength::Empty,
        };
        Ok(Self::build(
            line.version,
            MessageKind::Request {
                method: line.method,
                url: line.target,
            },
            headers,
            raw_headers,
            length,
            socket,
        ))
    }

    /// Build a client-side response from its parsed head.
    ///
    /// `request_method` decides whether a body can follow at all.
    pub fn response(
        line: StatusLine,
        raw_headers: Vec<RawHeader>,
        socket: Socket,
        request_method: &str,
    ) -> Result<Self, ParseError> {
        let headers = HeaderMap::fold(&raw_headers);
        let length = if request_method.eq_ignore_ascii_case("HEAD")
            || status::is_bodyless(line.status_code)
        {
            BodyLength::Empty
        } else {
            match content_length(&headers)? {
                Some(n) => BodyLength::Exact(n),
                None => BodyLength::UntilClose,
            }
        };
        Ok(Self::build(
            line.version,
            MessageKind::Response {
                status_code: line.status_code,
                reason: line.reason,
            },
            headers,
            raw_headers,
            length,
            socket,
        ))
    }

    fn build(
        version: String,
        kind: MessageKind,
        headers: HeaderMap,
        raw_headers: Vec<RawHeader>,
        length: BodyLength,
        socket: Socket,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                version,
                kind,
                headers,
                raw_headers,
                trailers: HeaderMap::default(),
                length,
                socket,
                body: Mutex::new(BodyState::default()),
                readable: Notify::new(),
                events: Emitter::new(),
            }),
        }
    }

    /// Protocol version digits, e.g. `1.1`.
    pub fn http_version(&self) -> &str {
        &self.inner.version
    }

    pub fn kind(&self) -> &MessageKind {
        &self.inner.kind
    }

    pub fn method(&self) -> Option<&str> {
        match &self.inner.kind {
            MessageKind::Request { method, .. } => Some(method),
            MessageKind::Response { .. } => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match &self.inner.kind {
            MessageKind::Request { url, .. } => Some(url),
            MessageKind::Response { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.inner.kind {
            MessageKind::Response { status_code, .. } => Some(*status_code),
            MessageKind::Request { .. } => None,
        }
    }

    pub fn status_message(&self) -> Option<&str> {
        match &self.inner.kind {
            MessageKind::Response { reason, .. } => Some(reason),
            MessageKind::Request { .. } => None,
        }
    }

    /// Headers folded by lower-cased name.
    pub fn headers(&self) -> &HeaderMap {
        &self.inner.headers
    }

    /// Header lines exactly as received.
    pub fn raw_headers(&self) -> &[RawHeader] {
        &self.inner.raw_headers
    }

    /// Always empty; chunked transfer coding is not decoded.
    pub fn trailers(&self) -> &HeaderMap {
        &self.inner.trailers
    }

    pub fn body_length(&self) -> BodyLength {
        self.inner.length
    }

    /// Whether the body end is known without waiting for close.
    pub fn is_length_delimited(&self) -> bool {
        !matches!(self.inner.length, BodyLength::UntilClose)
    }

    pub fn socket(&self) -> &Socket {
        &self.inner.socket
    }

    pub fn is_destroyed(&self) -> bool {
        self.state().destroyed
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MessageEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves with `End`, `Aborted` or `Close`, whichever comes first.
    pub fn on_end(&self) -> oneshot::Receiver<MessageEvent> {
        self.inner.events.once()
    }

    /// Body chunks received but not yet pulled.
    pub fn buffered_body(&self) -> Bytes {
        let state = self.state();
        let mut out = BytesMut::new();
        for chunk in &state.chunks {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }

    /// Feed bytes read from the socket. Returns the bytes beyond the body.
    pub fn push(&self, mut data: Bytes) -> Bytes {
        let mut state = self.state();
        if state.complete || state.aborted || state.destroyed {
            return data;
        }

        let surplus = match self.inner.length {
            BodyLength::Empty => {
                state.complete = true;
                data
            }
            BodyLength::UntilClose => {
                if !data.is_empty() {
                    state.received += data.len() as u64;
                    state.chunks.push_back(data);
                }
                Bytes::new()
            }
            BodyLength::Exact(total) => {
                let wanted = (total - state.received).min(data.len() as u64) as usize;
                let body = data.split_to(wanted);
                if !body.is_empty() {
                    state.received += body.len() as u64;
                    state.chunks.push_back(body);
                }
                if state.received == total {
                    state.complete = true;
                }
                data
            }
        };

        let completed = state.complete;
        drop(state);
        self.inner.readable.notify_waiters();
        if completed {
            tracing::trace!(connection_id = %self.inner.socket.id(), "Message body complete");
            self.inner.events.emit(MessageEvent::End);
        }
        surplus
    }

    /// The connection closed: complete a close-delimited body, abort an
    /// unfinished one, then report `Close`.
    pub fn finish_on_close(&self) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        state.closed = true;
        let outcome = if state.complete || state.aborted || state.destroyed {
            None
        } else if self.inner.length == BodyLength::UntilClose {
            state.complete = true;
            Some(MessageEvent::End)
        } else {
            state.aborted = true;
            Some(MessageEvent::Aborted)
        };
        let destroyed = state.destroyed;
        drop(state);

        self.inner.readable.notify_waiters();
        if destroyed {
            return;
        }
        if let Some(event) = outcome {
            self.inner.events.emit(event);
        }
        self.inner.events.emit(MessageEvent::Close);
    }

    /// Mark the body as cut short and report `Aborted`.
    pub fn abort(&self) {
        let mut state = self.state();
        if state.complete || state.aborted || state.destroyed {
            return;
        }
        state.aborted = true;
        drop(state);

        self.inner.readable.notify_waiters();
        self.inner.events.emit(MessageEvent::Aborted);
    }

    /// Stop delivering notifications and tear down the connection.
    pub fn destroy(&self) {
        {
            let mut state = self.state();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }
        self.inner.readable.notify_waiters();
        self.inner.socket.destroy(None);
    }

    fn state(&self) -> MutexGuard<'_, BodyState> {
        self.inner.body.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BodyReadable for IncomingMessage {
    fn chunk(&self) -> impl Future<Output = Option<Bytes>> + Send {
        async move {
            loop {
                let notified = self.inner.readable.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let mut state = self.state();
                    if let Some(chunk) = state.chunks.pop_front() {
                        return Some(chunk);
                    }
                    if state.complete || state.aborted || state.destroyed {
                        return None;
                    }
                }
                notified.await;
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.state().complete
    }

    fn is_aborted(&self) -> bool {
        self.state().aborted
    }
}

impl std::fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("kind", &self.inner.kind)
            .field("version", &self.inner.version)
            .field("length", &self.inner.length)
            .field("socket", &self.inner.socket)
            .finish()
    }
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ParseError> {
    let value = match headers.get("content-length") {
        Some(value) => value,
        None => return Ok(None),
    };

    let mut parsed: Option<u64> = None;
    for raw in value.values() {
        let n = raw
            .trim()
            .parse::<u64>()
            .map_err(|_| ParseError::InvalidContentLength(raw.to_string()))?;
        match parsed {
            Some(previous) if previous != n => {
                return Err(ParseError::InvalidContentLength(raw.to_string()));
            }
            _ => parsed = Some(n),
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::SocketInfo;
    use std::time::Duration;
    use tokio::io::duplex;

    fn socket() -> Socket {
        let (near, _far) = duplex(1024);
        Socket::spawn(near, SocketInfo::default()).0
    }

    fn request(headers: &[(&str, &str)]) -> IncomingMessage {
        let raw = headers.iter().map(|(n, v)| RawHeader::new(*n, *v)).collect();
        let line = RequestLine {
            method: "POST".to_string(),
            target: "/upload".to_string(),
            version: "1.1".to_string(),
        };
        IncomingMessage::request(line, raw, socket()).unwrap()
    }

    fn response(code: u16, headers: &[(&str, &str)], method: &str) -> IncomingMessage {
        let raw = headers.iter().map(|(n, v)| RawHeader::new(*n, *v)).collect();
        let line = StatusLine {
            version: "1.1".to_string(),
            status_code: code,
            reason: String::new(),
        };
        IncomingMessage::response(line, raw, socket(), method).unwrap()
    }

    #[tokio::test]
    async fn exact_body_splits_surplus_and_completes() {
        let msg = request(&[("Content-Length", "5")]);
        let mut events = msg.subscribe();

        assert_eq!(msg.push(Bytes::from_static(b"hel")), Bytes::new());
        assert!(!msg.is_complete());
        assert_eq!(msg.push(Bytes::from_static(b"loEXTRA")), Bytes::from_static(b"EXTRA"));
        assert!(msg.is_complete());
        assert_eq!(events.try_recv().unwrap(), MessageEvent::End);

        assert_eq!(msg.read_to_end().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn request_without_length_has_empty_body() {
        let msg = request(&[]);
        assert_eq!(msg.body_length(), BodyLength::Empty);
        assert_eq!(msg.push(Bytes::from_static(b"next")), Bytes::from_static(b"next"));
        assert!(msg.is_complete());
        assert!(msg.read_to_end().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chunk_waits_for_pushed_data() {
        let msg = request(&[("content-length", "4")]);
        let reader = msg.clone();
        let pending = tokio::spawn(async move { reader.chunk().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        msg.push(Bytes::from_static(b"data"));

        let chunk = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk, Some(Bytes::from_static(b"data")));
    }

    #[tokio::test]
    async fn close_before_length_is_reached_aborts() {
        let msg = request(&[("Content-Length", "10")]);
        let mut events = msg.subscribe();

        msg.push(Bytes::from_static(b"abc"));
        msg.finish_on_close();

        assert_eq!(events.try_recv().unwrap(), MessageEvent::Aborted);
        assert_eq!(events.try_recv().unwrap(), MessageEvent::Close);
        assert!(matches!(msg.read_to_end().await, Err(HttpError::Aborted)));
    }

    #[tokio::test]
    async fn close_delimited_response_completes_on_close() {
        let msg = response(200, &[], "GET");
        assert!(!msg.is_length_delimited());

        msg.push(Bytes::from_static(b"part1"));
        msg.push(Bytes::from_static(b"part2"));
        assert_eq!(msg.buffered_body(), Bytes::from_static(b"part1part2"));

        msg.finish_on_close();
        assert!(msg.is_complete());
        assert_eq!(msg.read_to_end().await.unwrap(), Bytes::from_static(b"part1part2"));
    }

    #[tokio::test]
    async fn bodyless_responses() {
        assert_eq!(
            response(200, &[("Content-Length", "10")], "HEAD").body_length(),
            BodyLength::Empty
        );
        assert_eq!(response(204, &[], "GET").body_length(), BodyLength::Empty);
        assert_eq!(response(304, &[], "GET").body_length(), BodyLength::Empty);
        assert_eq!(
            response(200, &[("content-length", "3")], "GET").body_length(),
            BodyLength::Exact(3)
        );
    }

    #[tokio::test]
    async fn conflicting_content_lengths_are_rejected() {
        let line = RequestLine {
            method: "POST".to_string(),
            target: "/".to_string(),
            version: "1.1".to_string(),
        };
        let raw = vec![
            RawHeader::new("Content-Length", "3"),
            RawHeader::new("Content-Length", "4"),
        ];
        assert!(matches!(
            IncomingMessage::request(line.clone(), raw, socket()),
            Err(ParseError::InvalidContentLength(_))
        ));

        let raw = vec![RawHeader::new("Content-Length", "abc")];
        assert!(IncomingMessage::request(line, raw, socket()).is_err());
    }

    #[tokio::test]
    async fn destroy_silences_notifications() {
        let msg = request(&[("Content-Length", "10")]);
        let mut events = msg.subscribe();

        msg.destroy();
        msg.finish_on_close();

        assert!(msg.is_destroyed());
        assert!(events.try_recv().is_err());
        assert_eq!(msg.chunk().await, None);
    }

    #[tokio::test]
    async fn accessors_reflect_the_head() {
        let msg = request(&[("X-Trace", "abc"), ("x-trace", "def")]);
        assert_eq!(msg.method(), Some("POST"));
        assert_eq!(msg.url(), Some("/upload"));
        assert_eq!(msg.status_code(), None);
        assert_eq!(msg.http_version(), "1.1");
        assert_eq!(msg.raw_headers().len(), 2);
        assert!(msg.trailers().is_empty());
        assert_eq!(
            msg.headers().get("X-TRACE").map(|v| v.values().count()),
            Some(2)
        );
    }
}
