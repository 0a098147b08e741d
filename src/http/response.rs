//! Server-side response writer.
//!
//! # Responsibilities
//! - Hold the status line and header table until the head is locked
//! - Serialize the head on the first write, `write_head` or `end`
//! - Suppress body bytes where HTTP forbids them
//! - Report `Finish` exactly once
//!
//! # Header lock
//! On locking, `date` and `connection: close` are added unless already set.
//! When the lock is triggered by `end_with(chunk)` and no framing header
//! exists, `content-length` is derived from the chunk.

use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};

use crate::events::Emitter;
use crate::http::codec::{serialize_head, Head};
use crate::http::error::{HttpError, InvalidState};
use crate::http::headers::{validate_name, validate_value, HeaderValue};
use crate::http::incoming::IncomingMessage;
use crate::http::outgoing::{HeaderWritable, OutgoingEvent, OutgoingMessage};
use crate::http::status;
use crate::net::Socket;
use crate::observability::metrics;

/// IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[derive(Debug)]
struct ResponseState {
    outgoing: OutgoingMessage,
    status_code: u16,
    status_message: Option<String>,
}

struct Inner {
    state: Mutex<ResponseState>,
    socket: Socket,
    request: IncomingMessage,
    events: Emitter<OutgoingEvent>,
}

/// Response to one [`IncomingMessage`]. Cloning yields another handle.
#[derive(Clone)]
pub struct ServerResponse {
    inner: Arc<Inner>,
}

impl ServerResponse {
    pub fn new(request: IncomingMessage) -> Self {
        let socket = request.socket().clone();
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ResponseState {
                    outgoing: OutgoingMessage::new(),
                    status_code: 200,
                    status_message: None,
                }),
                socket,
                request,
                events: Emitter::new(),
            }),
        }
    }

    /// The request this response answers.
    pub fn request(&self) -> &IncomingMessage {
        &self.inner.request
    }

    pub fn socket(&self) -> &Socket {
        &self.inner.socket
    }

    pub fn status_code(&self) -> u16 {
        self.state().status_code
    }

    pub fn set_status_code(&self, code: u16) {
        self.state().status_code = code;
    }

    /// Explicit reason, or the table phrase for the current code.
    pub fn status_message(&self) -> String {
        let state = self.state();
        match &state.status_message {
            Some(m) => m.clone(),
            None => status::reason_or_unknown(state.status_code).to_string(),
        }
    }

    pub fn set_status_message(&self, message: impl Into<String>) {
        self.state().status_message = Some(message.into());
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<OutgoingEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves once the response has finished.
    pub fn on_finish(&self) -> oneshot::Receiver<OutgoingEvent> {
        self.inner
            .events
            .once_where(|e| matches!(e, OutgoingEvent::Finish))
    }

    /// Set the status line and headers, then send the head.
    ///
    /// Once the head is on the wire a further call only updates the stored
    /// status fields. An invalid header rejects the whole call before any
    /// field changes.
    pub fn write_head(
        &self,
        status_code: u16,
        reason: Option<&str>,
        headers: &[(&str, &str)],
    ) -> Result<(), HttpError> {
        let mut validated = Vec::with_capacity(headers.len());
        for (name, value) in headers {
            let value = HeaderValue::from(*value);
            validate_name(name)?;
            validate_value(name, &value)?;
            validated.push((*name, value));
        }

        let mut state = self.state();
        state.status_code = status_code;
        if let Some(reason) = reason {
            state.status_message = Some(reason.to_string());
        }
        if state.outgoing.headers_sent {
            tracing::debug!(
                connection_id = %self.inner.socket.id(),
                status = status_code,
                "write_head after headers sent; status updated in memory only"
            );
            return Ok(());
        }
        for (name, value) in validated {
            state.outgoing.set_header(name, value)?;
        }
        self.lock_headers(&mut state, None);
        Ok(())
    }

    /// Write a body chunk. `Ok(false)` signals back-pressure; a `Drain`
    /// notification follows.
    pub fn write(&self, chunk: impl Into<Bytes>) -> Result<bool, HttpError> {
        let chunk = chunk.into();
        let mut state = self.state();
        if state.outgoing.finished {
            return Err(InvalidState::WriteAfterEnd.into());
        }
        if !state.outgoing.headers_sent {
            self.lock_headers(&mut state, None);
        }
        if chunk.is_empty() || !self.body_allowed(&state) {
            return Ok(true);
        }
        Ok(self.inner.socket.write(chunk))
    }

    /// Finish the response. A second call is a no-op.
    pub fn end(&self) {
        let mut state = self.state();
        if state.outgoing.finished {
            return;
        }
        if !state.outgoing.headers_sent {
            self.lock_headers(&mut state, None);
        }
        self.finish(state);
    }

    /// Write `chunk` and finish the response.
    pub fn end_with(&self, chunk: impl Into<Bytes>) -> Result<(), HttpError> {
        let chunk = chunk.into();
        let mut state = self.state();
        if state.outgoing.finished {
            return Err(InvalidState::WriteAfterEnd.into());
        }
        if !state.outgoing.headers_sent {
            self.lock_headers(&mut state, Some(chunk.len()));
        }
        if !chunk.is_empty() && self.body_allowed(&state) {
            self.inner.socket.write(chunk);
        }
        self.finish(state);
        Ok(())
    }

    fn finish(&self, mut state: MutexGuard<'_, ResponseState>) {
        state.outgoing.finished = true;
        let status_code = state.status_code;
        drop(state);

        self.inner.socket.end();
        metrics::record_response(status_code);
        tracing::debug!(
            connection_id = %self.inner.socket.id(),
            status = status_code,
            "Response finished"
        );
        self.inner.events.emit(OutgoingEvent::Finish);
    }

    fn body_allowed(&self, state: &ResponseState) -> bool {
        let head_request = self
            .inner
            .request
            .method()
            .is_some_and(|m| m.eq_ignore_ascii_case("HEAD"));
        !head_request && !status::is_bodyless(state.status_code)
    }

    fn lock_headers(&self, state: &mut ResponseState, final_len: Option<usize>) {
        let headers = &mut state.outgoing.headers;
        if !headers.contains("date") {
            headers.set("date", http_date().into());
        }
        if !headers.contains("connection") {
            headers.set("connection", "close".into());
        }
        if let Some(len) = final_len {
            if !state.outgoing.has_framing_header() && !status::is_bodyless(state.status_code) {
                state.outgoing.headers.set("content-length", len.into());
            }
        }

        let reason = match &state.status_message {
            Some(m) => m.as_str(),
            None => status::reason_or_unknown(state.status_code),
        };
        let head = serialize_head(
            &Head::Response {
                status_code: state.status_code,
                reason,
            },
            &state.outgoing.headers,
        );
        state.outgoing.headers_sent = true;
        self.inner.socket.write(head);
    }

    /// Forward a socket `Drain` to subscribers.
    pub(crate) fn notify_drain(&self) {
        self.inner.events.emit(OutgoingEvent::Drain);
    }

    /// Forward a socket `Close` to subscribers.
    pub(crate) fn notify_close(&self) {
        self.inner.events.emit(OutgoingEvent::Close);
    }

    fn state(&self) -> MutexGuard<'_, ResponseState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HeaderWritable for ServerResponse {
    fn with_outgoing<R>(&self, f: impl FnOnce(&mut OutgoingMessage) -> R) -> R {
        f(&mut self.state().outgoing)
    }
}

impl std::fmt::Debug for ServerResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("ServerResponse")
            .field("status_code", &state.status_code)
            .field("headers_sent", &state.outgoing.headers_sent)
            .field("finished", &state.outgoing.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::codec::RequestLine;
    use crate::http::headers::RawHeader;
    use crate::net::SocketInfo;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn pair(method: &str) -> (ServerResponse, DuplexStream) {
        let (near, far) = duplex(64 * 1024);
        let (socket, _events) = Socket::spawn(near, SocketInfo::default());
        let line = RequestLine {
            method: method.to_string(),
            target: "/".to_string(),
            version: "1.1".to_string(),
        };
        let req = IncomingMessage::request(line, vec![RawHeader::new("Host", "x")], socket).unwrap();
        (ServerResponse::new(req), far)
    }

    async fn read_all(mut far: DuplexStream) -> String {
        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), far.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn end_with_adds_length_date_and_connection() {
        let (res, far) = pair("GET");
        res.set_header("Content-Type", "text/plain").unwrap();
        res.end_with("hello").unwrap();

        let text = read_all(far).await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n"));
        assert!(text.contains("\r\ndate: "));
        assert!(text.contains(" GMT\r\n"));
        assert!(text.contains("\r\nconnection: close\r\n"));
        assert!(text.contains("\r\ncontent-length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn not_found_status_line() {
        let (res, far) = pair("GET");
        res.write_head(404, None, &[]).unwrap();
        res.end();

        let text = read_all(far).await;
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[tokio::test]
    async fn unknown_code_uses_fallback_reason() {
        let (res, far) = pair("GET");
        res.write_head(299, None, &[]).unwrap();
        res.end();

        assert!(read_all(far).await.starts_with("HTTP/1.1 299 unknown\r\n"));
    }

    #[tokio::test]
    async fn headers_locked_after_write_and_second_write_head_is_permissive() {
        let (res, far) = pair("GET");
        res.write_head(201, Some("Made"), &[("X-One", "1")]).unwrap();
        assert!(res.headers_sent());

        assert!(res.set_header("X-Late", "1").unwrap_err().is_invalid_state());
        res.write_head(500, None, &[("X-Two", "2")]).unwrap();
        assert_eq!(res.status_code(), 500);

        res.end();
        let text = read_all(far).await;
        assert!(text.starts_with("HTTP/1.1 201 Made\r\n"));
        assert!(!text.contains("X-Two"));
    }

    #[tokio::test]
    async fn end_semantics_after_finish() {
        let (res, _far) = pair("GET");
        let finish = res.on_finish();
        res.end();
        res.end();

        assert!(res.finished());
        assert_eq!(finish.await.unwrap(), OutgoingEvent::Finish);
        assert!(matches!(
            res.write("more"),
            Err(HttpError::InvalidState(InvalidState::WriteAfterEnd))
        ));
        assert!(res.end_with("more").is_err());
    }

    #[tokio::test]
    async fn head_is_written_once_across_repeated_ends() {
        let (res, far) = pair("GET");
        res.end_with("body").unwrap();
        res.end();
        assert!(res.end_with("again").is_err());
        res.end();

        let text = read_all(far).await;
        assert_eq!(text.matches("HTTP/1.1 ").count(), 1, "{text}");
        assert!(text.ends_with("\r\n\r\nbody"));

        let (res, far) = pair("GET");
        res.write_head(201, None, &[]).unwrap();
        res.end();
        res.end();
        let text = read_all(far).await;
        assert_eq!(text.matches("HTTP/1.1 ").count(), 1, "{text}");
    }

    #[tokio::test]
    async fn write_head_with_invalid_header_changes_nothing() {
        let (res, far) = pair("GET");
        let err = res
            .write_head(
                404,
                Some("Gone Fishing"),
                &[("X-First", "1"), ("X-Bad", "a\r\nInjected: yes"), ("X-Last", "3")],
            )
            .unwrap_err();
        assert!(matches!(err, HttpError::InvalidHeader { .. }));
        assert!(!res.has_header("X-First"));
        assert!(!res.has_header("X-Last"));
        assert!(!res.headers_sent());
        assert_eq!(res.status_code(), 200);

        assert!(res.write_head(200, None, &[("Bad Name", "v")]).is_err());
        assert!(!res.headers_sent());

        res.set_header("X-After", "ok").unwrap();
        res.end();
        let text = read_all(far).await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(text.contains("X-After: ok\r\n"));
        assert!(!text.contains("X-First"));
        assert!(!text.contains("Injected"));
    }

    #[tokio::test]
    async fn head_requests_and_bodyless_statuses_suppress_body() {
        let (res, far) = pair("HEAD");
        res.end_with("invisible").unwrap();
        let text = read_all(far).await;
        assert!(text.contains("content-length: 9\r\n"));
        assert!(text.ends_with("\r\n\r\n"));

        let (res, far) = pair("GET");
        res.set_status_code(204);
        res.write("ignored").unwrap();
        res.end();
        let text = read_all(far).await;
        assert!(text.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(!text.contains("content-length"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn explicit_connection_header_is_kept() {
        let (res, far) = pair("GET");
        res.set_header("Connection", "keep-alive").unwrap();
        res.set_header("Content-Length", "2").unwrap();
        res.write("ok").unwrap();
        res.end();

        let text = read_all(far).await;
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(!text.contains("connection: close"));
        assert_eq!(text.matches("ontent-length").count(), 1);
    }
}
