//! State shared by every message this side writes.
//!
//! `ServerResponse` and `ClientRequest` each embed an [`OutgoingMessage`]
//! behind their own lock and expose it through [`HeaderWritable`].

use crate::http::error::{HttpError, InvalidState};
use crate::http::headers::{self, HeaderTable, HeaderValue};

/// Notifications from an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingEvent {
    /// The last byte was handed to the socket.
    Finish,
    /// A write that reported back-pressure has drained.
    Drain,
    /// The underlying connection closed.
    Close,
}

/// Header table plus the two lifecycle flags.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub headers: HeaderTable,
    pub headers_sent: bool,
    pub finished: bool,
}

impl OutgoingMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_header(&mut self, name: &str, value: HeaderValue) -> Result<(), HttpError> {
        if self.headers_sent {
            return Err(InvalidState::HeadersSent.into());
        }
        headers::validate_name(name)?;
        headers::validate_value(name, &value)?;
        self.headers.set(name, value);
        Ok(())
    }

    pub fn remove_header(&mut self, name: &str) -> Result<(), HttpError> {
        if self.headers_sent {
            return Err(InvalidState::HeadersSent.into());
        }
        self.headers.remove(name);
        Ok(())
    }

    /// Whether a `content-length` or `transfer-encoding` header is set.
    pub fn has_framing_header(&self) -> bool {
        self.headers.contains("content-length") || self.headers.contains("transfer-encoding")
    }
}

/// Header access for handles that own an [`OutgoingMessage`].
pub trait HeaderWritable {
    /// Run `f` against the message state under the handle's lock.
    fn with_outgoing<R>(&self, f: impl FnOnce(&mut OutgoingMessage) -> R) -> R;

    /// Fails with `HeadersSent` once the head is on the wire.
    fn set_header(&self, name: &str, value: impl Into<HeaderValue>) -> Result<(), HttpError> {
        let value = value.into();
        self.with_outgoing(|m| m.set_header(name, value))
    }

    fn remove_header(&self, name: &str) -> Result<(), HttpError> {
        self.with_outgoing(|m| m.remove_header(name))
    }

    fn get_header(&self, name: &str) -> Option<HeaderValue> {
        self.with_outgoing(|m| m.headers.get(name).cloned())
    }

    fn has_header(&self, name: &str) -> bool {
        self.with_outgoing(|m| m.headers.contains(name))
    }

    /// Canonical names in insertion order.
    fn header_names(&self) -> Vec<String> {
        self.with_outgoing(|m| m.headers.names().map(str::to_string).collect())
    }

    fn headers_sent(&self) -> bool {
        self.with_outgoing(|m| m.headers_sent)
    }

    fn finished(&self) -> bool {
        self.with_outgoing(|m| m.finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Handle(Mutex<OutgoingMessage>);

    impl HeaderWritable for Handle {
        fn with_outgoing<R>(&self, f: impl FnOnce(&mut OutgoingMessage) -> R) -> R {
            f(&mut self.0.lock().unwrap())
        }
    }

    #[test]
    fn headers_are_locked_once_sent() {
        let handle = Handle(Mutex::new(OutgoingMessage::new()));
        handle.set_header("Content-Type", "text/plain").unwrap();
        handle.with_outgoing(|m| m.headers_sent = true);

        let err = handle.set_header("X-Late", "1").unwrap_err();
        assert!(err.is_invalid_state());
        assert!(handle.remove_header("content-type").is_err());

        assert!(handle.has_header("CONTENT-TYPE"));
        assert_eq!(handle.get_header("content-type"), Some("text/plain".into()));
        assert_eq!(handle.header_names(), vec!["Content-Type".to_string()]);
    }

    #[test]
    fn invalid_names_and_values_are_rejected() {
        let mut msg = OutgoingMessage::new();
        assert!(matches!(
            msg.set_header("Bad Name", "v".into()),
            Err(HttpError::InvalidHeader { .. })
        ));
        assert!(msg.set_header("X", "a\nb".into()).is_err());
        assert!(msg.headers.is_empty());
    }

    #[test]
    fn framing_header_detection() {
        let mut msg = OutgoingMessage::new();
        assert!(!msg.has_framing_header());
        msg.set_header("Transfer-Encoding", "chunked".into()).unwrap();
        assert!(msg.has_framing_header());
    }
}
