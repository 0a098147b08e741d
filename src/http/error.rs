//! Error types for the HTTP engine.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Malformed wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid request line: {0:?}")]
    InvalidRequestLine(String),

    #[error("invalid status line: {0:?}")]
    InvalidStatusLine(String),

    #[error("invalid header line: {0:?}")]
    InvalidHeader(String),

    #[error("invalid content-length: {0:?}")]
    InvalidContentLength(String),

    #[error("header block exceeds {limit} bytes")]
    HeadersTooLarge { limit: usize },

    #[error("more than {limit} header lines")]
    TooManyHeaders { limit: usize },
}

/// API misuse against a message's or server's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidState {
    #[error("cannot modify headers after they are sent")]
    HeadersSent,

    #[error("write after end")]
    WriteAfterEnd,

    #[error("server is already listening")]
    AlreadyListening,

    #[error("server is closed")]
    ServerClosed,
}

/// Which timer expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Socket saw no traffic within the idle window.
    Idle,
    /// A request head did not complete within the headers window.
    Headers,
    /// A client request's socket timeout.
    Request,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::Idle => f.write_str("idle"),
            TimeoutKind::Headers => f.write_str("headers"),
            TimeoutKind::Request => f.write_str("request"),
        }
    }
}

/// Errors surfaced by servers, responses, requests and agents.
#[derive(Debug, Clone, Error)]
pub enum HttpError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("invalid state: {0}")]
    InvalidState(#[from] InvalidState),

    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: &'static str },

    #[error("connection error: {0}")]
    Connection(#[source] Arc<io::Error>),

    #[error("{0} timeout")]
    Timeout(TimeoutKind),

    #[error("request aborted")]
    Aborted,

    #[error("socket hang up")]
    SocketHangUp,

    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl From<io::Error> for HttpError {
    fn from(err: io::Error) -> Self {
        HttpError::Connection(Arc::new(err))
    }
}

impl HttpError {
    /// True for synchronous state-machine misuse.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, HttpError::InvalidState(_))
    }
}
