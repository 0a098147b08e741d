//! HTTP/1.1 message handling subsystem.
//!
//! # Data Flow
//! ```text
//! Server side:
//!     Socket Data
//!     → server.rs (per-connection state machine, timers)
//!     → codec.rs (request head parse)
//!     → incoming.rs (IncomingMessage, body feed)
//!     → Request(req, res) notification to the application
//!     → response.rs (header lock, framing, Finish)
//!
//! Client side:
//!     client.rs / request.rs (ClientRequest)
//!     → Agent lease → codec.rs (head serialize)
//!     → response head parse → incoming.rs
//!     → lease released or destroyed
//! ```
//!
//! # Design Decisions
//! - Messages are cheap clone handles; sockets are driven by their own tasks
//! - Framing is content-length or close-delimited; no chunked coding
//! - Misuse (late header changes, write after end) fails synchronously

pub mod client;
pub mod codec;
pub mod error;
pub mod headers;
pub mod incoming;
pub mod method;
pub mod outgoing;
pub mod request;
pub mod response;
pub mod server;
pub mod status;

pub use client::{Client, FetchedResponse};
pub use error::{HttpError, InvalidState, ParseError, TimeoutKind};
pub use headers::{HeaderMap, HeaderValue, RawHeader};
pub use incoming::{BodyLength, BodyReadable, IncomingMessage, MessageEvent};
pub use method::Method;
pub use outgoing::{HeaderWritable, OutgoingEvent};
pub use request::{ClientRequest, RequestEvent, RequestEvents, RequestOptions, RequestState};
pub use response::ServerResponse;
pub use server::{Server, ServerEvent, ServerEvents, ServerState};
