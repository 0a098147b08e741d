//! HTTP/1.1 message engine: an event-driven server, a client request writer
//! and a keep-alive connection pool over a pluggable socket transport.

pub mod agent;
pub mod config;
pub mod events;
pub mod http;
pub mod net;
pub mod observability;

pub use agent::{Agent, AgentKey};
pub use config::schema::EngineConfig;
pub use http::{Client, ClientRequest, HttpError, IncomingMessage, Server, ServerResponse};
pub use net::{MemoryTransport, TcpTransport, Transport};
