//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Transport (TcpTransport | MemoryTransport)
//!     → listener.rs (bind with backlog, accept loop, connection limits)
//!     → socket.rs (per-socket driver task: reads → Data, writes, timers)
//!     → connection.rs (identity used by server sets and agent pools)
//!     → Hand off to HTTP layer
//!
//! Socket notifications:
//!     Data* → End? → (Drain | Timeout)* → Error? → Close
//! ```
//!
//! # Design Decisions
//! - Components receive a transport handle instead of opening sockets themselves
//! - Each socket is driven by exactly one task; handles are cheap clones
//! - TLS is not provided here; `https:` targets are rejected by the TCP transport

pub mod connection;
pub mod listener;
pub mod memory;
pub mod socket;
pub mod transport;

pub use connection::ConnectionId;
pub use memory::{MemoryPeer, MemoryTransport};
pub use socket::{Socket, SocketEvent, SocketEvents, SocketInfo};
pub use transport::{Accepted, Acceptor, Protocol, TcpTransport, Transport};
