//! Client connection pool.
//!
//! # Data Flow
//! ```text
//! ClientRequest
//!     → Agent::get_connection(key)
//!         → free partition (lifo/fifo)  ── reuse
//!         → Transport::connect          ── new socket
//!     → Lease (active partition)
//!     → Agent::release(lease)
//!         → free partition + watcher (keep-alive)
//!         → destroy
//! ```

pub mod key;
pub mod lease;
pub mod pool;

pub use key::AgentKey;
pub use lease::Lease;
pub use pool::Agent;
