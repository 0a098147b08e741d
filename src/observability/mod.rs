//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! net / http / agent produce:
//!     → tracing events (connection_id, peer_addr, status, ...)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → logging.rs subscriber (stdout)
//!     → Prometheus scrape endpoint (optional)
//! ```

pub mod logging;
pub mod metrics;
