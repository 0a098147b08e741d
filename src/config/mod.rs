//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → EngineConfig (validated, immutable)
//!     → sections cloned into Server / Agent / TcpTransport
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::AgentConfig;
pub use schema::EngineConfig;
pub use schema::ParseLimits;
pub use schema::Scheduling;
pub use schema::ServerConfig;
pub use schema::TransportConfig;
