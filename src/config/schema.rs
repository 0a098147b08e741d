//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the HTTP engine.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Server listener and timer settings.
    pub server: ServerConfig,

    /// Client connection pool settings.
    pub agent: AgentConfig,

    /// Socket-level settings shared by servers and agents.
    pub transport: TransportConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (e.g., "127.0.0.1").
    pub host: String,

    /// Port to bind; 0 picks an ephemeral port.
    pub port: u16,

    /// Listen backlog.
    pub backlog: u32,

    /// Socket inactivity window before a `Timeout` notification (0 = off).
    pub idle_timeout_ms: u64,

    /// Window for a request head to complete (0 = off).
    pub headers_timeout_ms: u64,

    /// How long a finished connection may linger before it is destroyed.
    pub keep_alive_timeout_ms: u64,

    /// Wire parser limits applied to request heads.
    pub limits: ParseLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            backlog: 511,
            idle_timeout_ms: 0,
            headers_timeout_ms: 60_000,
            keep_alive_timeout_ms: 5_000,
            limits: ParseLimits::default(),
        }
    }
}

/// Order in which free sockets are handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scheduling {
    /// Most recently released first.
    #[default]
    Lifo,
    /// Least recently released first.
    Fifo,
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Keep sockets open between requests.
    pub keep_alive: bool,

    /// Idle window for a pooled socket before eviction.
    pub keep_alive_msecs: u64,

    /// Concurrent sockets per key; `None` is unbounded.
    pub max_sockets: Option<usize>,

    /// Free sockets retained per key.
    pub max_free_sockets: usize,

    /// Free-socket selection order.
    pub scheduling: Scheduling,

    /// Wire parser limits applied to response heads.
    pub limits: ParseLimits,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            keep_alive: false,
            keep_alive_msecs: 1_000,
            max_sockets: None,
            max_free_sockets: 256,
            scheduling: Scheduling::Lifo,
            limits: ParseLimits::default(),
        }
    }
}

/// Socket-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Connection establishment timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Disable Nagle's algorithm on TCP sockets.
    pub nodelay: bool,

    /// Maximum concurrent accepted connections per listener (backpressure).
    pub max_connections: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            nodelay: true,
            max_connections: 10_000,
        }
    }
}

/// Bounds on a message head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ParseLimits {
    /// Largest head (start line + headers) in bytes.
    pub max_header_bytes: usize,

    /// Most header lines per head.
    pub max_headers: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: 16 * 1024,
            max_headers: 2_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
