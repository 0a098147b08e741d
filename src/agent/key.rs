//! Pool key.

use std::fmt;

use crate::net::Protocol;

/// Sockets are pooled per `(host, port, protocol)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentKey {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl AgentKey {
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
        }
    }
}

impl fmt::Display for AgentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}//{}:{}", self.protocol, self.host, self.port)
    }
}
