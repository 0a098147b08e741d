//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, pool sizes coherent)
//! - Check that addresses parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: EngineConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::{EngineConfig, ParseLimits};

/// One failed semantic check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Check every section and collect all problems.
pub fn validate_config(config: &EngineConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.host.trim().is_empty() {
        errors.push(ValidationError::new("server.host", "must not be empty"));
    }
    if config.server.backlog == 0 {
        errors.push(ValidationError::new("server.backlog", "must be greater than 0"));
    }
    check_limits("server.limits", &config.server.limits, &mut errors);
    check_limits("agent.limits", &config.agent.limits, &mut errors);

    if config.agent.keep_alive && config.agent.keep_alive_msecs == 0 {
        errors.push(ValidationError::new(
            "agent.keep_alive_msecs",
            "must be greater than 0 when keep_alive is enabled",
        ));
    }
    if config.agent.max_sockets == Some(0) {
        errors.push(ValidationError::new("agent.max_sockets", "must be greater than 0"));
    }

    if config.transport.connect_timeout_ms == 0 {
        errors.push(ValidationError::new(
            "transport.connect_timeout_ms",
            "must be greater than 0",
        ));
    }
    if config.transport.max_connections == 0 {
        errors.push(ValidationError::new(
            "transport.max_connections",
            "must be greater than 0",
        ));
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("{:?} is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_limits(field: &'static str, limits: &ParseLimits, errors: &mut Vec<ValidationError>) {
    if limits.max_header_bytes == 0 || limits.max_headers == 0 {
        errors.push(ValidationError::new(field, "limits must be greater than 0"));
    }
}
