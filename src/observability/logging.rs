//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber once per process
//! - Derive the filter from `RUST_LOG`, falling back to the configured level
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - Per-message flow logs at trace/debug; lifecycle at info/warn

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::schema::ObservabilityConfig;

/// Filter directive used when `RUST_LOG` is unset.
pub fn default_directive(config: &ObservabilityConfig) -> String {
    format!("h1_engine={}", config.log_level)
}

/// Install the global subscriber. Later calls are ignored.
pub fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_uses_configured_level() {
        let config = ObservabilityConfig {
            log_level: "debug".to_string(),
            ..Default::default()
        };
        assert_eq!(default_directive(&config), "h1_engine=debug");
    }

    #[test]
    fn init_is_idempotent() {
        let config = ObservabilityConfig::default();
        init_tracing(&config);
        init_tracing(&config);
    }
}
