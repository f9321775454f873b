//! # Structured Logging
//!
//! Subscriber setup and span macros built on the tracing ecosystem.
//!
//! `RUST_LOG` takes precedence over the configured log level so operators can
//! raise verbosity for a single module (`RUST_LOG=info,edgeplane::dag=debug`).

use crate::config::{AppConfig, ObservabilityConfig};
use crate::errors::{EdgeplaneError, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Create a tracing span for xDS operations
#[macro_export]
macro_rules! xds_span {
    ($operation:expr, $node_id:expr) => {
        tracing::info_span!(
            "xds_operation",
            operation = %$operation,
            node_id = %$node_id,
            operation_id = %$crate::utils::generate_id()
        )
    };
    ($operation:expr, $node_id:expr, $($field:tt)*) => {
        tracing::info_span!(
            "xds_operation",
            operation = %$operation,
            node_id = %$node_id,
            operation_id = %$crate::utils::generate_id(),
            $($field)*
        )
    };
}

/// Create a tracing span covering one DAG rebuild
#[macro_export]
macro_rules! rebuild_span {
    ($sequence:expr) => {
        tracing::debug_span!(
            "dag_rebuild",
            sequence = $sequence,
            operation_id = %$crate::utils::generate_id()
        )
    };
    ($sequence:expr, $($field:tt)*) => {
        tracing::debug_span!(
            "dag_rebuild",
            sequence = $sequence,
            operation_id = %$crate::utils::generate_id(),
            $($field)*
        )
    };
}

/// Install the global subscriber.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let json_layer = config.json_logging.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
    });
    let text_layer = (!config.json_logging).then(|| fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| EdgeplaneError::config(format!("Failed to initialize logging: {}", e)))
}

/// Log configuration at startup
pub fn log_config_info(config: &AppConfig) {
    tracing::info!(
        xds_address = %config.xds.socket_address(),
        http_port = config.listeners.http_port,
        https_port = config.listeners.https_port,
        ingress_classes = ?config.ingress.class_names,
        root_namespaces = ?config.policy.root_namespaces,
        gateway = ?config.policy.gateway.as_ref().map(|g| g.to_string()),
        holdoff_ms = config.rebuild.holdoff_delay_ms,
        holdoff_max_ms = config.rebuild.holdoff_max_delay_ms,
        metrics_enabled = %config.observability.enable_metrics,
        "Edgeplane control plane configuration"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macros_compile() {
        let _span = xds_span!("stream_clusters", "node-1");
        let _span = xds_span!("stream_clusters", "node-1", version = "v1");
        let _span = rebuild_span!(3u64);
        let _span = rebuild_span!(4u64, trigger = "Service");
    }

    #[test]
    fn test_log_config_info() {
        let config = AppConfig::default();
        log_config_info(&config);
    }

    #[test]
    fn test_init_logging_twice_fails_cleanly() {
        let config = ObservabilityConfig::default();
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
