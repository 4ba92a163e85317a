use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

/// Initialize structured logging.
///
/// `RUST_LOG` takes precedence over the configured level when set. Logs go to
/// stderr so command output on stdout stays machine-readable.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))?;

    if config.json_logs {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .try_init()?;
    }

    tracing::info!("Shopfloor telemetry initialized with structured logging");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span covering one bulk operation from dispatch to its terminal status.
pub fn create_operation_span(operation_id: &str, operation_type: &str, total: usize) -> tracing::Span {
    tracing::info_span!(
        "bulk_operation",
        operation.id = operation_id,
        operation.kind = operation_type,
        operation.total = total,
        otel.kind = "internal"
    )
}

/// Span covering one single-entity workflow transition.
pub fn create_transition_span(transition: &str, entity_id: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "workflow_transition",
        transition = transition,
        entity.id = entity_id,
        correlation.id = correlation_id,
        otel.kind = "internal"
    )
}

/// Shutdown telemetry gracefully
pub fn shutdown_telemetry() {
    // For structured logging, no explicit shutdown needed
    tracing::info!("Shopfloor telemetry shutdown complete");
}
