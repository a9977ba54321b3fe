//! Structured logging bootstrap and correlation-context propagation

use tracing::Span;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::domain::CorrelationId;

/// Installs the global `tracing` subscriber once per process.
///
/// # Panics
///
/// Panics if a subscriber has already been installed (calling this twice is
/// a programmer error, not a runtime condition the core needs to recover
/// from).
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_new(&config.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if config.format == "json" {
        builder.json().with_current_span(true).init();
    } else {
        builder.init();
    }
}

/// Opens the span every control-plane request, task, and outgoing call
/// shares, so a single `correlation_id` field appears on every log line for
/// one logical operation.
#[must_use]
pub fn correlation_span(correlation_id: CorrelationId) -> Span {
    tracing::info_span!("operation", correlation_id = %correlation_id)
}
