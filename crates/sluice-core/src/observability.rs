//! Observability infrastructure for Sluice.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors for consistent observability
//! across all Sluice components.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, fmt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `sluice_flow=debug`)
///
/// # Example
///
/// ```rust
/// use sluice_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for per-DeltaFile orchestration operations.
///
/// # Example
///
/// ```rust
/// use sluice_core::observability::deltafile_span;
///
/// let span = deltafile_span("handle_result", "0190-abc", "smoke-flow");
/// let _guard = span.enter();
/// // ... record the action result
/// ```
#[must_use]
pub fn deltafile_span(operation: &str, did: &str, flow: &str) -> Span {
    tracing::info_span!(
        "deltafile",
        op = operation,
        did = did,
        flow = flow,
    )
}

/// Creates a span for maintenance sweep operations.
#[must_use]
pub fn sweep_span(sweep: &str) -> Span {
    tracing::info_span!("sweep", sweep = sweep)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_reentrant() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty); // Second call should be no-op
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = deltafile_span("test_operation", "did-1", "flow-a");
        let _guard = span.enter();
        tracing::info!("test message in span");

        let sweep = sweep_span("requeue");
        let _sweep_guard = sweep.enter();
    }
}
