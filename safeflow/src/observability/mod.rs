//! Observability utilities.
//!
//! Library code only emits `tracing` events and spans; installing a
//! subscriber is left to the binary, usually through [`init_tracing`].

use tracing::Span;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

/// Output format for [`init_tracing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Installs a global fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns false if a subscriber was already installed; calling it twice is
/// harmless.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(true);
    match format {
        LogFormat::Pretty => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    }
}

/// Span wrapping one pipeline run. Every stage, retry and compensation log
/// line emitted inside it carries the pipeline name and run ID.
#[must_use]
pub fn run_span(pipeline: &str, run_id: Uuid) -> Span {
    tracing::info_span!("pipeline_run", pipeline = %pipeline, run_id = %run_id)
}
