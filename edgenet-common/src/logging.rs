//! Logging initialization using tracing.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tracing::debug;
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable lines with thread ids, file and line.
    #[default]
    Pretty,
    /// One JSON object per event, for log aggregation.
    Json,
    /// Compact lines routed through the test harness capture.
    Test,
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level` when set. Returns an error if a
/// global subscriber is already installed.
pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .try_init(),
        LogFormat::Test => registry
            .with(fmt::layer().compact().with_test_writer())
            .try_init(),
    };

    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}

/// Logs how long an operation took when dropped.
pub struct TimedOperation {
    name: &'static str,
    started: Instant,
}

impl TimedOperation {
    /// Start timing `name`.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            started: Instant::now(),
        }
    }

    /// Time elapsed since the operation started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for TimedOperation {
    fn drop(&mut self) {
        debug!(
            operation = self.name,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Operation finished"
        );
    }
}
