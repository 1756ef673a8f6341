//! Kestrel Telemetry - Observability layer
//!
//! Structured logging for the master, job-child and watchdog processes:
//! - `tracing-subscriber` setup with env filtering
//! - Pretty, compact or JSON output
//! - Worker and job context spans

pub mod logging;

pub use logging::{init_logging, JobLogContext, LogFormat, LoggingConfig, WorkerLogContext};

use thiserror::Error;

/// Telemetry errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
