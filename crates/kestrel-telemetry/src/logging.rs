//! Structured logging for Kestrel
//!
//! Provides structured logging with:
//! - Configurable log levels
//! - Environment-based filtering
//! - Optional JSON output
//! - Worker/job context injection

use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::{TelemetryError, TelemetryResult};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Enable logging
    pub enabled: bool,

    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Output format (json, pretty, compact)
    pub format: LogFormat,

    /// Include span events
    pub include_spans: bool,

    /// Include file/line information
    pub include_location: bool,

    /// Include target (module path)
    pub include_target: bool,

    /// Environment filter string (e.g., "kestrel_worker=debug,redis=warn")
    pub env_filter: Option<String>,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (machine-readable)
    Json,
    /// Pretty format (human-readable, colored)
    Pretty,
    /// Compact format (single line)
    #[default]
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" | "text" => Ok(LogFormat::Compact),
            other => Err(TelemetryError::Config(format!("unknown log format: {}", other))),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            format: LogFormat::Compact,
            include_spans: false,
            include_location: false,
            include_target: true,
            env_filter: None,
        }
    }
}

impl LoggingConfig {
    /// Build from a level and a format name
    pub fn new(level: impl Into<String>, format: &str) -> TelemetryResult<Self> {
        Ok(Self {
            level: level.into(),
            format: format.parse()?,
            ..Default::default()
        })
    }

    fn filter(&self) -> TelemetryResult<EnvFilter> {
        // RUST_LOG wins over the configured level, like every other tool.
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        let directive = self.env_filter.as_deref().unwrap_or(&self.level);
        EnvFilter::try_new(directive).map_err(|e| TelemetryError::Logging(e.to_string()))
    }
}

/// Initialize logging with configuration
pub fn init_logging(config: LoggingConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let filter = config.filter()?;

    let span_events = if config.include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    // Children share the master's stderr, so all output goes there.
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(UtcTime::rfc_3339())
        .with_span_events(span_events)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_target(config.include_target);

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Json => registry.with(layer.json()).try_init(),
        LogFormat::Pretty => registry.with(layer.pretty()).try_init(),
        LogFormat::Compact => registry.with(layer.compact()).try_init(),
    };
    result.map_err(|e| TelemetryError::Logging(e.to_string()))?;

    tracing::debug!(
        "Logging initialized with level: {}, format: {:?}",
        config.level,
        config.format
    );

    Ok(())
}

/// Log context for job execution
#[derive(Debug, Clone)]
pub struct JobLogContext {
    pub jid: String,
    pub klass: String,
    pub queue: String,
}

impl JobLogContext {
    /// Create a new job log context
    pub fn new(jid: &str, klass: &str, queue: &str) -> Self {
        Self {
            jid: jid.to_string(),
            klass: klass.to_string(),
            queue: queue.to_string(),
        }
    }

    /// Create a tracing span with this context
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "job",
            jid = %self.jid,
            klass = %self.klass,
            queue = %self.queue
        )
    }
}

/// Worker log context
#[derive(Debug, Clone)]
pub struct WorkerLogContext {
    pub worker: String,
    pub role: &'static str,
    pub queues: Vec<String>,
}

impl WorkerLogContext {
    /// Create a new worker log context
    pub fn new(worker: &str, role: &'static str, queues: Vec<String>) -> Self {
        Self {
            worker: worker.to_string(),
            role,
            queues,
        }
    }

    /// Create a tracing span with this context
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "worker",
            worker = %self.worker,
            role = self.role,
            pid = std::process::id(),
            queues = ?self.queues
        )
    }
}

/// Macros for structured logging with context

/// Log job started
#[macro_export]
macro_rules! log_job_started {
    ($jid:expr, $klass:expr, $queue:expr) => {
        tracing::info!(
            jid = %$jid,
            klass = %$klass,
            queue = %$queue,
            event = "job.started",
            "Job execution started"
        )
    };
}

/// Log job completed
#[macro_export]
macro_rules! log_job_completed {
    ($jid:expr, $klass:expr, $queue:expr, $duration_ms:expr) => {
        tracing::info!(
            jid = %$jid,
            klass = %$klass,
            queue = %$queue,
            duration_ms = $duration_ms,
            event = "job.completed",
            "Job completed successfully"
        )
    };
}

/// Log job failed
#[macro_export]
macro_rules! log_job_failed {
    ($jid:expr, $klass:expr, $queue:expr, $group:expr, $error:expr) => {
        tracing::error!(
            jid = %$jid,
            klass = %$klass,
            queue = %$queue,
            group = %$group,
            error = %$error,
            event = "job.failed",
            "Job execution failed"
        )
    };
}
