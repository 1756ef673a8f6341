//! Job handlers and the registry that resolves them

use async_trait::async_trait;
use kestrel_core::Job;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result of running a handler: optional replacement data for the completed job
pub type PerformResult = Result<Option<serde_json::Value>, JobError>;

/// How a handler reports that a job did not succeed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobError {
    /// Fail the job for good
    #[error("{group}: {message}")]
    Failed { group: String, message: String },

    /// Put the job back on its queue, consuming one retry
    #[error("{group}: {message} (retry in {delay:?})")]
    Retry {
        group: String,
        message: String,
        delay: Duration,
    },
}

impl JobError {
    /// Fail with a group and message
    pub fn failed(group: impl Into<String>, message: impl Into<String>) -> Self {
        JobError::Failed {
            group: group.into(),
            message: message.into(),
        }
    }

    /// Retry after `delay`
    pub fn retry(group: impl Into<String>, message: impl Into<String>, delay: Duration) -> Self {
        JobError::Retry {
            group: group.into(),
            message: message.into(),
            delay,
        }
    }

    /// Failure group
    pub fn group(&self) -> &str {
        match self {
            JobError::Failed { group, .. } | JobError::Retry { group, .. } => group,
        }
    }

    /// Failure message
    pub fn message(&self) -> &str {
        match self {
            JobError::Failed { message, .. } | JobError::Retry { message, .. } => message,
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::failed("job:error", format!("{:#}", err))
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::failed("job:invalid-data", err.to_string())
    }
}

/// Trait for job handlers
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job's business logic
    async fn perform(&self, job: &Job) -> PerformResult;

    /// Get the handler name
    fn name(&self) -> &str;
}

/// Handlers keyed by job class
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    default: Option<Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// Create a new registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler
    pub fn register(&mut self, klass: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(klass.into(), handler);
    }

    /// Use the handler registered as `klass` for jobs with no handler of their own
    pub fn set_default(&mut self, klass: &str) -> kestrel_core::Result<()> {
        let handler = self.get(klass).ok_or_else(|| {
            kestrel_core::Error::invalid_argument(
                "default_handler",
                format!("no handler registered as '{}'", klass),
            )
        })?;
        self.default = Some(handler);
        Ok(())
    }

    /// Get a handler
    pub fn get(&self, klass: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(klass).cloned()
    }

    /// Check if a handler exists
    pub fn has(&self, klass: &str) -> bool {
        self.handlers.contains_key(klass)
    }

    /// Handler for a job's class, falling back to the default handler
    pub fn resolve(&self, klass: &str) -> Option<Arc<dyn JobHandler>> {
        self.get(klass).or_else(|| self.default.clone())
    }

    /// Registered class names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Returns the job's data unchanged
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn perform(&self, job: &Job) -> PerformResult {
        Ok(Some(serde_json::json!({
            "jid": job.jid.to_string(),
            "echo": job.data,
        })))
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// Sleeps for `data.seconds` (default 1), useful for exercising signals
pub struct SleepHandler;

#[async_trait]
impl JobHandler for SleepHandler {
    async fn perform(&self, job: &Job) -> PerformResult {
        let seconds = job
            .data
            .get("seconds")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0)
            .max(0.0);

        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;

        Ok(Some(serde_json::json!({ "slept_for": seconds })))
    }

    fn name(&self) -> &str {
        "sleep"
    }
}

/// Fails with `data.message`
pub struct FailHandler;

#[async_trait]
impl JobHandler for FailHandler {
    async fn perform(&self, job: &Job) -> PerformResult {
        let message = job
            .data
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Intentional failure");

        Err(JobError::failed("fail:requested", message))
    }

    fn name(&self) -> &str {
        "fail"
    }
}

/// Panics with `data.message`, exercising the fatal crash path
pub struct CrashHandler;

#[async_trait]
impl JobHandler for CrashHandler {
    async fn perform(&self, job: &Job) -> PerformResult {
        let message = job
            .data
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Intentional crash")
            .to_string();

        panic!("{}", message);
    }

    fn name(&self) -> &str {
        "crash"
    }
}

/// Registry with the built-in handlers
pub fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("echo", Arc::new(EchoHandler));
    registry.register("sleep", Arc::new(SleepHandler));
    registry.register("fail", Arc::new(FailHandler));
    registry.register("crash", Arc::new(CrashHandler));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo_handler() {
        let job = Job::new("echo", "q", json!({"hello": "world"}));
        let result = EchoHandler.perform(&job).await.unwrap().unwrap();
        assert_eq!(result["echo"], json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn test_fail_handler() {
        let job = Job::new("fail", "q", json!({"message": "test error"}));
        let err = FailHandler.perform(&job).await.unwrap_err();
        assert_eq!(err.group(), "fail:requested");
        assert_eq!(err.message(), "test error");
    }

    #[tokio::test]
    async fn test_sleep_handler_zero() {
        let job = Job::new("sleep", "q", json!({"seconds": 0}));
        let result = SleepHandler.perform(&job).await.unwrap().unwrap();
        assert_eq!(result["slept_for"], json!(0.0));
    }

    #[test]
    fn test_registry() {
        let registry = builtin_registry();
        assert!(registry.has("echo"));
        assert!(!registry.has("unknown"));
        assert_eq!(registry.names(), vec!["crash", "echo", "fail", "sleep"]);
        assert!(registry.resolve("unknown").is_none());
    }

    #[test]
    fn test_default_handler_fallback() {
        let mut registry = builtin_registry();
        registry.set_default("echo").unwrap();
        let handler = registry.resolve("Some.Unknown.Class").unwrap();
        assert_eq!(handler.name(), "echo");

        let err = registry.set_default("missing").unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_job_error_conversions() {
        let err: JobError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.group(), "job:error");
        assert_eq!(err.message(), "disk full");

        let err = JobError::retry("net", "timeout", Duration::from_secs(3));
        assert_eq!(err.to_string(), "net: timeout (retry in 3s)");
    }
}
