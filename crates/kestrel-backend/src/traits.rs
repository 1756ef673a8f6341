//! Backend trait definitions

use async_trait::async_trait;
use futures::stream::BoxStream;
use kestrel_core::{BackendConfig, Jid, Job, JobEvent};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Stream of lifecycle events from a subscription
pub type EventStream = BoxStream<'static, JobEvent>;

/// Errors that can occur during backend operations
#[derive(Error, Debug)]
pub enum BackendError {
    /// Connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// The engine rejected a command
    #[error("{command} failed: {message}")]
    Command { command: String, message: String },

    /// The job is leased to someone else (or to nobody)
    #[error("lease lost on job {0}")]
    LeaseLost(Jid),

    /// Job not found
    #[error("job not found: {0}")]
    NotFound(Jid),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Pool error
    #[error("connection pool error: {0}")]
    Pool(String),

    /// Subscription error
    #[error("subscription error: {0}")]
    Subscription(String),
}

impl From<kestrel_core::Error> for BackendError {
    fn from(err: kestrel_core::Error) -> Self {
        BackendError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Serialization(err.to_string())
    }
}

/// A named handle on a remote queue
#[async_trait]
pub trait Queue: Send + Sync {
    /// Queue name
    fn name(&self) -> &str;

    /// Claim at most one job for `worker`, without blocking
    async fn pop(&self, worker: &str) -> BackendResult<Option<Job>>;

    /// Number of waiting jobs
    async fn length(&self) -> BackendResult<u64>;

    /// Whether the queue is paused
    async fn is_paused(&self) -> BackendResult<bool>;
}

/// Connection to the queue engine
#[async_trait]
pub trait Client: Send + Sync + Clone + 'static {
    /// Connect to the backend
    async fn connect(config: &BackendConfig) -> BackendResult<Self>
    where
        Self: Sized;

    /// Drop the current connection and establish a fresh one
    async fn reconnect(&self) -> BackendResult<()>;

    /// Handle on a named queue
    fn queue(&self, name: &str) -> Arc<dyn Queue>;

    /// Fetch a job by jid
    async fn get_job(&self, jid: &Jid) -> BackendResult<Option<Job>>;

    /// Complete a job, optionally replacing its data
    async fn complete(&self, job: &Job, data: Option<&serde_json::Value>) -> BackendResult<()>;

    /// Fail a job with a categorical group and free-text message
    async fn fail(&self, job: &Job, group: &str, message: &str) -> BackendResult<()>;

    /// Put a job back on its queue after `delay`, consuming one retry
    async fn retry(&self, job: &Job, group: &str, message: &str, delay: Duration)
        -> BackendResult<()>;

    /// Renew the lease on a job
    async fn heartbeat(&self, job: &Job) -> BackendResult<()>;

    /// Subscribe to lifecycle events on the given channels
    async fn subscribe(&self, channels: &[&str]) -> BackendResult<EventStream>;

    /// Remove a worker from the backend's worker registry
    async fn deregister_worker(&self, name: &str) -> BackendResult<()>;
}
