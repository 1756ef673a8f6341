//! Job handles and lifecycle states

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(pub String);

impl Jid {
    /// Generate a new random job ID (hex, no dashes, the way the backend mints them)
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Jid {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Jid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Jid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Jid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Backend-side state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Queued, waiting for a worker
    Waiting,
    /// Leased to a worker
    Running,
    /// Lease expired without a heartbeat
    Stalled,
    /// Delayed until a future time
    Scheduled,
    /// Blocked on other jobs
    Depends,
    /// Finished successfully
    Complete,
    /// Finished with a failure
    Failed,
}

impl JobState {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Running => "running",
            JobState::Stalled => "stalled",
            JobState::Scheduled => "scheduled",
            JobState::Depends => "depends",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A job handle as held by one process.
///
/// Handles are plain data: every process (master, job-child, watchdog) fetches
/// its own copy from the backend by [`Jid`] and never hands it to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job identifier
    pub jid: Jid,

    /// Handler reference, resolved through the handler registry
    pub klass: String,

    /// Queue the job was popped from
    pub queue: String,

    /// Current state
    pub state: JobState,

    /// Worker currently holding the lease, if any
    #[serde(default)]
    pub worker: Option<String>,

    /// Lease expiry as seconds since the epoch
    #[serde(default)]
    pub expires: Option<f64>,

    /// Retries allowed in total
    #[serde(default)]
    pub retries: u32,

    /// Retries left before the job fails for good
    #[serde(default)]
    pub remaining: i64,

    /// Job priority inside its queue
    #[serde(default)]
    pub priority: i64,

    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// Payload
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Job {
    /// Create a waiting job with a fresh jid
    pub fn new(klass: impl Into<String>, queue: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            jid: Jid::new(),
            klass: klass.into(),
            queue: queue.into(),
            state: JobState::Waiting,
            worker: None,
            expires: None,
            retries: 5,
            remaining: 5,
            priority: 0,
            tags: Vec::new(),
            data,
        }
    }

    /// Set the retry budget
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self.remaining = i64::from(retries);
        self
    }

    /// Lease expiry as a timestamp
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let secs = self.expires?;
        let whole = secs.trunc() as i64;
        let nanos = (secs.fract() * 1e9) as u32;
        Utc.timestamp_opt(whole, nanos).single()
    }

    /// Seconds left on the lease, negative once it has lapsed
    pub fn ttl(&self) -> Option<f64> {
        let expires = self.expires?;
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        Some(expires - now)
    }

    /// Whether `worker` holds the lease on this job
    pub fn is_leased_by(&self, worker: &str) -> bool {
        self.state == JobState::Running && self.worker.as_deref() == Some(worker)
    }

    /// Short description used in logs and process titles
    pub fn description(&self) -> String {
        format!("{} ({} / {})", self.jid, self.klass, self.queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jid_generation_is_unique() {
        let a = Jid::new();
        let b = Jid::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(!a.as_str().contains('-'));
    }

    #[test]
    fn test_job_deserializes_backend_shape() {
        let raw = serde_json::json!({
            "jid": "abc",
            "klass": "echo",
            "queue": "testing",
            "state": "running",
            "worker": "host-1",
            "expires": 1700000000.5,
            "retries": 5,
            "remaining": 4,
            "priority": 0,
            "tags": ["a"],
            "data": {"n": 1}
        });
        let job: Job = serde_json::from_value(raw).unwrap();
        assert_eq!(job.jid, Jid::from("abc"));
        assert_eq!(job.state, JobState::Running);
        assert!(job.is_leased_by("host-1"));
        assert!(!job.is_leased_by("host-2"));
        assert_eq!(job.expires_at().unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Complete.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Waiting.is_terminal());
    }

    #[test]
    fn test_retry_budget() {
        let job = Job::new("echo", "q", serde_json::Value::Null).with_retries(2);
        assert_eq!(job.retries, 2);
        assert_eq!(job.remaining, 2);
        assert_eq!(job.state, JobState::Waiting);
        assert!(job.ttl().is_none());
    }
}
