//! Job lifecycle events published by the backend

use crate::Jid;
use serde::{Deserialize, Serialize};

/// Pub/sub channel the backend publishes lifecycle events on
pub const EVENT_CHANNEL: &str = "ql:log";

/// Kind of lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Another worker took over the job after our lease lapsed
    LockLost,
    /// The job was canceled by an operator
    Canceled,
    /// The job completed
    Completed,
    /// The job failed
    Failed,
    /// Anything else the backend publishes (put, popped, timed-out, ...)
    #[serde(other)]
    Other,
}

/// A single lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Job the event is about
    pub jid: Jid,

    /// Event kind
    #[serde(rename = "event")]
    pub kind: EventKind,

    /// Worker the event concerns, when the backend includes one
    #[serde(default)]
    pub worker: Option<String>,

    /// Failure group, for failed events
    #[serde(default)]
    pub group: Option<String>,

    /// Failure message, for failed events
    #[serde(default)]
    pub message: Option<String>,
}

impl JobEvent {
    /// Create an event without failure details
    pub fn new(jid: Jid, kind: EventKind, worker: Option<String>) -> Self {
        Self {
            jid,
            kind,
            worker,
            group: None,
            message: None,
        }
    }

    /// Parse an event from a pub/sub payload
    pub fn parse(payload: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Whether the event concerns `worker`
    pub fn is_for_worker(&self, worker: &str) -> bool {
        self.worker.as_deref() == Some(worker)
    }
}
