//! Kestrel Core - Core types shared by the Kestrel worker runtime
//!
//! This crate provides the fundamental building blocks for Kestrel:
//! - Job handles and lifecycle states
//! - Backend lifecycle events
//! - Configuration structures
//! - Error types

pub mod config;
pub mod error;
pub mod event;
pub mod job;

pub use config::{
    BackendConfig, KestrelConfig, LoggingConfig, ReserverKind, WorkerConfig, CHILD_CONFIG_ENV,
};
pub use error::{Error, Result};
pub use event::{EventKind, JobEvent, EVENT_CHANNEL};
pub use job::{Jid, Job, JobState};
