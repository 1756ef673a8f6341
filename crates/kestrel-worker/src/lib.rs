//! Kestrel Worker - process supervisor for queue jobs
//!
//! The master reserves one job at a time and runs it in two short-lived
//! child processes:
//! - a job-child that executes the handler and reports the outcome
//! - a watchdog that kills the job-child when its lease is lost or the job
//!   is canceled
//!
//! Resource limits, signals and the per-child error channel live here too.

pub mod child;
pub mod cli;
pub mod control;
pub mod executor;
pub mod ipc;
pub mod launcher;
pub mod limits;
pub mod reserver;
pub mod signals;
pub mod supervisor;
pub mod title;
pub mod watchdog;

pub use control::{ChildRole, Control};
pub use executor::{builtin_registry, HandlerRegistry, JobError, JobHandler, PerformResult};
pub use ipc::{ErrorRecord, FatalKind};
pub use launcher::{Launcher, SelfExecLauncher};
pub use limits::ResourceLimiter;
pub use reserver::{
    OrderedReserver, PriorityReserver, Reserver, RoundRobinReserver, ShuffledRoundRobinReserver,
};
pub use supervisor::{SupervisorError, WorkerSupervisor, FATAL_GROUP};
