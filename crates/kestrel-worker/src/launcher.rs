//! How the master starts its per-cycle children
//!
//! The supervisor never forks its async runtime. Each child is a fresh
//! process, by default this same binary re-executed with a hidden role
//! subcommand and the master's effective configuration in its environment.

use kestrel_core::{Job, KestrelConfig, CHILD_CONFIG_ENV};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Command;

/// Builds the commands for the two children of a cycle
pub trait Launcher: Send + Sync {
    /// Command that runs `job` to completion as `worker`
    fn job_child(&self, job: &Job, worker: &str) -> Command;

    /// Command that guards the job-child `sibling`
    fn watchdog(&self, job: &Job, worker: &str, sibling: Pid) -> Command;
}

/// Re-executes the current binary
#[derive(Debug, Clone)]
pub struct SelfExecLauncher {
    program: PathBuf,
    child_config: String,
}

impl SelfExecLauncher {
    /// Launch `std::env::current_exe()` with `config` handed down
    pub fn new(config: &KestrelConfig) -> kestrel_core::Result<Self> {
        Ok(Self::with_program(std::env::current_exe()?, config.to_child_env()?))
    }

    pub fn with_program(program: impl Into<PathBuf>, child_config: String) -> Self {
        Self {
            program: program.into(),
            child_config,
        }
    }

    fn command(&self, role: &str, job: &Job, worker: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg(role)
            .arg("--jid")
            .arg(job.jid.as_str())
            .arg("--worker")
            .arg(worker)
            .env(CHILD_CONFIG_ENV, &self.child_config);
        command
    }
}

impl Launcher for SelfExecLauncher {
    fn job_child(&self, job: &Job, worker: &str) -> Command {
        self.command("job-child", job, worker)
    }

    fn watchdog(&self, job: &Job, worker: &str, sibling: Pid) -> Command {
        let mut command = self.command("watchdog", job, worker);
        command.arg("--sibling").arg(sibling.to_string());
        command
    }
}
