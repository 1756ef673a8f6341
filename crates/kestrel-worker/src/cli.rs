//! Command line interface

use clap::{Args, Parser, Subcommand};
use kestrel_core::{KestrelConfig, ReserverKind};
use std::path::PathBuf;

/// Kestrel worker - supervises queue jobs in isolated processes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Reserve and run jobs until stopped
    Work(WorkArgs),

    /// Run one job (started by the master)
    #[command(hide = true)]
    JobChild(JobChildArgs),

    /// Guard a running job-child (started by the master)
    #[command(hide = true)]
    Watchdog(WatchdogArgs),
}

#[derive(Args, Debug, Default)]
pub struct WorkArgs {
    /// Configuration file path
    #[arg(short, long, env = "KESTREL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Worker name (defaults to <hostname>-<pid>)
    #[arg(long)]
    pub name: Option<String>,

    /// Queues to reserve from (comma-separated)
    #[arg(short, long, value_delimiter = ',')]
    pub queues: Option<Vec<String>>,

    /// Reservation strategy: ordered, priority, round-robin, shuffled-round-robin
    #[arg(short, long)]
    pub reserver: Option<ReserverKind>,

    /// Seconds to sleep when idle; 0 drains the queues once and exits
    #[arg(short, long)]
    pub interval: Option<u64>,

    /// Stop after this many jobs
    #[arg(long)]
    pub max_jobs: Option<u64>,

    /// Stop after this many seconds
    #[arg(long)]
    pub time_limit: Option<u64>,

    /// Stop once peak memory exceeds this many bytes
    #[arg(long)]
    pub memory_limit: Option<u64>,

    /// Backend URL
    #[arg(long)]
    pub backend_url: Option<String>,

    /// Log level or filter directive
    #[arg(long, env = "KESTREL_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format: compact, pretty or json
    #[arg(long, env = "KESTREL_LOG_FORMAT")]
    pub log_format: Option<String>,
}

impl WorkArgs {
    /// Override `config` with whatever was given on the command line
    pub fn apply(&self, config: &mut KestrelConfig) {
        if let Some(name) = &self.name {
            config.worker.name = Some(name.clone());
        }
        if let Some(queues) = &self.queues {
            config.worker.queues = queues.clone();
        }
        if let Some(reserver) = self.reserver {
            config.worker.reserver = reserver;
        }
        if let Some(interval) = self.interval {
            config.worker.interval = interval;
        }
        if self.max_jobs.is_some() {
            config.worker.max_jobs = self.max_jobs;
        }
        if self.time_limit.is_some() {
            config.worker.time_limit = self.time_limit;
        }
        if self.memory_limit.is_some() {
            config.worker.memory_limit = self.memory_limit;
        }
        if let Some(url) = &self.backend_url {
            config.backend.url = url.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = format.clone();
        }
    }
}

#[derive(Args, Debug)]
pub struct JobChildArgs {
    #[arg(long)]
    pub jid: String,

    #[arg(long)]
    pub worker: String,
}

#[derive(Args, Debug)]
pub struct WatchdogArgs {
    #[arg(long)]
    pub jid: String,

    #[arg(long)]
    pub worker: String,

    /// Pid of the job-child to kill when the lease is lost
    #[arg(long)]
    pub sibling: i32,
}
