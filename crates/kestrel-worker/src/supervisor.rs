//! The master loop
//!
//! One cycle reserves a job, starts a job-child to run it and a watchdog to
//! guard its lease, waits for both, then reconnects and checks resource
//! limits. Only one job is in flight at a time.

use crate::control::{ChildRole, Control};
use crate::ipc::Channel;
use crate::launcher::Launcher;
use crate::limits::ResourceLimiter;
use crate::reserver::Reserver;
use crate::signals::SignalRouter;
use crate::title;
use kestrel_backend::Client;
use kestrel_core::{Job, WorkerConfig};
use kestrel_telemetry::{JobLogContext, WorkerLogContext};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn, Instrument};

/// Failure group the master uses for jobs whose child died
pub const FATAL_GROUP: &str = "system:fatal";

/// Errors that stop the supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A wait returned a process that is not one of this cycle's children
    #[error("reaped unexpected child process {0}")]
    UnexpectedChild(Pid),

    #[error("failed to spawn {role}: {source}")]
    Spawn {
        role: ChildRole,
        #[source]
        source: std::io::Error,
    },

    #[error("waiting for children failed: {0}")]
    Wait(Errno),

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
}

/// How a child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Code(i32),
    Signal(Signal),
}

/// Master-side supervisor
pub struct WorkerSupervisor<C: Client, L: Launcher> {
    client: C,
    launcher: L,
    reserver: Box<dyn Reserver>,
    name: String,
    interval: Duration,
    pause_interval: Duration,
    control: Arc<Control>,
    limiter: ResourceLimiter,
}

impl<C: Client, L: Launcher> WorkerSupervisor<C, L> {
    pub fn new(client: C, launcher: L, reserver: Box<dyn Reserver>, name: impl Into<String>) -> Self {
        let control = Arc::new(Control::new());
        Self {
            client,
            launcher,
            reserver,
            name: name.into(),
            interval: Duration::from_secs(5),
            pause_interval: Duration::from_millis(250),
            limiter: ResourceLimiter::new(Arc::clone(&control)),
            control,
        }
    }

    /// Apply polling and limit settings from `config`
    pub fn configure(&mut self, config: &WorkerConfig) {
        self.interval = Duration::from_secs(config.interval);
        self.pause_interval = Duration::from_millis(config.pause_interval_ms.max(1));
        self.limiter.set_max_jobs(config.max_jobs);
        self.limiter.set_time_limit(config.time_limit);
        self.limiter.set_memory_limit(config.memory_limit);
    }

    /// Seconds to sleep when no job is available; zero drains the queues once
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn control(&self) -> Arc<Control> {
        Arc::clone(&self.control)
    }

    pub fn limiter_mut(&mut self) -> &mut ResourceLimiter {
        &mut self.limiter
    }

    /// Graceful shutdown: finish the current cycle, then stop
    pub fn shutdown(&self) {
        self.control.shutdown();
    }

    /// Immediate shutdown: kill the children and stop
    pub fn shutdown_now(&self) {
        self.control.shutdown_now();
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    /// Kill the current children without stopping
    pub fn kill_children(&self) {
        self.control.kill_children();
    }

    /// Run until shut down, out of work with a zero interval, or broken
    pub async fn run(&mut self) -> Result<(), SupervisorError> {
        let context = WorkerLogContext::new(&self.name, "master", self.reserver.queue_names());
        let router = SignalRouter::register(Arc::clone(&self.control)).map_err(SupervisorError::Signals)?;

        info!(
            "Worker {} starting on queues {:?}",
            self.name,
            self.reserver.queue_names()
        );
        let span = context.span();
        let result = self.work().instrument(span).await;
        router.unregister();

        title::set("shutting down");
        if result.is_ok() {
            if let Err(e) = self.client.deregister_worker(&self.name).await {
                warn!("Failed to deregister worker {}: {}", self.name, e);
            }
            info!("Worker {} stopped", self.name);
        }
        result
    }

    async fn work(&mut self) -> Result<(), SupervisorError> {
        loop {
            if self.control.is_shutdown() {
                break;
            }

            if self.control.is_paused() {
                title::set("paused");
                while self.control.is_paused() && !self.control.is_shutdown() {
                    tokio::time::sleep(self.pause_interval).await;
                }
                continue;
            }

            title::set(&format!("waiting for {}", self.reserver.queue_names().join(",")));
            self.reserver.before_work();
            let job = match self.reserver.reserve(&self.name).await {
                Ok(job) => job,
                Err(e) => {
                    warn!("Failed to reserve a job: {}", e);
                    None
                }
            };

            let Some(job) = job else {
                if self.interval.is_zero() {
                    info!("No jobs available; exiting");
                    break;
                }
                debug!("No jobs available; sleeping {:?}", self.interval);
                self.idle(self.interval).await;
                continue;
            };

            let context = JobLogContext::new(job.jid.as_str(), &job.klass, &job.queue);
            if self.process(&job).instrument(context.span()).await? {
                self.limiter.record_job();
            }
            self.limiter.check_all();
        }
        Ok(())
    }

    /// Sleep up to `duration`, waking early on shutdown
    async fn idle(&self, duration: Duration) {
        let deadline = tokio::time::Instant::now() + duration;
        while !self.control.is_shutdown() {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep((deadline - now).min(self.pause_interval)).await;
        }
    }

    /// Run one claimed job through a job-child and a watchdog.
    ///
    /// Returns false when the cycle was skipped before a job-child started.
    async fn process(&self, job: &Job) -> Result<bool, SupervisorError> {
        title::set(&format!("processing {}", job.jid));
        info!("Reserved job {}", job.description());

        let (mut job_channel, mut watchdog_channel) = match (Channel::pair(), Channel::pair()) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to create IPC channel: {}; skipping job {}", e, job.jid);
                return Ok(false);
            }
        };

        let job_pid = self.spawn(
            ChildRole::JobChild,
            self.launcher.job_child(job, &self.name),
            &mut job_channel,
        )?;

        let watchdog_command = self.launcher.watchdog(job, &self.name, job_pid);
        if let Err(e) = self.spawn(ChildRole::Watchdog, watchdog_command, &mut watchdog_channel) {
            self.control.kill(ChildRole::JobChild);
            self.control.clear_pid(ChildRole::JobChild);
            if let Err(wait_err) = waitpid(job_pid, None) {
                debug!("Reaping job-child {} after failed spawn: {}", job_pid, wait_err);
            }
            return Err(e);
        }

        self.reap(job, &mut job_channel, &mut watchdog_channel).await?;

        drop(job_channel);
        drop(watchdog_channel);
        if let Err(e) = self.client.reconnect().await {
            debug!("Reconnect after cycle reported: {}", e);
        }
        Ok(true)
    }

    fn spawn(
        &self,
        role: ChildRole,
        mut command: std::process::Command,
        channel: &mut Channel,
    ) -> Result<Pid, SupervisorError> {
        let spawn_err = |source| SupervisorError::Spawn { role, source };
        channel.attach(&mut command).map_err(spawn_err)?;
        let child = command.spawn().map_err(spawn_err)?;

        // Reaped through waitpid, so only the pid is kept.
        let pid = Pid::from_raw(child.id() as i32);
        drop(child);

        self.control.set_pid(role, pid);
        if let Err(e) = channel.close_child() {
            warn!("Failed to finish IPC setup for {} {}: {}", role, pid, e);
        }
        debug!("Started {} {}", role, pid);
        Ok(pid)
    }

    /// Wait until both children are gone
    async fn reap(
        &self,
        job: &Job,
        job_channel: &mut Channel,
        watchdog_channel: &mut Channel,
    ) -> Result<(), SupervisorError> {
        while self.control.pid(ChildRole::JobChild).is_some()
            || self.control.pid(ChildRole::Watchdog).is_some()
        {
            let (pid, exit) = match wait_any().await {
                Ok(WaitStatus::Exited(pid, code)) => (pid, ChildExit::Code(code)),
                Ok(WaitStatus::Signaled(pid, signal, _)) => (pid, ChildExit::Signal(signal)),
                Ok(other) => {
                    debug!("Ignoring wait status {:?}", other);
                    continue;
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    warn!("No children left to wait for");
                    self.control.clear_pid(ChildRole::JobChild);
                    self.control.clear_pid(ChildRole::Watchdog);
                    break;
                }
                Err(e) => return Err(SupervisorError::Wait(e)),
            };

            match self.control.role_of(pid) {
                Some(ChildRole::JobChild) => {
                    self.control.clear_pid(ChildRole::JobChild);
                    self.job_child_exited(job, pid, exit, job_channel).await;
                    // The watchdog has nothing left to guard.
                    self.control.kill(ChildRole::Watchdog);
                }
                Some(ChildRole::Watchdog) => {
                    self.control.clear_pid(ChildRole::Watchdog);
                    watchdog_exited(pid, exit, watchdog_channel);
                }
                None => {
                    error!("Reaped unknown process {} ({:?})", pid, exit);
                    self.control.kill_children();
                    return Err(SupervisorError::UnexpectedChild(pid));
                }
            }
        }
        Ok(())
    }

    async fn job_child_exited(&self, job: &Job, pid: Pid, exit: ChildExit, channel: &mut Channel) {
        let message = match exit {
            ChildExit::Code(0) => {
                debug!("job-child {} finished job {}", pid, job.jid);
                return;
            }
            ChildExit::Code(code) => channel
                .receive()
                .map(|record| record.to_string())
                .unwrap_or_else(|| format!("process failed with status {}", code)),
            ChildExit::Signal(signal) => channel
                .receive()
                .map(|record| record.to_string())
                .unwrap_or_else(|| format!("process terminated by {}", signal)),
        };

        if exit == ChildExit::Signal(Signal::SIGKILL) {
            info!("job-child {} for job {} was killed: {}", pid, job.jid, message);
        } else {
            error!("job-child {} for job {} died: {}", pid, job.jid, message);
        }

        // After a lock-lost or cancel kill the backend refuses this, since the
        // job is no longer ours.
        if let Err(e) = self.client.fail(job, FATAL_GROUP, &message).await {
            info!("Did not fail job {}: {}", job.jid, e);
        }
    }
}

fn watchdog_exited(pid: Pid, exit: ChildExit, channel: &mut Channel) {
    match exit {
        ChildExit::Code(0) | ChildExit::Signal(Signal::SIGKILL) => {
            debug!("watchdog {} stopped ({:?})", pid, exit);
        }
        _ => match channel.receive() {
            Some(record) => warn!("watchdog {} died: {}", pid, record),
            None => warn!("watchdog {} died ({:?})", pid, exit),
        },
    }
}

/// Blocking wait for any child, off the async threads
async fn wait_any() -> Result<WaitStatus, Errno> {
    tokio::task::spawn_blocking(|| waitpid(Option::<Pid>::None, None))
        .await
        .unwrap_or(Err(Errno::EINTR))
}
