//! Common test utilities and fixtures

use kestrel_core::Job;
use kestrel_worker::Launcher;
use nix::errno::Errno;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::process::Command;
use std::sync::{Mutex, MutexGuard, Once, PoisonError};

static INIT: Once = Once::new();
static PROCESS_LOCK: Mutex<()> = Mutex::new(());

/// Initialize test environment (logging, etc.)
pub fn init() {
    INIT.call_once(|| {
        // Set up test logging
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("kestrel_worker=debug,kestrel_backend=debug")
            .try_init();
    });
}

/// Check if Redis is available for integration tests
pub async fn redis_available() -> bool {
    use std::time::Duration;

    matches!(
        tokio::time::timeout(
            Duration::from_secs(1),
            tokio::net::TcpStream::connect("localhost:6379"),
        )
        .await,
        Ok(Ok(_))
    )
}

/// Generate a unique test queue name
pub fn unique_queue(prefix: &str) -> String {
    format!("{}_{}", prefix, &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// Serialise tests that run a supervisor.
///
/// The supervisor waits for *any* child of the test process, so two
/// supervisors in one test binary would steal each other's children.
pub fn process_lock() -> MutexGuard<'static, ()> {
    let guard = PROCESS_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    reap_strays();
    guard
}

/// Wait for every remaining child of this process
pub fn reap_strays() {
    loop {
        match waitpid(Option::<Pid>::None, None) {
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
}

/// Launcher whose children are `/bin/sh -c` scripts.
///
/// Scripts see `JID`, `WORKER` and, for the watchdog, `SIBLING`. The error
/// channel is on descriptor 3.
#[derive(Debug, Clone)]
pub struct ScriptLauncher {
    pub job_child: String,
    pub watchdog: String,
}

impl ScriptLauncher {
    pub fn new(job_child: impl Into<String>) -> Self {
        Self {
            job_child: job_child.into(),
            watchdog: "sleep 30".to_string(),
        }
    }

    pub fn with_watchdog(mut self, script: impl Into<String>) -> Self {
        self.watchdog = script.into();
        self
    }

    fn command(script: &str, job: &Job, worker: &str) -> Command {
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(script)
            .env("JID", job.jid.as_str())
            .env("WORKER", worker);
        command
    }
}

impl Launcher for ScriptLauncher {
    fn job_child(&self, job: &Job, worker: &str) -> Command {
        Self::command(&self.job_child, job, worker)
    }

    fn watchdog(&self, job: &Job, worker: &str, sibling: Pid) -> Command {
        let mut command = Self::command(&self.watchdog, job, worker);
        command.env("SIBLING", sibling.to_string());
        command
    }
}
