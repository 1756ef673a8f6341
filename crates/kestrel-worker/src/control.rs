//! Flags and child pids shared between the supervisor loop and the signal router

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tracing::{debug, info, warn};

/// Which of the two per-cycle children a pid belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildRole {
    JobChild,
    Watchdog,
}

impl ChildRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildRole::JobChild => "job-child",
            ChildRole::Watchdog => "watchdog",
        }
    }
}

impl std::fmt::Display for ChildRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervisor state reachable from signal handlers.
///
/// Pids are stored as raw integers with `0` meaning "no child".
#[derive(Debug, Default)]
pub struct Control {
    shutdown: AtomicBool,
    paused: AtomicBool,
    job_child: AtomicI32,
    watchdog: AtomicI32,
}

impl Control {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop once the current cycle finishes
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!("Graceful shutdown requested");
        }
    }

    /// Stop now, killing any live children
    pub fn shutdown_now(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        info!("Immediate shutdown requested");
        self.kill_children();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("Paused; send SIGCONT to resume");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("Resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// SIGKILL the job-child and watchdog, if running
    pub fn kill_children(&self) {
        self.kill(ChildRole::JobChild);
        self.kill(ChildRole::Watchdog);
    }

    /// SIGKILL one child, if running
    pub fn kill(&self, role: ChildRole) {
        let Some(pid) = self.pid(role) else {
            return;
        };
        match kill(pid, Signal::SIGKILL) {
            Ok(()) => debug!("Killed {} {}", role, pid),
            // Already gone between the check and the kill.
            Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => warn!("Failed to kill {} {}: {}", role, pid, e),
        }
    }

    pub fn set_pid(&self, role: ChildRole, pid: Pid) {
        self.slot(role).store(pid.as_raw(), Ordering::SeqCst);
    }

    pub fn clear_pid(&self, role: ChildRole) {
        self.slot(role).store(0, Ordering::SeqCst);
    }

    pub fn pid(&self, role: ChildRole) -> Option<Pid> {
        match self.slot(role).load(Ordering::SeqCst) {
            0 => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }

    /// Role of a reaped pid, if it is one of ours
    pub fn role_of(&self, pid: Pid) -> Option<ChildRole> {
        [ChildRole::JobChild, ChildRole::Watchdog]
            .into_iter()
            .find(|role| self.pid(*role) == Some(pid))
    }

    fn slot(&self, role: ChildRole) -> &AtomicI32 {
        match role {
            ChildRole::JobChild => &self.job_child,
            ChildRole::Watchdog => &self.watchdog,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_is_idempotent() {
        let control = Control::new();
        control.shutdown();
        control.shutdown();
        assert!(control.is_shutdown());
        control.shutdown_now();
        assert!(control.is_shutdown());
    }

    #[test]
    fn test_pause_and_resume() {
        let control = Control::new();
        assert!(!control.is_paused());
        control.pause();
        control.pause();
        assert!(control.is_paused());
        control.resume();
        assert!(!control.is_paused());
        assert!(!control.is_shutdown());
    }

    #[test]
    fn test_pid_bookkeeping() {
        let control = Control::new();
        assert_eq!(control.pid(ChildRole::JobChild), None);

        control.set_pid(ChildRole::JobChild, Pid::from_raw(4242));
        control.set_pid(ChildRole::Watchdog, Pid::from_raw(4243));
        assert_eq!(control.role_of(Pid::from_raw(4242)), Some(ChildRole::JobChild));
        assert_eq!(control.role_of(Pid::from_raw(4243)), Some(ChildRole::Watchdog));
        assert_eq!(control.role_of(Pid::from_raw(1)), None);

        control.clear_pid(ChildRole::JobChild);
        assert_eq!(control.role_of(Pid::from_raw(4242)), None);
    }

    #[test]
    fn test_kill_without_children_is_a_no_op() {
        let control = Control::new();
        control.kill_children();
    }

    #[test]
    fn test_kill_reaches_live_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let control = Control::new();
        control.set_pid(ChildRole::JobChild, Pid::from_raw(child.id() as i32));
        control.kill_children();

        let status = child.wait().unwrap();
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }
}
