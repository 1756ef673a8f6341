//! Signal routing for the master process
//!
//! | Signal          | Action                                  |
//! |-----------------|-----------------------------------------|
//! | TERM, INT       | shutdown now, killing live children     |
//! | QUIT            | shutdown after the current cycle        |
//! | USR1            | kill children, keep polling             |
//! | USR2            | pause                                   |
//! | CONT            | resume                                  |
//!
//! tokio installs its OS-level handler once per process and never removes it,
//! so the master only ever stops its routing task. Children start by
//! restoring default dispositions so that signals sent to the whole process
//! group do not run master logic inside them.

use crate::control::Control;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Signals the router claims
pub const ROUTED_SIGNALS: [Signal; 6] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGCONT,
];

/// Handle on the installed router; dropping it without
/// [`SignalRouter::unregister`] leaves the handlers in place.
pub struct SignalRouter {
    task: JoinHandle<()>,
}

impl SignalRouter {
    /// Install handlers that drive `control`
    pub fn register(control: Arc<Control>) -> std::io::Result<Self> {
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let mut quit = signal(SignalKind::quit())?;
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let mut usr2 = signal(SignalKind::user_defined2())?;
        let mut cont = signal(SignalKind::from_raw(libc::SIGCONT))?;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(()) = term.recv() => {
                        info!("Received SIGTERM");
                        control.shutdown_now();
                    }
                    Some(()) = int.recv() => {
                        info!("Received SIGINT");
                        control.shutdown_now();
                    }
                    Some(()) = quit.recv() => {
                        info!("Received SIGQUIT");
                        control.shutdown();
                    }
                    Some(()) = usr1.recv() => {
                        info!("Received SIGUSR1; killing children");
                        control.kill_children();
                    }
                    Some(()) = usr2.recv() => {
                        info!("Received SIGUSR2");
                        control.pause();
                    }
                    Some(()) = cont.recv() => {
                        info!("Received SIGCONT");
                        control.resume();
                    }
                    else => break,
                }
            }
        });

        debug!("Signal router installed");
        Ok(Self { task })
    }

    /// Stop routing. Routed signals that arrive afterwards are absorbed
    /// until the next [`SignalRouter::register`].
    pub fn unregister(self) {
        self.task.abort();
        debug!("Signal router removed");
    }
}

/// Reset every routed signal to its default disposition.
///
/// Only for child processes: once reset, tokio cannot route these signals
/// again in this process.
pub fn restore_default_dispositions() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in ROUTED_SIGNALS {
        // SAFETY: installing SIG_DFL does not run any code in signal context.
        if let Err(e) = unsafe { sigaction(sig, &default) } {
            warn!("Failed to restore default handler for {}: {}", sig, e);
        }
    }
}
