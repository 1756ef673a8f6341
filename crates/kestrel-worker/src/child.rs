//! Entry points for the job-child and watchdog processes
//!
//! Both start by dropping the master's signal handling, pick up the error
//! channel inherited from the master and build their own backend connection.
//! Anything that makes them give up is written to the channel as an
//! [`ErrorRecord`] before the process exits with a failure status.

use crate::executor::{HandlerRegistry, JobError};
use crate::ipc::{ChildEnd, ErrorRecord, FatalKind};
use crate::signals::restore_default_dispositions;
use crate::{title, watchdog};
use futures::FutureExt;
use kestrel_backend::{BackendError, Client};
use kestrel_core::{Jid, Job, KestrelConfig};
use kestrel_telemetry::{log_job_completed, log_job_failed, log_job_started, JobLogContext};
use nix::unistd::Pid;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, Once, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn, Instrument};

/// Failure group for jobs whose class has no handler
pub const UNKNOWN_HANDLER_GROUP: &str = "system:unknown-handler";

static LAST_PANIC: Mutex<Option<ErrorRecord>> = Mutex::new(None);
static PANIC_HOOK: Once = Once::new();

/// A child process gave up; the record has already been sent to the master
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ChildFailed(pub ErrorRecord);

/// Remember where the last panic happened, then defer to the previous hook
pub fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let (file, line) = info
                .location()
                .map(|l| (l.file().to_string(), l.line()))
                .unwrap_or_else(|| ("<unknown>".to_string(), 0));
            let record = ErrorRecord::new(FatalKind::Panic, file, line, panic_message(info.payload()));
            *LAST_PANIC.lock().unwrap_or_else(PoisonError::into_inner) = Some(record);
            previous(info);
        }));
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

fn panic_record(payload: Box<dyn Any + Send>) -> ErrorRecord {
    let message = panic_message(payload.as_ref());
    LAST_PANIC
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .filter(|record| record.message == message)
        .unwrap_or_else(|| ErrorRecord::here(FatalKind::Panic, message))
}

fn backend_record(context: &str, err: &BackendError) -> ErrorRecord {
    ErrorRecord::here(FatalKind::Backend, format!("{}: {}", context, err))
}

/// Run one job and report its outcome to the backend.
///
/// Handler errors are reported with `fail` or `retry` and are not an error
/// here. A panicking handler or a backend that cannot take the outcome is.
pub async fn perform_job<C: Client>(
    client: &C,
    registry: &HandlerRegistry,
    jid: &Jid,
    worker: &str,
) -> Result<(), ErrorRecord> {
    let job = match client.get_job(jid).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            warn!("Job {} no longer exists; nothing to do", jid);
            return Ok(());
        }
        Err(e) => return Err(backend_record("failed to load job", &e)),
    };
    if !job.is_leased_by(worker) {
        warn!(
            "Job {} is leased by {:?}, not {}; skipping",
            jid, job.worker, worker
        );
        return Ok(());
    }

    let context = JobLogContext::new(job.jid.as_str(), &job.klass, &job.queue);
    run_handler(client, registry, &job)
        .instrument(context.span())
        .await
}

async fn run_handler<C: Client>(
    client: &C,
    registry: &HandlerRegistry,
    job: &Job,
) -> Result<(), ErrorRecord> {
    let Some(handler) = registry.resolve(&job.klass) else {
        let message = format!("no handler registered for class {}", job.klass);
        log_job_failed!(job.jid, job.klass, job.queue, UNKNOWN_HANDLER_GROUP, message);
        return client
            .fail(job, UNKNOWN_HANDLER_GROUP, &message)
            .await
            .map_err(|e| backend_record("failed to fail job", &e));
    };

    log_job_started!(job.jid, job.klass, job.queue);
    let started = Instant::now();
    let outcome = AssertUnwindSafe(handler.perform(job))
        .catch_unwind()
        .await
        .map_err(panic_record)?;

    let reported = match outcome {
        Ok(data) => {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            log_job_completed!(job.jid, job.klass, job.queue, elapsed_ms);
            client.complete(job, data.as_ref()).await
        }
        Err(JobError::Failed { group, message }) => {
            log_job_failed!(job.jid, job.klass, job.queue, group, message);
            client.fail(job, &group, &message).await
        }
        Err(JobError::Retry {
            group,
            message,
            delay,
        }) => {
            info!(jid = %job.jid, group = %group, "Retrying job in {:?}: {}", delay, message);
            client.retry(job, &group, &message, delay).await
        }
    };
    reported.map_err(|e| backend_record("failed to report job outcome", &e))
}

/// Body of the `job-child` process
pub async fn run_job_child<C: Client>(
    config: &KestrelConfig,
    registry: &HandlerRegistry,
    jid: &Jid,
    worker: &str,
) -> Result<(), ChildFailed> {
    restore_default_dispositions();
    install_panic_hook();
    let mut ipc = ChildEnd::inherited();
    title::set(&format!("processing {}", jid));

    let result = match C::connect(&config.backend).await {
        Ok(client) => perform_job(&client, registry, jid, worker).await,
        Err(e) => Err(backend_record("failed to connect", &e)),
    };
    result.map_err(|record| give_up(ipc.as_mut(), record))
}

/// Body of the `watchdog` process
pub async fn run_watchdog<C: Client>(
    config: &KestrelConfig,
    jid: &Jid,
    worker: &str,
    sibling: Pid,
) -> Result<(), ChildFailed> {
    restore_default_dispositions();
    let mut ipc = ChildEnd::inherited();
    title::set(&format!("watching {}", jid));

    let client = C::connect(&config.backend)
        .await
        .map_err(|e| give_up(ipc.as_mut(), backend_record("failed to connect", &e)))?;
    let outcome = watchdog::run(&client, jid, worker, sibling)
        .await
        .map_err(|e| give_up(ipc.as_mut(), backend_record("failed to subscribe", &e)))?;
    info!("Watchdog for job {} finished: {:?}", jid, outcome);
    Ok(())
}

fn give_up(ipc: Option<&mut ChildEnd>, record: ErrorRecord) -> ChildFailed {
    error!(kind = ?record.kind, "{}", record);
    match ipc {
        Some(end) => {
            if let Err(e) = end.send(&record) {
                warn!("Failed to send error record to master: {}", e);
            }
        }
        None => warn!("No channel to the master; error record dropped"),
    }
    ChildFailed(record)
}
