//! Lease watchdog
//!
//! Runs in its own process next to the job-child. It follows the backend's
//! lifecycle events for the cycle's job and SIGKILLs the job-child when the
//! job is canceled or its lease is handed to someone else.

use futures::{Stream, StreamExt};
use kestrel_backend::{BackendResult, Client};
use kestrel_core::{EventKind, Jid, JobEvent, EVENT_CHANNEL};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

/// Why the watchdog stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The job-child was killed in response to this event
    Killed(EventKind),
    /// The job completed or failed; nothing to do
    JobFinished(EventKind),
    /// The subscription closed
    StreamEnded,
}

/// Follow `events` until one settles the job identified by `jid`.
///
/// `kill` is called at most once, for lock-lost or canceled events addressed
/// to `worker`.
pub async fn watch<S, K>(mut events: S, jid: &Jid, worker: &str, kill: K) -> WatchOutcome
where
    S: Stream<Item = JobEvent> + Unpin,
    K: FnOnce(),
{
    while let Some(event) = events.next().await {
        if &event.jid != jid {
            continue;
        }
        match event.kind {
            EventKind::LockLost | EventKind::Canceled => {
                if !event.is_for_worker(worker) {
                    debug!(
                        "Ignoring {:?} for job {} addressed to {:?}",
                        event.kind, jid, event.worker
                    );
                    continue;
                }
                info!("Job {} {:?}; killing job-child", jid, event.kind);
                kill();
                return WatchOutcome::Killed(event.kind);
            }
            EventKind::Completed | EventKind::Failed => {
                debug!("Job {} {:?}; watchdog done", jid, event.kind);
                return WatchOutcome::JobFinished(event.kind);
            }
            EventKind::Other => {}
        }
    }
    WatchOutcome::StreamEnded
}

/// Subscribe through `client` and guard `sibling`
pub async fn run<C: Client>(
    client: &C,
    jid: &Jid,
    worker: &str,
    sibling: Pid,
) -> BackendResult<WatchOutcome> {
    let events = client.subscribe(&[EVENT_CHANNEL]).await?;
    debug!("Watching job {} for job-child {}", jid, sibling);

    Ok(watch(events, jid, worker, || {
        if let Err(e) = kill(sibling, Signal::SIGKILL) {
            warn!("Failed to kill job-child {}: {}", sibling, e);
        }
    })
    .await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::cell::Cell;

    fn event(jid: &str, kind: EventKind, worker: Option<&str>) -> JobEvent {
        JobEvent::new(Jid::from(jid), kind, worker.map(String::from))
    }

    #[tokio::test]
    async fn test_lock_lost_kills_sibling() {
        let killed = Cell::new(0);
        let events = stream::iter(vec![
            event("other", EventKind::LockLost, Some("w1")),
            event("j1", EventKind::LockLost, Some("w1")),
            event("j1", EventKind::Completed, None),
        ]);

        let outcome = watch(events, &Jid::from("j1"), "w1", || killed.set(killed.get() + 1)).await;
        assert_eq!(outcome, WatchOutcome::Killed(EventKind::LockLost));
        assert_eq!(killed.get(), 1);
    }

    #[tokio::test]
    async fn test_cancel_kills_sibling() {
        let killed = Cell::new(false);
        let events = stream::iter(vec![event("j1", EventKind::Canceled, Some("w1"))]);
        let outcome = watch(events, &Jid::from("j1"), "w1", || killed.set(true)).await;
        assert_eq!(outcome, WatchOutcome::Killed(EventKind::Canceled));
        assert!(killed.get());
    }

    #[tokio::test]
    async fn test_completion_stops_without_kill() {
        let killed = Cell::new(false);
        let events = stream::iter(vec![
            event("j1", EventKind::Other, None),
            event("j1", EventKind::Failed, Some("w1")),
            event("j1", EventKind::Canceled, Some("w1")),
        ]);
        let outcome = watch(events, &Jid::from("j1"), "w1", || killed.set(true)).await;
        assert_eq!(outcome, WatchOutcome::JobFinished(EventKind::Failed));
        assert!(!killed.get());
    }

    #[tokio::test]
    async fn test_events_for_other_workers_are_ignored() {
        let killed = Cell::new(false);
        let events = stream::iter(vec![
            event("j1", EventKind::LockLost, Some("w2")),
            event("j2", EventKind::Canceled, Some("w1")),
        ]);
        let outcome = watch(events, &Jid::from("j1"), "w1", || killed.set(true)).await;
        assert_eq!(outcome, WatchOutcome::StreamEnded);
        assert!(!killed.get());
    }

    #[tokio::test]
    async fn test_run_against_memory_backend() {
        use kestrel_backend::{MemoryClient, Queue};
        use serde_json::json;

        let client = MemoryClient::new();
        let jid = client.put_job("q", "sleep", json!(null));
        let job = client.queue("q").pop("w1").await.unwrap().unwrap();
        assert_eq!(job.jid, jid);

        let mut sleeper = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let sibling = Pid::from_raw(sleeper.id() as i32);

        let watcher = {
            let client = client.clone();
            let jid = jid.clone();
            tokio::spawn(async move { run(&client, &jid, "w1", sibling).await })
        };
        // Give the watcher time to subscribe before the lease moves.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        client.lose_lock(&jid, "w2");

        let outcome = watcher.await.unwrap().unwrap();
        assert_eq!(outcome, WatchOutcome::Killed(EventKind::LockLost));

        use std::os::unix::process::ExitStatusExt;
        assert_eq!(sleeper.wait().unwrap().signal(), Some(libc::SIGKILL));
    }
}
