//! In-process backend
//!
//! Keeps queues, leases and lifecycle events in memory. Only useful inside a
//! single process: children spawned by the supervisor cannot see it, so the
//! worker binary refuses `memory://` URLs. Tests use it to drive reservers and
//! the supervisor loop, and to inspect which queues were polled.

use crate::traits::{BackendError, BackendResult, Client, EventStream, Queue};
use async_trait::async_trait;
use futures::StreamExt;
use kestrel_core::{BackendConfig, EventKind, Jid, Job, JobEvent, JobState};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

/// Lease granted on pop, in seconds
const LEASE_SECS: f64 = 60.0;

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Jid>>,
    jobs: HashMap<Jid, Job>,
    failures: HashMap<Jid, (String, String)>,
    paused: HashSet<String>,
    pops: Vec<String>,
    deregistered: Vec<String>,
    reconnects: usize,
}

/// In-memory client
#[derive(Clone)]
pub struct MemoryClient {
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<JobEvent>,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    /// Create an empty backend
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: JobEvent) {
        // No subscribers is fine; events are fire-and-forget like pub/sub.
        let _ = self.events.send(event);
    }

    /// Enqueue a job on `queue`
    pub fn put(&self, queue: &str, mut job: Job) -> Jid {
        job.queue = queue.to_string();
        job.state = JobState::Waiting;
        job.worker = None;
        job.expires = None;
        let jid = job.jid.clone();

        let mut state = self.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(jid.clone());
        state.jobs.insert(jid.clone(), job);
        jid
    }

    /// Enqueue a fresh job of class `klass` on `queue`
    pub fn put_job(&self, queue: &str, klass: &str, data: serde_json::Value) -> Jid {
        self.put(queue, Job::new(klass, queue, data))
    }

    /// Cancel a job, notifying its current lease holder
    pub fn cancel(&self, jid: &Jid) {
        let removed = {
            let mut state = self.lock();
            for queue in state.queues.values_mut() {
                queue.retain(|j| j != jid);
            }
            state.jobs.remove(jid)
        };
        if let Some(job) = removed {
            self.publish(JobEvent::new(jid.clone(), EventKind::Canceled, job.worker));
        }
    }

    /// Hand the job's lease to `thief`, notifying the previous holder
    pub fn lose_lock(&self, jid: &Jid, thief: &str) {
        let previous = {
            let mut state = self.lock();
            state
                .jobs
                .get_mut(jid)
                .and_then(|job| job.worker.replace(thief.to_string()))
        };
        if let Some(worker) = previous {
            self.publish(JobEvent::new(jid.clone(), EventKind::LockLost, Some(worker)));
        }
    }

    /// Pause a queue so pops return nothing
    pub fn pause_queue(&self, queue: &str) {
        self.lock().paused.insert(queue.to_string());
    }

    /// Unpause a queue
    pub fn unpause_queue(&self, queue: &str) {
        self.lock().paused.remove(queue);
    }

    /// Current state of a job
    pub fn state(&self, jid: &Jid) -> Option<JobState> {
        self.lock().jobs.get(jid).map(|j| j.state)
    }

    /// Failure group and message recorded for a job
    pub fn failure(&self, jid: &Jid) -> Option<(String, String)> {
        self.lock().failures.get(jid).cloned()
    }

    /// Queues polled so far, in order
    pub fn pop_log(&self) -> Vec<String> {
        self.lock().pops.clone()
    }

    /// Forget the pop log
    pub fn clear_pop_log(&self) {
        self.lock().pops.clear();
    }

    /// Worker names deregistered so far
    pub fn deregistered(&self) -> Vec<String> {
        self.lock().deregistered.clone()
    }

    /// Number of reconnects requested
    pub fn reconnect_count(&self) -> usize {
        self.lock().reconnects
    }

    /// Check the caller holds the lease and return the stored job
    fn leased<'a>(state: &'a mut State, job: &Job) -> BackendResult<&'a mut Job> {
        let stored = state
            .jobs
            .get_mut(&job.jid)
            .ok_or_else(|| BackendError::NotFound(job.jid.clone()))?;
        if stored.state != JobState::Running || stored.worker != job.worker {
            return Err(BackendError::LeaseLost(job.jid.clone()));
        }
        Ok(stored)
    }
}

#[async_trait]
impl Client for MemoryClient {
    async fn connect(_config: &BackendConfig) -> BackendResult<Self> {
        Ok(Self::new())
    }

    async fn reconnect(&self) -> BackendResult<()> {
        self.lock().reconnects += 1;
        Ok(())
    }

    fn queue(&self, name: &str) -> Arc<dyn Queue> {
        Arc::new(MemoryQueue {
            name: name.to_string(),
            client: self.clone(),
        })
    }

    async fn get_job(&self, jid: &Jid) -> BackendResult<Option<Job>> {
        Ok(self.lock().jobs.get(jid).cloned())
    }

    async fn complete(&self, job: &Job, data: Option<&serde_json::Value>) -> BackendResult<()> {
        {
            let mut state = self.lock();
            let stored = Self::leased(&mut state, job)?;
            stored.state = JobState::Complete;
            stored.expires = None;
            if let Some(data) = data {
                stored.data = data.clone();
            }
        }
        debug!("Completed job {}", job.jid);
        self.publish(JobEvent::new(
            job.jid.clone(),
            EventKind::Completed,
            job.worker.clone(),
        ));
        Ok(())
    }

    async fn fail(&self, job: &Job, group: &str, message: &str) -> BackendResult<()> {
        {
            let mut state = self.lock();
            let stored = Self::leased(&mut state, job)?;
            stored.state = JobState::Failed;
            stored.expires = None;
            state
                .failures
                .insert(job.jid.clone(), (group.to_string(), message.to_string()));
        }
        debug!("Failed job {} in group {}", job.jid, group);
        let mut event = JobEvent::new(job.jid.clone(), EventKind::Failed, job.worker.clone());
        event.group = Some(group.to_string());
        event.message = Some(message.to_string());
        self.publish(event);
        Ok(())
    }

    async fn retry(
        &self,
        job: &Job,
        group: &str,
        message: &str,
        _delay: Duration,
    ) -> BackendResult<()> {
        let exhausted = {
            let mut state = self.lock();
            let stored = Self::leased(&mut state, job)?;
            stored.remaining -= 1;
            if stored.remaining < 0 {
                true
            } else {
                stored.state = JobState::Waiting;
                stored.worker = None;
                stored.expires = None;
                let queue = stored.queue.clone();
                state
                    .queues
                    .entry(queue)
                    .or_default()
                    .push_back(job.jid.clone());
                false
            }
        };
        if exhausted {
            return self.fail(job, group, message).await;
        }
        debug!("Requeued job {} for retry", job.jid);
        Ok(())
    }

    async fn heartbeat(&self, job: &Job) -> BackendResult<()> {
        let mut state = self.lock();
        let stored = Self::leased(&mut state, job)?;
        stored.expires = Some(now() + LEASE_SECS);
        Ok(())
    }

    async fn subscribe(&self, _channels: &[&str]) -> BackendResult<EventStream> {
        let events = BroadcastStream::new(self.events.subscribe())
            .filter_map(|event| async move { event.ok() });
        Ok(Box::pin(events))
    }

    async fn deregister_worker(&self, name: &str) -> BackendResult<()> {
        self.lock().deregistered.push(name.to_string());
        Ok(())
    }
}

fn now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Queue handle bound to a [`MemoryClient`]
pub struct MemoryQueue {
    name: String,
    client: MemoryClient,
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pop(&self, worker: &str) -> BackendResult<Option<Job>> {
        let mut state = self.client.lock();
        state.pops.push(self.name.clone());
        if state.paused.contains(&self.name) {
            return Ok(None);
        }

        let jid = match state.queues.get_mut(&self.name).and_then(VecDeque::pop_front) {
            Some(jid) => jid,
            None => return Ok(None),
        };
        let job = state
            .jobs
            .get_mut(&jid)
            .ok_or_else(|| BackendError::NotFound(jid.clone()))?;
        job.state = JobState::Running;
        job.worker = Some(worker.to_string());
        job.expires = Some(now() + LEASE_SECS);
        Ok(Some(job.clone()))
    }

    async fn length(&self) -> BackendResult<u64> {
        let state = self.client.lock();
        Ok(state.queues.get(&self.name).map_or(0, |q| q.len() as u64))
    }

    async fn is_paused(&self) -> BackendResult<bool> {
        Ok(self.client.lock().paused.contains(&self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pop_leases_job_fifo() {
        let client = MemoryClient::new();
        let first = client.put_job("q", "echo", json!(1));
        let second = client.put_job("q", "echo", json!(2));
        let queue = client.queue("q");

        let job = queue.pop("w1").await.unwrap().unwrap();
        assert_eq!(job.jid, first);
        assert!(job.is_leased_by("w1"));
        assert_eq!(queue.length().await.unwrap(), 1);

        let job = queue.pop("w1").await.unwrap().unwrap();
        assert_eq!(job.jid, second);
        assert!(queue.pop("w1").await.unwrap().is_none());
        assert_eq!(client.pop_log(), vec!["q", "q", "q"]);
    }

    #[tokio::test]
    async fn test_paused_queue_yields_nothing() {
        let client = MemoryClient::new();
        client.put_job("q", "echo", json!(null));
        client.pause_queue("q");
        let queue = client.queue("q");
        assert!(queue.is_paused().await.unwrap());
        assert!(queue.pop("w1").await.unwrap().is_none());

        client.unpause_queue("q");
        assert!(queue.pop("w1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_complete_and_fail_require_the_lease() {
        let client = MemoryClient::new();
        let jid = client.put_job("q", "echo", json!(null));
        let job = client.queue("q").pop("w1").await.unwrap().unwrap();

        let mut stranger = job.clone();
        stranger.worker = Some("w2".to_string());
        assert!(matches!(
            client.complete(&stranger, None).await,
            Err(BackendError::LeaseLost(_))
        ));

        client.fail(&job, "system:fatal", "boom").await.unwrap();
        assert_eq!(client.state(&jid), Some(JobState::Failed));
        assert_eq!(
            client.failure(&jid),
            Some(("system:fatal".to_string(), "boom".to_string()))
        );
        assert!(client.complete(&job, None).await.is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_fails_after_lock_loss() {
        let client = MemoryClient::new();
        let jid = client.put_job("q", "sleep", json!(null));
        let job = client.queue("q").pop("w1").await.unwrap().unwrap();

        client.heartbeat(&job).await.unwrap();
        client.lose_lock(&jid, "w2");
        assert!(matches!(
            client.heartbeat(&job).await,
            Err(BackendError::LeaseLost(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_requeues_until_exhausted() {
        let client = MemoryClient::new();
        let jid = client.put("q", Job::new("echo", "q", json!(null)).with_retries(1));
        let queue = client.queue("q");

        let job = queue.pop("w1").await.unwrap().unwrap();
        client.retry(&job, "g", "again", Duration::ZERO).await.unwrap();
        assert_eq!(client.state(&jid), Some(JobState::Waiting));

        let job = queue.pop("w1").await.unwrap().unwrap();
        assert_eq!(job.remaining, 0);
        client.retry(&job, "g", "again", Duration::ZERO).await.unwrap();
        assert_eq!(client.state(&jid), Some(JobState::Failed));
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let client = MemoryClient::new();
        let jid = client.put_job("q", "echo", json!(null));
        let mut events = client.subscribe(&[kestrel_core::EVENT_CHANNEL]).await.unwrap();

        client.queue("q").pop("w1").await.unwrap();
        client.lose_lock(&jid, "w2");
        client.cancel(&jid);

        let event = events.next().await.unwrap();
        assert_eq!(event.kind, EventKind::LockLost);
        assert!(event.is_for_worker("w1"));

        let event = events.next().await.unwrap();
        assert_eq!(event.kind, EventKind::Canceled);
        assert!(event.is_for_worker("w2"));
        assert!(client.state(&jid).is_none());
    }

    #[tokio::test]
    async fn test_deregister_and_reconnect_are_recorded() {
        let client = MemoryClient::new();
        client.reconnect().await.unwrap();
        client.deregister_worker("w1").await.unwrap();
        assert_eq!(client.reconnect_count(), 1);
        assert_eq!(client.deregistered(), vec!["w1"]);
    }
}
