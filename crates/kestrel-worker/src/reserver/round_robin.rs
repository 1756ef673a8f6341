use super::{require_queues, Reserver};
use async_trait::async_trait;
use kestrel_backend::{BackendResult, Queue};
use kestrel_core::Job;
use rand::seq::SliceRandom;
use std::sync::Arc;

/// Rotates through queues, resuming just past the last queue that yielded a job
pub struct RoundRobinReserver {
    queues: Vec<Arc<dyn Queue>>,
    cursor: usize,
}

impl RoundRobinReserver {
    pub fn new(queues: Vec<Arc<dyn Queue>>) -> kestrel_core::Result<Self> {
        Ok(Self {
            queues: require_queues(queues)?,
            cursor: 0,
        })
    }

    /// Index of the queue the next reserve starts at
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

#[async_trait]
impl Reserver for RoundRobinReserver {
    fn queues(&self) -> &[Arc<dyn Queue>] {
        &self.queues
    }

    fn before_work(&mut self) {}

    async fn reserve(&mut self, worker: &str) -> BackendResult<Option<Job>> {
        let count = self.queues.len();
        for _ in 0..count {
            let queue = Arc::clone(&self.queues[self.cursor]);
            self.cursor = (self.cursor + 1) % count;
            if let Some(job) = queue.pop(worker).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }
}

/// Round robin over a queue list reshuffled every cycle
pub struct ShuffledRoundRobinReserver {
    inner: RoundRobinReserver,
}

impl ShuffledRoundRobinReserver {
    pub fn new(queues: Vec<Arc<dyn Queue>>) -> kestrel_core::Result<Self> {
        let mut reserver = Self {
            inner: RoundRobinReserver::new(queues)?,
        };
        reserver.before_work();
        Ok(reserver)
    }
}

#[async_trait]
impl Reserver for ShuffledRoundRobinReserver {
    fn queues(&self) -> &[Arc<dyn Queue>] {
        self.inner.queues()
    }

    fn before_work(&mut self) {
        self.inner.queues.shuffle(&mut rand::thread_rng());
    }

    async fn reserve(&mut self, worker: &str) -> BackendResult<Option<Job>> {
        self.inner.reserve(worker).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_backend::{Client, MemoryClient};
    use serde_json::json;

    fn queues(client: &MemoryClient, names: &[&str]) -> Vec<Arc<dyn Queue>> {
        names.iter().map(|n| client.queue(n)).collect()
    }

    #[tokio::test]
    async fn test_resumes_after_last_successful_queue() {
        let client = MemoryClient::new();
        let mut reserver = RoundRobinReserver::new(queues(&client, &["a", "b", "c"])).unwrap();

        // Nothing anywhere: every queue tried once, cursor back where it started.
        assert!(reserver.reserve("w1").await.unwrap().is_none());
        assert_eq!(client.pop_log(), vec!["a", "b", "c"]);
        assert_eq!(reserver.cursor(), 0);

        client.clear_pop_log();
        let planted = client.put_job("b", "echo", json!(null));
        let job = reserver.reserve("w1").await.unwrap().unwrap();
        assert_eq!(job.jid, planted);
        assert_eq!(client.pop_log(), vec!["a", "b"]);
        assert_eq!(reserver.cursor(), 2);

        client.clear_pop_log();
        assert!(reserver.reserve("w1").await.unwrap().is_none());
        assert_eq!(client.pop_log(), vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_alternates_between_busy_queues() {
        let client = MemoryClient::new();
        for _ in 0..2 {
            client.put_job("a", "echo", json!("a"));
            client.put_job("b", "echo", json!("b"));
        }
        let mut reserver = RoundRobinReserver::new(queues(&client, &["a", "b"])).unwrap();

        let mut order = Vec::new();
        while let Some(job) = reserver.reserve("w1").await.unwrap() {
            order.push(job.queue);
        }
        assert_eq!(order, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_rejects_no_queues() {
        assert!(RoundRobinReserver::new(Vec::new()).is_err());
        assert!(ShuffledRoundRobinReserver::new(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_shuffled_tries_each_queue_once() {
        let client = MemoryClient::new();
        let mut reserver =
            ShuffledRoundRobinReserver::new(queues(&client, &["a", "b", "c", "d"])).unwrap();
        reserver.before_work();
        assert!(reserver.reserve("w1").await.unwrap().is_none());

        let mut tried = client.pop_log();
        tried.sort();
        assert_eq!(tried, vec!["a", "b", "c", "d"]);

        let mut names = reserver.queue_names();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }
}
