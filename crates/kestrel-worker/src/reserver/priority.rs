use super::{pop_first, require_queues, Reserver};
use async_trait::async_trait;
use kestrel_backend::{BackendResult, Queue};
use kestrel_core::Job;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;

/// Priority assumed for queues missing from the priority map
pub const DEFAULT_PRIORITY: i32 = 5;

/// Pops queues from highest to lowest priority.
///
/// Queues are shuffled before a stable sort, so queues that share a priority
/// are tried in a random order each cycle instead of starving the later ones.
/// An optional `[min, max]` band drops queues outside it.
pub struct PriorityReserver {
    all: Vec<Arc<dyn Queue>>,
    queues: Vec<Arc<dyn Queue>>,
    priorities: HashMap<String, i32>,
    min_priority: Option<i32>,
    max_priority: Option<i32>,
}

impl PriorityReserver {
    pub fn new(
        queues: Vec<Arc<dyn Queue>>,
        priorities: HashMap<String, i32>,
    ) -> kestrel_core::Result<Self> {
        let all = require_queues(queues)?;
        let mut reserver = Self {
            queues: all.clone(),
            all,
            priorities,
            min_priority: None,
            max_priority: None,
        };
        reserver.before_work();
        Ok(reserver)
    }

    /// Replace the priority map; takes effect on the next cycle
    pub fn set_priorities(&mut self, priorities: HashMap<String, i32>) {
        self.priorities = priorities;
    }

    /// Only poll queues whose priority lies in `[min, max]`
    pub fn set_priority_band(
        &mut self,
        min: Option<i32>,
        max: Option<i32>,
    ) -> kestrel_core::Result<()> {
        if let (Some(min), Some(max)) = (min, max) {
            if min > max {
                return Err(kestrel_core::Error::invalid_argument(
                    "min_priority",
                    format!("{} is above max_priority {}", min, max),
                ));
            }
        }
        self.min_priority = min;
        self.max_priority = max;
        self.before_work();
        Ok(())
    }

    /// Priority of a queue
    pub fn priority_of(&self, queue: &str) -> i32 {
        self.priorities
            .get(queue)
            .copied()
            .unwrap_or(DEFAULT_PRIORITY)
    }

    fn in_band(&self, priority: i32) -> bool {
        self.min_priority.map_or(true, |min| priority >= min)
            && self.max_priority.map_or(true, |max| priority <= max)
    }
}

#[async_trait]
impl Reserver for PriorityReserver {
    fn queues(&self) -> &[Arc<dyn Queue>] {
        &self.queues
    }

    fn before_work(&mut self) {
        let mut queues: Vec<Arc<dyn Queue>> = self
            .all
            .iter()
            .filter(|q| self.in_band(self.priority_of(q.name())))
            .cloned()
            .collect();
        queues.shuffle(&mut rand::thread_rng());
        queues.sort_by_key(|q| std::cmp::Reverse(self.priority_of(q.name())));
        self.queues = queues;
    }

    async fn reserve(&mut self, worker: &str) -> BackendResult<Option<Job>> {
        pop_first(&self.queues, worker).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_backend::{Client, MemoryClient};
    use serde_json::json;

    fn reserver(client: &MemoryClient, priorities: &[(&str, i32)]) -> PriorityReserver {
        let queues = priorities.iter().map(|(n, _)| client.queue(n)).collect();
        let map = priorities
            .iter()
            .map(|(n, p)| (n.to_string(), *p))
            .collect();
        PriorityReserver::new(queues, map).unwrap()
    }

    #[tokio::test]
    async fn test_pops_highest_priority_first() {
        let client = MemoryClient::new();
        let c = client.put_job("C", "echo", json!(null));
        let a = client.put_job("A", "echo", json!(null));
        let b = client.put_job("B", "echo", json!(null));
        let mut reserver = reserver(&client, &[("C", 1), ("B", 5), ("A", 10)]);

        let mut popped = Vec::new();
        for _ in 0..4 {
            reserver.before_work();
            match reserver.reserve("w1").await.unwrap() {
                Some(job) => {
                    client.complete(&job, None).await.unwrap();
                    popped.push(job.jid);
                }
                None => break,
            }
        }
        assert_eq!(popped, vec![a, b, c]);
    }

    #[test]
    fn test_unmapped_queues_get_default_priority() {
        let client = MemoryClient::new();
        let queues = vec![client.queue("low"), client.queue("plain"), client.queue("high")];
        let priorities = HashMap::from([("low".to_string(), 1), ("high".to_string(), 9)]);
        let reserver = PriorityReserver::new(queues, priorities).unwrap();
        assert_eq!(reserver.priority_of("plain"), DEFAULT_PRIORITY);
        assert_eq!(reserver.queue_names(), vec!["high", "plain", "low"]);
    }

    #[test]
    fn test_equal_priorities_keep_every_queue() {
        let client = MemoryClient::new();
        let mut reserver = reserver(&client, &[("a", 3), ("b", 3), ("c", 3), ("top", 4)]);
        for _ in 0..20 {
            reserver.before_work();
            let names = reserver.queue_names();
            assert_eq!(names[0], "top");
            let mut rest = names[1..].to_vec();
            rest.sort();
            assert_eq!(rest, vec!["a", "b", "c"]);
        }
    }

    #[test]
    fn test_priority_band_filters_queues() {
        let client = MemoryClient::new();
        let mut reserver = reserver(&client, &[("a", 1), ("b", 5), ("c", 10)]);
        reserver.set_priority_band(Some(2), Some(9)).unwrap();
        assert_eq!(reserver.queue_names(), vec!["b"]);

        reserver.set_priority_band(Some(5), None).unwrap();
        assert_eq!(reserver.queue_names(), vec!["c", "b"]);

        assert!(reserver.set_priority_band(Some(9), Some(2)).is_err());
    }

    #[tokio::test]
    async fn test_empty_band_reserves_nothing() {
        let client = MemoryClient::new();
        client.put_job("a", "echo", json!(null));
        let mut reserver = reserver(&client, &[("a", 1)]);
        reserver.set_priority_band(Some(50), None).unwrap();
        assert!(reserver.reserve("w1").await.unwrap().is_none());
        assert!(client.pop_log().is_empty());
    }

    #[test]
    fn test_priority_changes_apply_next_cycle() {
        let client = MemoryClient::new();
        let mut reserver = reserver(&client, &[("a", 1), ("b", 2)]);
        assert_eq!(reserver.queue_names(), vec!["b", "a"]);

        reserver.set_priorities(HashMap::from([("a".to_string(), 7)]));
        assert_eq!(reserver.queue_names(), vec!["b", "a"]);
        reserver.before_work();
        assert_eq!(reserver.queue_names(), vec!["a", "b"]);
    }
}
