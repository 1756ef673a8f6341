use super::{pop_first, require_queues, Reserver};
use async_trait::async_trait;
use kestrel_backend::{BackendResult, Queue};
use kestrel_core::Job;
use std::sync::Arc;

/// Pops queues in lexicographic name order
pub struct OrderedReserver {
    queues: Vec<Arc<dyn Queue>>,
}

impl OrderedReserver {
    pub fn new(queues: Vec<Arc<dyn Queue>>) -> kestrel_core::Result<Self> {
        let mut reserver = Self {
            queues: require_queues(queues)?,
        };
        reserver.before_work();
        Ok(reserver)
    }
}

#[async_trait]
impl Reserver for OrderedReserver {
    fn queues(&self) -> &[Arc<dyn Queue>] {
        &self.queues
    }

    fn before_work(&mut self) {
        self.queues.sort_by(|a, b| a.name().cmp(b.name()));
    }

    async fn reserve(&mut self, worker: &str) -> BackendResult<Option<Job>> {
        pop_first(&self.queues, worker).await
    }
}
