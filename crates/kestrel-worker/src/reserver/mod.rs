//! Queue reservation strategies
//!
//! A reserver owns the worker's queue handles and decides, once per polling
//! cycle, the order in which they are popped. [`Reserver::before_work`] is the
//! only place the order may change; [`Reserver::reserve`] makes exactly one
//! non-blocking pop attempt per queue and stops at the first job.

mod ordered;
mod priority;
mod round_robin;

pub use ordered::OrderedReserver;
pub use priority::{PriorityReserver, DEFAULT_PRIORITY};
pub use round_robin::{RoundRobinReserver, ShuffledRoundRobinReserver};

use async_trait::async_trait;
use kestrel_backend::{BackendResult, Client, Queue};
use kestrel_core::{Job, ReserverKind, WorkerConfig};
use std::sync::Arc;

/// Strategy that picks which queue to pop next
#[async_trait]
pub trait Reserver: Send {
    /// Queues in the order the next `reserve` will try them
    fn queues(&self) -> &[Arc<dyn Queue>];

    /// Re-evaluate the queue order for the next cycle
    fn before_work(&mut self);

    /// Pop the first available job, if any
    async fn reserve(&mut self, worker: &str) -> BackendResult<Option<Job>>;

    /// Queue names in current order
    fn queue_names(&self) -> Vec<String> {
        self.queues().iter().map(|q| q.name().to_string()).collect()
    }
}

/// Build the reserver selected in `config`
pub fn build<C: Client>(client: &C, config: &WorkerConfig) -> kestrel_core::Result<Box<dyn Reserver>> {
    let queues: Vec<Arc<dyn Queue>> = config.queues.iter().map(|q| client.queue(q)).collect();

    let reserver: Box<dyn Reserver> = match config.reserver {
        ReserverKind::Ordered => Box::new(OrderedReserver::new(queues)?),
        ReserverKind::Priority => {
            let mut reserver = PriorityReserver::new(queues, config.priorities.clone())?;
            reserver.set_priority_band(config.min_priority, config.max_priority)?;
            Box::new(reserver)
        }
        ReserverKind::RoundRobin => Box::new(RoundRobinReserver::new(queues)?),
        ReserverKind::ShuffledRoundRobin => Box::new(ShuffledRoundRobinReserver::new(queues)?),
    };
    Ok(reserver)
}

fn require_queues(queues: Vec<Arc<dyn Queue>>) -> kestrel_core::Result<Vec<Arc<dyn Queue>>> {
    if queues.is_empty() {
        return Err(kestrel_core::Error::invalid_argument(
            "queues",
            "a reserver needs at least one queue",
        ));
    }
    Ok(queues)
}

/// Try each queue once, in order
async fn pop_first(queues: &[Arc<dyn Queue>], worker: &str) -> BackendResult<Option<Job>> {
    for queue in queues {
        if let Some(job) = queue.pop(worker).await? {
            return Ok(Some(job));
        }
    }
    Ok(None)
}
