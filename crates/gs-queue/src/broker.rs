//! Broker abstraction: producers enqueue, workers claim and acknowledge.

use async_trait::async_trait;
use gs_types::{DispatchError, QueueError, QueueName, Task};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Final disposition a worker reports for a claimed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ack {
    Done,
    Failed,
}

/// A task handed to exactly one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedTask {
    pub task: Task,
    /// Broker-specific handle used to acknowledge the claim.
    pub receipt: String,
}

/// Exclusive right to consume one queue, held for as long as the worker
/// runs. Dropping the lease releases the queue.
pub struct ConsumerLease {
    queue: QueueName,
    _guard: Box<dyn Any + Send + Sync>,
}

impl ConsumerLease {
    /// `guard` is whatever keeps the queue held; it is dropped with the lease.
    pub fn new(queue: QueueName, guard: impl Any + Send + Sync) -> Self {
        Self {
            queue,
            _guard: Box::new(guard),
        }
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }
}

impl fmt::Debug for ConsumerLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerLease").field("queue", &self.queue).finish()
    }
}

/// Producer half of a broker.
///
/// `enqueue` returns once the broker has accepted the task; it never waits
/// for the task to run. The task is routed by its own `queue` field.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<(), DispatchError>;

    /// Human-readable broker name.
    fn name(&self) -> &str;
}

/// Consumer half of a broker.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Become the only consumer of `queue`. Fails with
    /// [`QueueError::Locked`] while another lease on it is alive.
    async fn acquire(&self, queue: &QueueName) -> Result<ConsumerLease, QueueError>;

    /// Take the oldest pending task on `queue`, if any.
    async fn claim(&self, queue: &QueueName) -> Result<Option<ClaimedTask>, QueueError>;

    /// Mark a claimed task as finished.
    async fn acknowledge(&self, claimed: &ClaimedTask, ack: Ack) -> Result<(), QueueError>;
}

#[async_trait]
impl<T: TaskQueue + ?Sized> TaskQueue for Arc<T> {
    async fn enqueue(&self, task: Task) -> Result<(), DispatchError> {
        (**self).enqueue(task).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[async_trait]
impl<T: TaskSource + ?Sized> TaskSource for Arc<T> {
    async fn acquire(&self, queue: &QueueName) -> Result<ConsumerLease, QueueError> {
        (**self).acquire(queue).await
    }

    async fn claim(&self, queue: &QueueName) -> Result<Option<ClaimedTask>, QueueError> {
        (**self).claim(queue).await
    }

    async fn acknowledge(&self, claimed: &ClaimedTask, ack: Ack) -> Result<(), QueueError> {
        (**self).acknowledge(claimed, ack).await
    }
}
