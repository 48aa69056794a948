//! In-process broker backed by one channel per queue.

use async_trait::async_trait;
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gs_types::{DispatchError, QueueError, QueueName, Task, TaskId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::broker::{Ack, ClaimedTask, ConsumerLease, TaskQueue, TaskSource};

/// Broker living inside one process. Queues are created on first use.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: DashMap<QueueName, (Sender<Task>, Receiver<Task>)>,
    acks: Mutex<Vec<(TaskId, Ack)>>,
    consumers: Arc<DashMap<QueueName, ()>>,
    closed: AtomicBool,
}

/// Frees the queue's consumer slot on drop.
struct ConsumerSlot {
    consumers: Arc<DashMap<QueueName, ()>>,
    queue: QueueName,
}

impl Drop for ConsumerSlot {
    fn drop(&mut self) {
        self.consumers.remove(&self.queue);
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop accepting tasks; later enqueues fail as if the broker were down.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn pending(&self, queue: &QueueName) -> usize {
        self.queues.get(queue).map(|q| q.1.len()).unwrap_or(0)
    }

    /// Names of every queue that has received a task.
    pub fn queue_names(&self) -> Vec<QueueName> {
        let mut names: Vec<QueueName> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Remove and return every pending task on `queue`, oldest first.
    pub fn drain(&self, queue: &QueueName) -> Vec<Task> {
        match self.queues.get(queue) {
            Some(q) => q.1.try_iter().collect(),
            None => Vec::new(),
        }
    }

    pub fn acknowledged(&self) -> Vec<(TaskId, Ack)> {
        self.acks.lock().clone()
    }
}

#[async_trait]
impl TaskQueue for MemoryBroker {
    async fn enqueue(&self, task: Task) -> Result<(), DispatchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::Unreachable {
                queue: task.queue.to_string(),
                message: "memory broker is closed".to_string(),
            });
        }

        let entry = self
            .queues
            .entry(task.queue.clone())
            .or_insert_with(unbounded);
        let queue = task.queue.to_string();
        let task_id = task.id;
        entry.0.send(task).map_err(|_| DispatchError::Rejected {
            queue: queue.clone(),
            task_id: task_id.to_string(),
            message: "channel disconnected".to_string(),
        })?;
        debug!(%queue, %task_id, "task enqueued in memory");
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[async_trait]
impl TaskSource for MemoryBroker {
    async fn acquire(&self, queue: &QueueName) -> Result<ConsumerLease, QueueError> {
        match self.consumers.entry(queue.clone()) {
            Entry::Occupied(_) => {
                return Err(QueueError::Locked {
                    queue: queue.to_string(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }
        let slot = ConsumerSlot {
            consumers: Arc::clone(&self.consumers),
            queue: queue.clone(),
        };
        Ok(ConsumerLease::new(queue.clone(), slot))
    }

    async fn claim(&self, queue: &QueueName) -> Result<Option<ClaimedTask>, QueueError> {
        let task = match self.queues.get(queue) {
            Some(q) => q.1.try_recv().ok(),
            None => None,
        };
        Ok(task.map(|task| ClaimedTask {
            receipt: task.id.to_string(),
            task,
        }))
    }

    async fn acknowledge(&self, claimed: &ClaimedTask, ack: Ack) -> Result<(), QueueError> {
        self.acks.lock().push((claimed.task.id, ack));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gs_types::{Command, Dataset, RuleSet};

    fn task(device: u32, trial_id: u64) -> Task {
        Task::new(
            trial_id,
            Command::new("true"),
            "g",
            RuleSet::for_dataset(Dataset::Sick),
            QueueName::for_device(device),
        )
    }

    #[tokio::test]
    async fn fifo_per_queue() {
        let broker = MemoryBroker::new();
        for trial in 1..=3 {
            broker.enqueue(task(0, trial)).await.unwrap();
        }
        broker.enqueue(task(1, 99)).await.unwrap();

        let gpu0 = QueueName::for_device(0);
        assert_eq!(broker.pending(&gpu0), 3);
        assert_eq!(broker.queue_names(), vec![gpu0.clone(), QueueName::for_device(1)]);

        let mut order = Vec::new();
        while let Some(claimed) = broker.claim(&gpu0).await.unwrap() {
            order.push(claimed.task.trial_id);
            broker.acknowledge(&claimed, Ack::Done).await.unwrap();
        }
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(broker.acknowledged().len(), 3);
        assert_eq!(broker.pending(&QueueName::for_device(1)), 1);
    }

    #[tokio::test]
    async fn closed_broker_is_unreachable() {
        let broker = MemoryBroker::new();
        broker.close();
        let err = broker.enqueue(task(0, 1)).await.unwrap_err();
        assert!(err.is_broker_down());
    }

    #[tokio::test]
    async fn second_consumer_is_refused_until_release() {
        let broker = MemoryBroker::new();
        let gpu0 = QueueName::for_device(0);

        let lease = broker.acquire(&gpu0).await.unwrap();
        assert!(matches!(broker.acquire(&gpu0).await, Err(QueueError::Locked { .. })));
        assert!(broker.acquire(&QueueName::for_device(1)).await.is_ok());

        drop(lease);
        assert!(broker.acquire(&gpu0).await.is_ok());
    }

    #[tokio::test]
    async fn claim_on_unknown_queue_is_empty() {
        let broker = MemoryBroker::new();
        assert!(broker.claim(&QueueName::for_device(7)).await.unwrap().is_none());
    }
}
