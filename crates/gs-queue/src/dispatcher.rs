//! Routes training commands to device queues.

use gs_types::{Command, DispatchError, QueueName, RuleSet, Task, TaskId};
use tracing::info;

use crate::broker::TaskQueue;

/// Fire-and-forget submission of training tasks.
///
/// The dispatcher keeps no reference to a task once the broker has accepted
/// it and never waits for results.
#[derive(Debug)]
pub struct Dispatcher<Q: TaskQueue> {
    broker: Q,
}

impl<Q: TaskQueue> Dispatcher<Q> {
    pub fn new(broker: Q) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Q {
        &self.broker
    }

    /// Enqueue `command` on `gpu{device}`. Returns as soon as the broker has
    /// accepted the task; an unreachable broker is the only failure visible
    /// here. No retries: resubmitting re-runs the whole job.
    pub async fn submit(
        &self,
        command: Command,
        group: &str,
        rule_set: RuleSet,
        device: u32,
        trial_id: u64,
    ) -> Result<TaskId, DispatchError> {
        let queue = QueueName::for_device(device);
        let task = Task::new(trial_id, command, group, rule_set, queue);
        let task_id = task.id;

        info!(
            queue = %task.queue,
            broker = self.broker.name(),
            %task_id,
            trial_id,
            command = %task.command,
            "submitting trial"
        );
        self.broker.enqueue(task).await?;
        Ok(task_id)
    }
}
