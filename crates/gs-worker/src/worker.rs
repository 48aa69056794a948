//! Queue consumer loop.

use gs_queue::{Ack, ConsumerLease, TaskSource};
use gs_types::{JobReport, QueueError, QueueName, ResultEvent};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::runner::TaskRunner;
use crate::sink::ResultSink;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue: QueueName,
    /// Sleep between claims while the queue is empty.
    pub poll_interval: Duration,
    /// Kill jobs running longer than this.
    pub job_timeout: Option<Duration>,
}

impl WorkerConfig {
    pub fn new(queue: QueueName) -> Self {
        Self {
            queue,
            poll_interval: Duration::from_secs(2),
            job_timeout: None,
        }
    }
}

/// Runs tasks from one queue, one at a time. A worker holds its queue's
/// consumer lease for its whole life, so at most one runs per queue.
pub struct Worker<S: TaskSource, K: ResultSink> {
    config: WorkerConfig,
    source: S,
    sink: K,
    runner: TaskRunner,
    lease: ConsumerLease,
}

impl<S: TaskSource, K: ResultSink> Worker<S, K> {
    /// Take the consumer lease on `config.queue`. Fails with
    /// [`QueueError::Locked`] when another worker already consumes it.
    pub async fn bind(config: WorkerConfig, source: S, sink: K) -> Result<Self, QueueError> {
        let lease = source.acquire(&config.queue).await?;
        let runner = TaskRunner::new(config.job_timeout);
        Ok(Self {
            config,
            source,
            sink,
            runner,
            lease,
        })
    }

    pub fn lease(&self) -> &ConsumerLease {
        &self.lease
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    fn persist(&self, event: &ResultEvent) {
        if let Err(e) = self.sink.append(event) {
            error!(queue = %self.config.queue, error = %e, "failed to persist event");
        }
    }

    /// Claim and execute a single task. `Ok(None)` means the queue was empty.
    pub async fn run_once(&self) -> Result<Option<JobReport>, QueueError> {
        let Some(claimed) = self.source.claim(&self.config.queue).await? else {
            return Ok(None);
        };
        let task = &claimed.task;
        info!(
            queue = %self.config.queue,
            task_id = %task.id,
            trial_id = task.trial_id,
            group = %task.experiment_group,
            "claimed task"
        );

        self.persist(&ResultEvent::started(task));
        let report = self.runner.run(task, &self.sink).await;
        self.persist(&ResultEvent::finished(&report));

        let ack = if report.is_success() { Ack::Done } else { Ack::Failed };
        if let Err(e) = self.source.acknowledge(&claimed, ack).await {
            error!(task_id = %task.id, error = %e, "failed to acknowledge task");
        }
        Ok(Some(report))
    }

    /// Run tasks until the queue is empty, returning how many ran.
    /// Undecodable tasks are skipped; other broker errors stop the drain.
    pub async fn run_until_idle(&self) -> Result<usize, QueueError> {
        let mut ran = 0;
        loop {
            match self.run_once().await {
                Ok(Some(_)) => ran += 1,
                Ok(None) => return Ok(ran),
                Err(QueueError::CorruptTask { path, message }) => {
                    warn!(%path, %message, "skipping corrupt task");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll the queue until `shutdown` becomes true. A job in progress is
    /// always allowed to finish. Broker errors are logged and retried after
    /// the poll interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> usize {
        info!(queue = %self.config.queue, "worker started");
        let mut ran = 0;
        while !*shutdown.borrow() {
            let idle = match self.run_once().await {
                Ok(Some(_)) => {
                    ran += 1;
                    false
                }
                Ok(None) => true,
                Err(QueueError::CorruptTask { path, message }) => {
                    warn!(%path, %message, "skipping corrupt task");
                    false
                }
                Err(e) => {
                    error!(queue = %self.config.queue, error = %e, "claim failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        // sender gone: nobody can ask us to stop any more
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!(queue = %self.config.queue, tasks = ran, "worker stopped");
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use gs_queue::{MemoryBroker, TaskQueue};
    use gs_types::{Command, Dataset, FailureReason, RuleSet, Task};
    use std::sync::Arc;

    fn task(trial_id: u64, script: &str) -> Task {
        Task::new(
            trial_id,
            Command::new("sh").arg("-c").arg(script),
            "worker-test",
            RuleSet::for_dataset(Dataset::Sick),
            QueueName::for_device(1),
        )
    }

    async fn worker(broker: Arc<MemoryBroker>) -> Worker<Arc<MemoryBroker>, MemorySink> {
        let mut config = WorkerConfig::new(QueueName::for_device(1));
        config.poll_interval = Duration::from_millis(20);
        Worker::bind(config, broker, MemorySink::new()).await.unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn drains_queue_and_acknowledges() {
        let broker = Arc::new(MemoryBroker::new());
        broker
            .enqueue(task(1, "echo 'INFO - dev 0.8000 0.7900 0.2100' >&2"))
            .await
            .unwrap();
        broker.enqueue(task(2, "exit 4")).await.unwrap();
        // a different device's queue is left alone
        let mut other = task(3, "true");
        other.queue = QueueName::for_device(2);
        broker.enqueue(other).await.unwrap();

        let worker = worker(broker.clone()).await;
        assert_eq!(worker.run_until_idle().await.unwrap(), 2);

        let acks: Vec<Ack> = broker.acknowledged().into_iter().map(|(_, ack)| ack).collect();
        assert_eq!(acks, vec![Ack::Done, Ack::Failed]);
        assert_eq!(broker.pending(&QueueName::for_device(2)), 1);

        let events = worker.sink().events();
        assert_eq!(events.len(), 5);
        assert!(matches!(events[0], ResultEvent::Started { trial_id: 1, .. }));
        assert!(matches!(events[1], ResultEvent::Record(_)));
        assert!(matches!(events[2], ResultEvent::Completed { records: 1, .. }));
        assert!(matches!(events[3], ResultEvent::Started { trial_id: 2, .. }));
        match &events[4] {
            ResultEvent::Failed { reason, partial_records, .. } => {
                assert_eq!(*reason, FailureReason::ExitCode { code: 4 });
                assert_eq!(*partial_records, 0);
            }
            other => panic!("expected failure event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_queue_runs_nothing() {
        let worker = worker(Arc::new(MemoryBroker::new())).await;
        assert!(worker.run_once().await.unwrap().is_none());
        assert_eq!(worker.run_until_idle().await.unwrap(), 0);
        assert!(worker.sink().events().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let broker = Arc::new(MemoryBroker::new());
        broker.enqueue(task(1, "true")).await.unwrap();
        let worker = worker(broker.clone()).await;

        let (tx, rx) = watch::channel(false);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            tx.send(true).unwrap();
        });

        let ran = tokio::time::timeout(Duration::from_secs(5), worker.run(rx))
            .await
            .expect("worker should stop");
        stopper.await.unwrap();
        assert_eq!(ran, 1);
        assert_eq!(broker.acknowledged().len(), 1);
    }

    #[tokio::test]
    async fn second_worker_on_a_queue_is_refused() {
        let broker = Arc::new(MemoryBroker::new());
        let first = worker(broker.clone()).await;
        assert_eq!(first.lease().queue(), &QueueName::for_device(1));

        let config = WorkerConfig::new(QueueName::for_device(1));
        let refused = Worker::bind(config.clone(), broker.clone(), MemorySink::new()).await;
        assert!(matches!(refused, Err(QueueError::Locked { .. })));

        drop(first);
        assert!(Worker::bind(config, broker, MemorySink::new()).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spool_workers_do_not_share_a_queue() {
        use gs_queue::SpoolBroker;
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let spool = SpoolBroker::new(dir.path());
        spool.enqueue(task(1, "true")).await.unwrap();
        spool.enqueue(task(2, "true")).await.unwrap();

        let config = WorkerConfig::new(QueueName::for_device(1));
        let (a, b) = tokio::join!(
            Worker::bind(config.clone(), SpoolBroker::new(dir.path()), MemorySink::new()),
            Worker::bind(config.clone(), SpoolBroker::new(dir.path()), MemorySink::new()),
        );
        let (worker, refused) = match (a, b) {
            (Ok(worker), Err(e)) | (Err(e), Ok(worker)) => (worker, e),
            _ => panic!("exactly one worker should bind"),
        };
        assert!(matches!(refused, QueueError::Locked { .. }));

        // the lease holder may recover, then runs everything itself
        assert_eq!(worker.source().recover_running(worker.lease()).await.unwrap(), 0);
        assert_eq!(worker.run_until_idle().await.unwrap(), 2);
    }
}
