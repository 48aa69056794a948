//! Filesystem spool broker.
//!
//! Layout under the spool root:
//!
//! ```text
//! <root>/<queue>/tmp/       tasks being written
//! <root>/<queue>/pending/   published, waiting for a worker
//! <root>/<queue>/running/   claimed by a worker
//! <root>/<queue>/done/      finished
//! <root>/<queue>/failed/    finished with a job failure, or undecodable
//! <root>/<queue>/worker.lock  flock held by the queue's one consumer
//! ```
//!
//! Every state transition is a `rename` within one queue directory, so a task
//! file is always in exactly one state and two workers can never claim the
//! same task. File names start with a zero-padded enqueue timestamp, which
//! makes lexical order FIFO order.

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use gs_types::{DispatchError, QueueError, QueueName, Task};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::broker::{Ack, ClaimedTask, ConsumerLease, TaskQueue, TaskSource};

const TMP: &str = "tmp";
const PENDING: &str = "pending";
const RUNNING: &str = "running";
const DONE: &str = "done";
const FAILED: &str = "failed";
const LOCK_FILE: &str = "worker.lock";

/// `<data dir>/gpusweep/spool`, falling back to the working directory.
pub fn default_spool_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gpusweep")
        .join("spool")
}

#[derive(Debug, Clone)]
pub struct SpoolBroker {
    root: PathBuf,
}

impl SpoolBroker {
    /// The root must already exist; a missing root means the broker is down.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the spool root (and parents) if needed.
    pub async fn create(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_dir(&self, queue: &QueueName, state: &str) -> PathBuf {
        self.root.join(queue.as_str()).join(state)
    }

    /// Task files currently in `state`, in FIFO order.
    pub async fn list(&self, queue: &QueueName, state: &str) -> Result<Vec<String>, QueueError> {
        let dir = self.state_dir(queue, state);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(queue, source)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(queue, e))? {
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(".json") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn pending(&self, queue: &QueueName) -> Result<usize, QueueError> {
        Ok(self.list(queue, PENDING).await?.len())
    }

    /// Move tasks stranded in `running/` (a worker died mid-job) back to
    /// `pending/`. They re-execute from scratch. Requires the queue's lease,
    /// so no live worker can own anything in `running/`.
    pub async fn recover_running(&self, lease: &ConsumerLease) -> Result<usize, QueueError> {
        let queue = lease.queue();
        let stranded = self.list(queue, RUNNING).await?;
        for name in &stranded {
            fs::rename(
                self.state_dir(queue, RUNNING).join(name),
                self.state_dir(queue, PENDING).join(name),
            )
            .await
            .map_err(|e| io_error(queue, e))?;
        }
        if !stranded.is_empty() {
            info!(%queue, count = stranded.len(), "requeued stranded tasks");
        }
        Ok(stranded.len())
    }

    async fn ensure_root(&self, queue: &QueueName) -> Result<(), QueueError> {
        if fs::metadata(&self.root).await.is_ok_and(|meta| meta.is_dir()) {
            return Ok(());
        }
        Err(QueueError::Unavailable {
            queue: queue.to_string(),
            message: format!("spool root {} does not exist", self.root.display()),
        })
    }

    async fn ensure_dirs(&self, queue: &QueueName) -> std::io::Result<()> {
        for state in [TMP, PENDING, RUNNING, DONE, FAILED] {
            fs::create_dir_all(self.state_dir(queue, state)).await?;
        }
        Ok(())
    }
}

fn io_error(queue: &QueueName, source: std::io::Error) -> QueueError {
    QueueError::Io {
        queue: queue.to_string(),
        source,
    }
}

#[async_trait]
impl TaskQueue for SpoolBroker {
    async fn enqueue(&self, task: Task) -> Result<(), DispatchError> {
        let queue = task.queue.clone();
        let unreachable = |message: String| DispatchError::Unreachable {
            queue: queue.to_string(),
            message,
        };

        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                let message = format!("{} is not a directory", self.root.display());
                return Err(unreachable(message));
            }
            Err(e) => return Err(unreachable(format!("{}: {e}", self.root.display()))),
        }
        self.ensure_dirs(&queue)
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        let body = serde_json::to_vec_pretty(&task).map_err(|source| DispatchError::Encoding {
            task_id: task.id.to_string(),
            source,
        })?;

        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let name = format!("{nanos:020}-{}.json", task.id);
        let tmp = self.state_dir(&queue, TMP).join(&name);
        let published = self.state_dir(&queue, PENDING).join(&name);

        let rejected = |e: std::io::Error| DispatchError::Rejected {
            queue: queue.to_string(),
            task_id: task.id.to_string(),
            message: e.to_string(),
        };
        fs::write(&tmp, &body).await.map_err(rejected)?;
        fs::rename(&tmp, &published).await.map_err(rejected)?;

        debug!(%queue, task_id = %task.id, file = %name, "task spooled");
        Ok(())
    }

    fn name(&self) -> &str {
        "spool"
    }
}

#[async_trait]
impl TaskSource for SpoolBroker {
    async fn acquire(&self, queue: &QueueName) -> Result<ConsumerLease, QueueError> {
        self.ensure_root(queue).await?;
        self.ensure_dirs(queue).await.map_err(|e| io_error(queue, e))?;

        let path = self.root.join(queue.as_str()).join(LOCK_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| io_error(queue, e))?
            .into_std()
            .await;
        // The flock goes away with the file handle, including when the
        // process dies, so a crashed worker never leaves the queue locked.
        if let Err(e) = file.try_lock_exclusive() {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                return Err(QueueError::Locked {
                    queue: queue.to_string(),
                });
            }
            return Err(io_error(queue, e));
        }
        debug!(%queue, lock = %path.display(), "queue lease acquired");
        Ok(ConsumerLease::new(queue.clone(), file))
    }

    async fn claim(&self, queue: &QueueName) -> Result<Option<ClaimedTask>, QueueError> {
        self.ensure_root(queue).await?;

        for name in self.list(queue, PENDING).await? {
            let running = self.state_dir(queue, RUNNING).join(&name);
            match fs::rename(self.state_dir(queue, PENDING).join(&name), &running).await {
                Ok(()) => {}
                // another worker won the race for this file
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(queue, e)),
            }

            let body = fs::read(&running).await.map_err(|e| io_error(queue, e))?;
            return match serde_json::from_slice::<Task>(&body) {
                Ok(task) => Ok(Some(ClaimedTask { task, receipt: name })),
                Err(e) => {
                    warn!(%queue, file = %name, error = %e, "undecodable task moved to failed");
                    let failed = self.state_dir(queue, FAILED).join(&name);
                    fs::rename(&running, &failed).await.map_err(|e| io_error(queue, e))?;
                    Err(QueueError::CorruptTask {
                        path: failed.display().to_string(),
                        message: e.to_string(),
                    })
                }
            };
        }
        Ok(None)
    }

    async fn acknowledge(&self, claimed: &ClaimedTask, ack: Ack) -> Result<(), QueueError> {
        let queue = &claimed.task.queue;
        let target = match ack {
            Ack::Done => DONE,
            Ack::Failed => FAILED,
        };
        match fs::rename(
            self.state_dir(queue, RUNNING).join(&claimed.receipt),
            self.state_dir(queue, target).join(&claimed.receipt),
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(QueueError::NotClaimed {
                queue: queue.to_string(),
                task_id: claimed.task.id.to_string(),
            }),
            Err(e) => Err(io_error(queue, e)),
        }
    }
}
