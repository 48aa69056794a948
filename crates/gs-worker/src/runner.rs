//! Executes one task as a subprocess and extracts its metrics.

use chrono::Utc;
use gs_types::{
    FailureReason, JobFailure, JobOutcome, JobReport, OutputStream, ResultEvent, ResultRecord,
    Stage, Task,
};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::sink::ResultSink;

/// How long output may keep arriving once the job's main process is gone.
pub const DEFAULT_OUTPUT_GRACE: Duration = Duration::from_secs(5);

enum StreamEvent {
    Line(OutputStream, String),
    Error(OutputStream, std::io::Error),
}

enum Exit {
    Status(ExitStatus),
    TimedOut(Duration),
    WaitFailed(std::io::Error),
}

/// Turns matching lines into records, numbering matches per stage, and
/// forwards each record to the sink as soon as it exists.
struct Extractor<'a, K: ResultSink + ?Sized> {
    task: &'a Task,
    sink: &'a K,
    ordinals: [u32; 3],
    records: Vec<ResultRecord>,
    stream_error: Option<FailureReason>,
}

impl<'a, K: ResultSink + ?Sized> Extractor<'a, K> {
    fn new(task: &'a Task, sink: &'a K) -> Self {
        Self {
            task,
            sink,
            ordinals: [0; 3],
            records: Vec::new(),
            stream_error: None,
        }
    }

    fn handle(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Line(stream, line) => self.feed(stream, &line),
            StreamEvent::Error(stream, e) => {
                warn!(task_id = %self.task.id, %stream, error = %e, "output stream read failed");
                if self.stream_error.is_none() {
                    self.stream_error = Some(FailureReason::StreamError {
                        message: format!("{stream}: {e}"),
                    });
                }
            }
        }
    }

    fn feed(&mut self, stream: OutputStream, line: &str) {
        let Some(hit) = self.task.rule_set.extract(stream, line) else {
            return;
        };
        let slot = match hit.stage {
            Stage::Train => 0,
            Stage::Dev => 1,
            Stage::Test => 2,
        };
        self.ordinals[slot] += 1;
        let record = ResultRecord {
            task_id: self.task.id,
            experiment_group: self.task.experiment_group.clone(),
            trial_id: self.task.trial_id,
            stage: hit.stage,
            stream,
            metrics: hit.metrics,
            ordinal: self.ordinals[slot],
            recorded_at: Utc::now(),
        };
        debug!(
            stage = %record.stage,
            ordinal = record.ordinal,
            metrics = ?record.metrics,
            "extracted"
        );
        // Sinks write synchronously. A worker runs one job at a time and a
        // job emits a handful of matching lines per epoch, so the append is
        // far cheaper than the reads it interleaves with.
        let event = ResultEvent::Record(record);
        if let Err(e) = self.sink.append(&event) {
            error!(task_id = %self.task.id, error = %e, "failed to persist record");
        }
        if let ResultEvent::Record(record) = event {
            self.records.push(record);
        }
    }
}

/// Runs training commands with both output streams captured.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    timeout: Option<Duration>,
    output_grace: Duration,
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new(None)
    }
}

impl TaskRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            output_grace: DEFAULT_OUTPUT_GRACE,
        }
    }

    pub fn with_output_grace(mut self, grace: Duration) -> Self {
        self.output_grace = grace;
        self
    }

    /// Run `task` to completion, appending each extracted record to `sink` as
    /// soon as its line is read.
    ///
    /// Output is processed whatever the exit status; a failed job reports the
    /// records extracted before it failed. The job runs in its own process
    /// group: a timeout kills the whole group, and so does output that stays
    /// open past the grace period after the main process exits.
    pub async fn run<K: ResultSink + ?Sized>(&self, task: &Task, sink: &K) -> JobReport {
        let started = Instant::now();
        let report = |outcome| JobReport {
            task_id: task.id,
            experiment_group: task.experiment_group.clone(),
            trial_id: task.trial_id,
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        let mut command = Command::new(&task.command.program);
        command
            .args(&task.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    task_id = %task.id,
                    program = %task.command.program,
                    error = %e,
                    "spawn failed"
                );
                return report(JobOutcome::Failed(JobFailure {
                    reason: FailureReason::SpawnFailed {
                        message: e.to_string(),
                    },
                    partial_records: Vec::new(),
                }));
            }
        };
        let pid = child.id();
        info!(task_id = %task.id, trial_id = task.trial_id, pid = ?pid, "job started");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, OutputStream::Stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, OutputStream::Stderr, tx.clone())));
        }
        drop(tx);

        let mut extractor = Extractor::new(task, sink);
        let exit = {
            let wait = wait_for_exit(&mut child, self.timeout);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    exit = &mut wait => break exit,
                    Some(event) = rx.recv() => extractor.handle(event),
                }
            }
        };

        let drained = tokio::time::timeout(self.output_grace, async {
            while let Some(event) = rx.recv().await {
                extractor.handle(event);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                task_id = %task.id,
                grace_ms = self.output_grace.as_millis() as u64,
                "output still open after the job exited, killing leftover processes"
            );
            if let Some(pid) = pid {
                kill_group(pid);
            }
            for reader in &readers {
                reader.abort();
            }
            while let Ok(event) = rx.try_recv() {
                extractor.handle(event);
            }
        }

        let Extractor {
            records,
            stream_error,
            ..
        } = extractor;
        let failure = match exit {
            Exit::Status(status) if status.success() => stream_error,
            Exit::Status(status) => Some(classify(status)),
            Exit::TimedOut(limit) => Some(FailureReason::TimedOut {
                after_ms: limit.as_millis() as u64,
            }),
            Exit::WaitFailed(e) => Some(FailureReason::StreamError {
                message: format!("wait failed: {e}"),
            }),
        };

        match failure {
            None => {
                info!(task_id = %task.id, records = records.len(), "job completed");
                report(JobOutcome::Completed { records })
            }
            Some(reason) => {
                warn!(task_id = %task.id, %reason, partial_records = records.len(), "job failed");
                report(JobOutcome::Failed(JobFailure {
                    reason,
                    partial_records: records,
                }))
            }
        }
    }
}

async fn wait_for_exit(child: &mut Child, timeout: Option<Duration>) -> Exit {
    let Some(limit) = timeout else {
        return match child.wait().await {
            Ok(status) => Exit::Status(status),
            Err(e) => Exit::WaitFailed(e),
        };
    };
    match tokio::time::timeout(limit, child.wait()).await {
        Ok(Ok(status)) => Exit::Status(status),
        Ok(Err(e)) => Exit::WaitFailed(e),
        Err(_) => {
            if let Some(pid) = child.id() {
                kill_group(pid);
            }
            // reaps the main process; the group kill covers its children
            if let Err(e) = child.kill().await {
                error!(pid = ?child.id(), error = %e, "failed to kill timed-out job");
            }
            Exit::TimedOut(limit)
        }
    }
}

/// SIGKILL every process in the job's group. The job leads its own group, so
/// its pid is the group id.
#[cfg(unix)]
fn kill_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg takes plain integers and touches no memory.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

fn classify(status: ExitStatus) -> FailureReason {
    if let Some(code) = status.code() {
        return FailureReason::ExitCode { code };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return FailureReason::Signal { signal };
        }
    }
    FailureReason::StreamError {
        message: format!("unrecognized exit status: {status}"),
    }
}

/// Forward each line of `reader` in emission order. Invalid UTF-8 is replaced
/// rather than dropped so later lines keep flowing.
async fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<StreamEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(StreamEvent::Line(stream, line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(StreamEvent::Error(stream, e));
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use gs_types::{Command as TaskCommand, Dataset, QueueName, RuleSet};

    fn shell_task(dataset: Dataset, script: &str) -> Task {
        Task::new(
            7,
            TaskCommand::new("sh").arg("-c").arg(script),
            "runner-test",
            RuleSet::for_dataset(dataset),
            QueueName::for_device(0),
        )
    }

    #[tokio::test]
    async fn extracts_records_in_emission_order() {
        let task = shell_task(
            Dataset::TrecQa,
            "echo 'INFO - train 0.5000 0.6000 0.7000' >&2; \
             echo 'progress 10%'; \
             echo 'INFO - dev 0.4000 0.6500 0.7100' >&2; \
             echo 'INFO - train 0.3000 0.6100 0.7200' >&2; \
             echo 'INFO - test 0.3500 0.6400 0.7050' >&2",
        );
        let sink = MemorySink::new();
        let report = TaskRunner::default().run(&task, &sink).await;

        assert!(report.is_success());
        let records = report.records();
        let stages: Vec<(Stage, u32)> = records.iter().map(|r| (r.stage, r.ordinal)).collect();
        assert_eq!(
            stages,
            vec![(Stage::Train, 1), (Stage::Dev, 1), (Stage::Train, 2), (Stage::Test, 1)]
        );
        assert_eq!(records[1].metrics["map"], 0.65);
        assert!(records.iter().all(|r| r.trial_id == 7 && r.experiment_group == "runner-test"));
        assert_eq!(sink.records(), records);
    }

    #[tokio::test]
    async fn stdout_lines_ignored_when_rules_listen_on_stderr() {
        let task = shell_task(Dataset::Sick, "echo 'INFO - dev 0.8 0.7 0.2'");
        let report = TaskRunner::default().run(&task, &MemorySink::new()).await;
        assert!(report.is_success());
        assert!(report.records().is_empty());
    }

    #[tokio::test]
    async fn crash_after_one_line_keeps_partial_record() {
        let task = shell_task(
            Dataset::Sick,
            "echo 'INFO - train 0.9100 0.8800 0.1200' >&2; exit 3",
        );
        let sink = MemorySink::new();
        let report = TaskRunner::default().run(&task, &sink).await;

        let failure = report.failure().expect("job should fail");
        assert_eq!(failure.reason, FailureReason::ExitCode { code: 3 });
        assert_eq!(failure.partial_records.len(), 1);
        assert_eq!(failure.partial_records[0].stage, Stage::Train);
        assert_eq!(failure.partial_records[0].metrics["pearson"], 0.91);
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn killed_by_signal() {
        let task = shell_task(Dataset::Msrp, "echo 'INFO - dev 0.70 0.80 0.10' >&2; kill -9 $$");
        let report = TaskRunner::default().run(&task, &MemorySink::new()).await;

        let failure = report.failure().unwrap();
        assert_eq!(failure.reason, FailureReason::Signal { signal: 9 });
        assert_eq!(failure.partial_records.len(), 1);
    }

    #[tokio::test]
    async fn timeout_kills_job() {
        let task = shell_task(
            Dataset::Msrp,
            "echo 'INFO - train 0.60 0.70 0.20' >&2; exec sleep 30",
        );
        let runner = TaskRunner::new(Some(Duration::from_millis(300)));
        let report = runner.run(&task, &MemorySink::new()).await;

        let failure = report.failure().unwrap();
        assert_eq!(failure.reason, FailureReason::TimedOut { after_ms: 300 });
        assert_eq!(failure.partial_records.len(), 1);
        assert!(report.duration_ms < 30_000);
    }

    #[tokio::test]
    async fn timeout_kills_children_holding_the_pipes() {
        // `sleep` runs as a child of the shell and inherits its stdout/stderr
        let task = shell_task(
            Dataset::Msrp,
            "echo 'INFO - train 0.60 0.70 0.20' >&2; sleep 5; true",
        );
        let runner = TaskRunner::new(Some(Duration::from_millis(300)));
        let report = runner.run(&task, &MemorySink::new()).await;

        let failure = report.failure().unwrap();
        assert_eq!(failure.reason, FailureReason::TimedOut { after_ms: 300 });
        assert_eq!(failure.partial_records.len(), 1);
        assert!(report.duration_ms < 3_000, "took {}ms", report.duration_ms);
    }

    #[tokio::test]
    async fn background_child_does_not_outlive_grace() {
        let task = shell_task(
            Dataset::Msrp,
            "sleep 5 & echo 'INFO - dev 0.70 0.80 0.10' >&2; exit 0",
        );
        let runner = TaskRunner::default().with_output_grace(Duration::from_millis(200));
        let report = runner.run(&task, &MemorySink::new()).await;

        assert!(report.is_success());
        assert_eq!(report.records().len(), 1);
        assert!(report.duration_ms < 3_000, "took {}ms", report.duration_ms);
    }

    #[tokio::test]
    async fn missing_program_is_spawn_failure() {
        let task = Task::new(
            1,
            TaskCommand::new("/nonexistent/gpusweep-trainer"),
            "g",
            RuleSet::for_dataset(Dataset::Sick),
            QueueName::for_device(0),
        );
        let report = TaskRunner::default().run(&task, &MemorySink::new()).await;
        let failure = report.failure().unwrap();
        assert!(matches!(failure.reason, FailureReason::SpawnFailed { .. }));
        assert!(failure.partial_records.is_empty());
    }
}
