//! Results produced by workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::dataset::{OutputStream, Stage};
use crate::task::{Task, TaskId};

/// Metrics extracted from one matching log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_id: TaskId,
    pub experiment_group: String,
    pub trial_id: u64,
    pub stage: Stage,
    pub stream: OutputStream,
    pub metrics: BTreeMap<String, f64>,
    /// 1-based count of matches for this stage within the job.
    pub ordinal: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Why a job did not complete cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    SpawnFailed { message: String },
    ExitCode { code: i32 },
    Signal { signal: i32 },
    TimedOut { after_ms: u64 },
    StreamError { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::SpawnFailed { message } => write!(f, "failed to spawn: {message}"),
            FailureReason::ExitCode { code } => write!(f, "exited with status {code}"),
            FailureReason::Signal { signal } => write!(f, "terminated by signal {signal}"),
            FailureReason::TimedOut { after_ms } => write!(f, "timed out after {after_ms}ms"),
            FailureReason::StreamError { message } => write!(f, "output stream error: {message}"),
        }
    }
}

/// A failed job together with whatever it managed to report first.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub reason: FailureReason,
    pub partial_records: Vec<ResultRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { records: Vec<ResultRecord> },
    Failed(JobFailure),
}

/// Everything the runner learned from executing one task.
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub task_id: TaskId,
    pub experiment_group: String,
    pub trial_id: u64,
    pub outcome: JobOutcome,
    pub duration_ms: u64,
}

impl JobReport {
    pub fn records(&self) -> &[ResultRecord] {
        match &self.outcome {
            JobOutcome::Completed { records } => records,
            JobOutcome::Failed(failure) => &failure.partial_records,
        }
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        match &self.outcome {
            JobOutcome::Failed(failure) => Some(failure),
            JobOutcome::Completed { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, JobOutcome::Completed { .. })
    }
}

/// Line-delimited event persisted by result sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResultEvent {
    Started {
        task_id: TaskId,
        experiment_group: String,
        trial_id: u64,
        queue: String,
        command: Vec<String>,
        at: DateTime<Utc>,
    },
    Record(ResultRecord),
    Completed {
        task_id: TaskId,
        experiment_group: String,
        trial_id: u64,
        records: usize,
        duration_ms: u64,
        at: DateTime<Utc>,
    },
    Failed {
        task_id: TaskId,
        experiment_group: String,
        trial_id: u64,
        reason: FailureReason,
        partial_records: usize,
        duration_ms: u64,
        at: DateTime<Utc>,
    },
}

impl ResultEvent {
    pub fn started(task: &Task) -> Self {
        ResultEvent::Started {
            task_id: task.id,
            experiment_group: task.experiment_group.clone(),
            trial_id: task.trial_id,
            queue: task.queue.to_string(),
            command: task.command.argv().into_iter().map(str::to_string).collect(),
            at: Utc::now(),
        }
    }

    /// Terminal event summarizing a finished job.
    pub fn finished(report: &JobReport) -> Self {
        match &report.outcome {
            JobOutcome::Completed { records } => ResultEvent::Completed {
                task_id: report.task_id,
                experiment_group: report.experiment_group.clone(),
                trial_id: report.trial_id,
                records: records.len(),
                duration_ms: report.duration_ms,
                at: Utc::now(),
            },
            JobOutcome::Failed(failure) => ResultEvent::Failed {
                task_id: report.task_id,
                experiment_group: report.experiment_group.clone(),
                trial_id: report.trial_id,
                reason: failure.reason.clone(),
                partial_records: failure.partial_records.len(),
                duration_ms: report.duration_ms,
                at: Utc::now(),
            },
        }
    }

    pub fn experiment_group(&self) -> &str {
        match self {
            ResultEvent::Started { experiment_group, .. }
            | ResultEvent::Completed { experiment_group, .. }
            | ResultEvent::Failed { experiment_group, .. } => experiment_group,
            ResultEvent::Record(record) => &record.experiment_group,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(stage: Stage, ordinal: u32) -> ResultRecord {
        let mut metrics = BTreeMap::new();
        metrics.insert("pearson".to_string(), 0.81);
        ResultRecord {
            task_id: Uuid::new_v4(),
            experiment_group: "g".into(),
            trial_id: 9,
            stage,
            stream: OutputStream::Stderr,
            metrics,
            ordinal,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn failed_report_exposes_partial_records() {
        let partial = record(Stage::Train, 1);
        let report = JobReport {
            task_id: partial.task_id,
            experiment_group: "g".into(),
            trial_id: 9,
            outcome: JobOutcome::Failed(JobFailure {
                reason: FailureReason::ExitCode { code: 1 },
                partial_records: vec![partial.clone()],
            }),
            duration_ms: 15,
        };
        assert!(!report.is_success());
        assert_eq!(report.records(), &[partial]);

        match ResultEvent::finished(&report) {
            ResultEvent::Failed { partial_records, reason, .. } => {
                assert_eq!(partial_records, 1);
                assert_eq!(reason.to_string(), "exited with status 1");
            }
            other => panic!("expected failed event, got {other:?}"),
        }
    }

    #[test]
    fn event_tagging() {
        let event = ResultEvent::Record(record(Stage::Dev, 2));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "record");
        assert_eq!(json["stage"], "dev");
        assert_eq!(json["ordinal"], 2);

        let failed = serde_json::to_value(FailureReason::Signal { signal: 9 }).unwrap();
        assert_eq!(failed["kind"], "signal");
    }

    #[test]
    fn sub_second_timeout_keeps_its_duration() {
        let reason = FailureReason::TimedOut { after_ms: 300 };
        assert_eq!(reason.to_string(), "timed out after 300ms");
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["kind"], "timed_out");
        assert_eq!(json["after_ms"], 300);
    }
}
