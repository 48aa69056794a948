//! Reading result logs back and ranking trials.

use gs_types::{Dataset, FailureReason, ResultEvent, SinkError, Stage, TaskId};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::sink::JsonlSink;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrialState {
    Running,
    Completed,
    Failed { reason: FailureReason },
}

/// Latest view of one executed task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialSummary {
    pub task_id: TaskId,
    pub trial_id: u64,
    pub queue: Option<String>,
    #[serde(flatten)]
    pub state: TrialState,
    /// Most recent metrics reported for each stage.
    pub last: BTreeMap<Stage, BTreeMap<String, f64>>,
    /// Best dev-stage value of the dataset's objective.
    pub best_objective: Option<f64>,
    pub records: usize,
}

impl TrialSummary {
    fn new(task_id: TaskId, trial_id: u64) -> Self {
        Self {
            task_id,
            trial_id,
            queue: None,
            state: TrialState::Running,
            last: BTreeMap::new(),
            best_objective: None,
            records: 0,
        }
    }
}

/// Events of one experiment group in the order they were written.
#[derive(Debug, Clone, Default)]
pub struct ResultLog {
    events: Vec<ResultEvent>,
}

impl ResultLog {
    pub fn from_events(events: Vec<ResultEvent>) -> Self {
        Self { events }
    }

    /// Parse a JSON-lines log. Blank lines are skipped; anything else that
    /// does not decode is an error naming its line number.
    pub fn load(path: &Path) -> Result<Self, SinkError> {
        let body = fs::read_to_string(path).map_err(|source| SinkError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut events = Vec::new();
        for (idx, line) in body.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(line).map_err(|e| SinkError::Malformed {
                path: path.display().to_string(),
                line: idx + 1,
                message: e.to_string(),
            })?;
            events.push(event);
        }
        debug!(path = %path.display(), events = events.len(), "loaded result log");
        Ok(Self { events })
    }

    /// Load `group`'s log from a results directory written by [`JsonlSink`].
    /// Events belonging to any other group are dropped.
    pub fn load_group(dir: &Path, group: &str) -> Result<Self, SinkError> {
        let path = JsonlSink::path_for(dir, group);
        let mut log = Self::load(&path)?;
        let total = log.events.len();
        log.events.retain(|event| event.experiment_group() == group);
        if log.events.len() < total {
            warn!(
                path = %path.display(),
                group,
                skipped = total - log.events.len(),
                "ignored events of other groups"
            );
        }
        Ok(log)
    }

    pub fn events(&self) -> &[ResultEvent] {
        &self.events
    }

    /// One summary per task, best `dataset` objective first. Trials without
    /// a dev-stage objective sort last, in first-seen order.
    ///
    /// A task that was started again (requeued after a worker died) keeps
    /// only its latest attempt.
    pub fn summarize(&self, dataset: Dataset) -> Vec<TrialSummary> {
        let objective = dataset.objective();
        let mut order: Vec<TaskId> = Vec::new();
        let mut trials: HashMap<TaskId, TrialSummary> = HashMap::new();

        for event in &self.events {
            match event {
                ResultEvent::Started {
                    task_id,
                    trial_id,
                    queue,
                    ..
                } => {
                    if !trials.contains_key(task_id) {
                        order.push(*task_id);
                    }
                    let mut summary = TrialSummary::new(*task_id, *trial_id);
                    summary.queue = Some(queue.clone());
                    trials.insert(*task_id, summary);
                }
                ResultEvent::Record(record) => {
                    let summary = trials.entry(record.task_id).or_insert_with(|| {
                        order.push(record.task_id);
                        TrialSummary::new(record.task_id, record.trial_id)
                    });
                    summary.records += 1;
                    if record.stage == Stage::Dev {
                        if let Some(&value) = record.metrics.get(objective) {
                            if summary.best_objective.map_or(true, |best| value > best) {
                                summary.best_objective = Some(value);
                            }
                        }
                    }
                    summary.last.insert(record.stage, record.metrics.clone());
                }
                ResultEvent::Completed { task_id, trial_id, .. } => {
                    let summary = trials.entry(*task_id).or_insert_with(|| {
                        order.push(*task_id);
                        TrialSummary::new(*task_id, *trial_id)
                    });
                    summary.state = TrialState::Completed;
                }
                ResultEvent::Failed {
                    task_id,
                    trial_id,
                    reason,
                    ..
                } => {
                    let summary = trials.entry(*task_id).or_insert_with(|| {
                        order.push(*task_id);
                        TrialSummary::new(*task_id, *trial_id)
                    });
                    summary.state = TrialState::Failed {
                        reason: reason.clone(),
                    };
                }
            }
        }

        let mut summaries: Vec<TrialSummary> =
            order.iter().filter_map(|id| trials.remove(id)).collect();
        // stable sort keeps first-seen order among ties
        summaries.sort_by(|a, b| match (a.best_objective, b.best_objective) {
            (Some(x), Some(y)) => y.total_cmp(&x),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        summaries
    }
}
