//! # gs-dispatch
//!
//! Drives a hyperparameter sweep: samples `count` configurations, renders
//! each into a training command and submits it to the queue of the device
//! chosen by a [`DevicePolicy`]. Submission is fire-and-forget; results are
//! collected by the workers.

use gs_queue::{Dispatcher, TaskQueue};
use gs_search::{CommandBuilder, ConfigSampler, DevicePolicy};
use gs_types::{
    invalid_field, ConfigurationError, Dataset, RuleSet, SweepError, SweepResult, TaskId,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

pub const DEFAULT_COUNT: u32 = 30;
pub const DEFAULT_EPOCHS: u32 = 7;
pub const DEFAULT_LOG_INTERVAL: u32 = 1000;

/// Validated parameters of one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    pub group: String,
    pub dataset: Dataset,
    pub count: u32,
    pub epochs: u32,
    pub log_interval: u32,
}

impl SweepConfig {
    /// Resolve the dataset name and check the numeric options. Nothing is
    /// submitted for a sweep whose configuration fails here.
    pub fn new(
        group: impl Into<String>,
        dataset: &str,
        count: u32,
        epochs: u32,
        log_interval: u32,
    ) -> Result<Self, ConfigurationError> {
        let group = group.into();
        if group.trim().is_empty() {
            return Err(invalid_field!("group", "experiment group must not be empty"));
        }
        if epochs == 0 {
            return Err(invalid_field!("epochs", "must be at least 1"));
        }
        if log_interval == 0 {
            return Err(invalid_field!("log_interval", "must be at least 1"));
        }
        Ok(Self {
            group,
            dataset: dataset.parse()?,
            count,
            epochs,
            log_interval,
        })
    }
}

/// One accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub task_id: TaskId,
    pub trial_id: u64,
    pub device: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub submitted: Vec<Submission>,
    /// Trials the broker refused; the sweep moved on without them.
    pub rejected: u32,
}

/// Submit every trial of `config`.
///
/// A rejected submission is logged and skipped. An unreachable broker aborts
/// the sweep, since every later submission would fail the same way; trials
/// already accepted stay queued.
pub async fn run_sweep<Q, R>(
    config: &SweepConfig,
    sampler: &mut ConfigSampler<R>,
    devices: &mut dyn DevicePolicy,
    builder: &CommandBuilder,
    dispatcher: &Dispatcher<Q>,
) -> SweepResult<SweepSummary>
where
    Q: TaskQueue,
    R: Rng,
{
    let rule_set = RuleSet::for_dataset(config.dataset);
    let mut summary = SweepSummary::default();

    info!(
        group = %config.group,
        dataset = %config.dataset,
        count = config.count,
        epochs = config.epochs,
        devices = devices.name(),
        "starting sweep"
    );

    for index in 0..config.count {
        let device = devices.next_device();
        let trial = sampler.sample(device)?;
        let command = builder.build(
            &trial,
            &config.group,
            config.dataset,
            config.epochs,
            config.log_interval,
        )?;

        match dispatcher
            .submit(command, &config.group, rule_set.clone(), device, trial.trial_id)
            .await
        {
            Ok(task_id) => summary.submitted.push(Submission {
                task_id,
                trial_id: trial.trial_id,
                device,
            }),
            Err(e) if e.is_broker_down() => {
                error!(
                    error = %e,
                    submitted = summary.submitted.len(),
                    remaining = config.count - index,
                    "broker unreachable, aborting sweep"
                );
                return Err(SweepError::Dispatch(e));
            }
            Err(e) => {
                warn!(trial_id = trial.trial_id, error = %e, "submission rejected, continuing");
                summary.rejected += 1;
            }
        }
    }

    info!(
        group = %config.group,
        submitted = summary.submitted.len(),
        rejected = summary.rejected,
        "sweep submitted"
    );
    Ok(summary)
}
