//! Queued units of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::command::Command;
use crate::errors::ConfigurationError;
use crate::extraction::RuleSet;

/// Unique task identifier.
pub type TaskId = Uuid;

/// Name of a worker queue. `gpu<N>` queues serialize work on device `N`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(String);

impl QueueName {
    pub fn for_device(device: u32) -> Self {
        Self(format!("gpu{device}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Device index for `gpu<N>` queues.
    pub fn device(&self) -> Option<u32> {
        self.0.strip_prefix("gpu")?.parse().ok()
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for QueueName {
    type Err = ConfigurationError;

    /// Queue names double as directory names in the spool broker, so they are
    /// restricted to ASCII alphanumerics, `-` and `_`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(ConfigurationError::InvalidQueueName { name: s.to_string() })
        }
    }
}

/// A training command bound for a worker queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub trial_id: u64,
    pub command: Command,
    pub experiment_group: String,
    pub rule_set: RuleSet,
    pub queue: QueueName,
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        trial_id: u64,
        command: Command,
        experiment_group: impl Into<String>,
        rule_set: RuleSet,
        queue: QueueName,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            trial_id,
            command,
            experiment_group: experiment_group.into(),
            rule_set,
            queue,
            submitted_at: Utc::now(),
        }
    }
}
