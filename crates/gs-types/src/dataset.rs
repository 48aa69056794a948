//! Datasets, training stages and output streams.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ConfigurationError;

/// Sentence-pair datasets the training program understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    TrecQa,
    WikiQa,
    Sick,
    Msrp,
}

impl Dataset {
    /// Every supported dataset. Adding a variant here requires a rule triple
    /// in [`crate::RuleSet::for_dataset`].
    pub const ALL: [Dataset; 4] = [Dataset::TrecQa, Dataset::WikiQa, Dataset::Sick, Dataset::Msrp];

    /// Identifier passed to the training program's `--dataset` flag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dataset::TrecQa => "trecqa",
            Dataset::WikiQa => "wikiqa",
            Dataset::Sick => "sick",
            Dataset::Msrp => "msrp",
        }
    }

    /// Metric (reported on the dev stage) used to rank trials. Higher is better.
    pub fn objective(&self) -> &'static str {
        match self {
            Dataset::TrecQa | Dataset::WikiQa => "map",
            Dataset::Sick => "pearson",
            Dataset::Msrp => "accuracy",
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dataset {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dataset::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| ConfigurationError::UnknownDataset { name: s.to_string() })
    }
}

/// Phase of a training run a log line reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Train,
    Dev,
    Test,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Train, Stage::Dev, Stage::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Train => "train",
            Stage::Dev => "dev",
            Stage::Test => "test",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which subprocess stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}
