//! Declarative extraction of metrics from training-program log lines.
//!
//! Each dataset maps to a [`RuleSet`]: one [`ExtractionRule`] per [`Stage`],
//! each bound to the output stream it listens on. A rule's pattern captures
//! named decimal fields; a match becomes a metric map keyed by capture name.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::dataset::{Dataset, OutputStream, Stage};
use crate::errors::ConfigurationError;

/// Captures a single stage's metrics from lines of one stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRule {
    pub stream: OutputStream,
    #[serde(with = "pattern_serde")]
    pattern: Regex,
}

impl ExtractionRule {
    pub fn new(stream: OutputStream, pattern: &str) -> Result<Self, ConfigurationError> {
        let pattern = Regex::new(pattern).map_err(|e| ConfigurationError::InvalidPattern {
            stage: "custom".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { stream, pattern })
    }

    /// Rule matching `INFO - <stage> <v1> <v2> <v3>` with the given capture names.
    pub fn stage_line(
        stream: OutputStream,
        stage: Stage,
        metrics: [&str; 3],
    ) -> Result<Self, ConfigurationError> {
        let [a, b, c] = metrics;
        let pattern = format!(
            r"INFO\s+-\s+{stage}\s+(?P<{a}>\d+\.\d+)\s+(?P<{b}>\d+\.\d+)\s+(?P<{c}>\d+\.\d+)"
        );
        Self::new(stream, &pattern).map_err(|e| match e {
            ConfigurationError::InvalidPattern { message, .. } => {
                ConfigurationError::InvalidPattern {
                    stage: stage.to_string(),
                    message,
                }
            }
            other => other,
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Named captures of `line` coerced to floats, or `None` on a miss.
    pub fn captures(&self, line: &str) -> Option<BTreeMap<String, f64>> {
        let caps = self.pattern.captures(line)?;
        let metrics = self
            .pattern
            .capture_names()
            .flatten()
            .filter_map(|name| {
                let value = caps.name(name)?.as_str().parse::<f64>().ok()?;
                Some((name.to_string(), value))
            })
            .collect();
        Some(metrics)
    }
}

impl PartialEq for ExtractionRule {
    fn eq(&self, other: &Self) -> bool {
        self.stream == other.stream && self.pattern.as_str() == other.pattern.as_str()
    }
}

/// A successful match of one line against a rule set.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub stage: Stage,
    pub metrics: BTreeMap<String, f64>,
}

/// The (train, dev, test) rule triple for a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub train: ExtractionRule,
    pub dev: ExtractionRule,
    pub test: ExtractionRule,
}

impl RuleSet {
    /// Build a triple whose stages all listen on `stream` and capture `metrics`.
    pub fn stage_lines(
        stream: OutputStream,
        metrics: [&str; 3],
    ) -> Result<Self, ConfigurationError> {
        Ok(Self {
            train: ExtractionRule::stage_line(stream, Stage::Train, metrics)?,
            dev: ExtractionRule::stage_line(stream, Stage::Dev, metrics)?,
            test: ExtractionRule::stage_line(stream, Stage::Test, metrics)?,
        })
    }

    /// Built-in rule triple for a dataset.
    pub fn for_dataset(dataset: Dataset) -> RuleSet {
        static QA: OnceLock<RuleSet> = OnceLock::new();
        static SICK: OnceLock<RuleSet> = OnceLock::new();
        static MSRP: OnceLock<RuleSet> = OnceLock::new();

        let (cell, metrics) = match dataset {
            Dataset::TrecQa | Dataset::WikiQa => (&QA, ["cross_entropy_loss", "map", "mrr"]),
            Dataset::Sick => (&SICK, ["pearson", "spearman", "kl_div"]),
            Dataset::Msrp => (&MSRP, ["accuracy", "f1", "kl_div"]),
        };
        cell.get_or_init(|| {
            RuleSet::stage_lines(OutputStream::Stderr, metrics)
                .expect("built-in extraction patterns are valid")
        })
        .clone()
    }

    /// Look up the built-in triple by dataset identifier.
    pub fn for_name(name: &str) -> Result<RuleSet, ConfigurationError> {
        Dataset::from_str(name).map(RuleSet::for_dataset)
    }

    pub fn rule(&self, stage: Stage) -> &ExtractionRule {
        match stage {
            Stage::Train => &self.train,
            Stage::Dev => &self.dev,
            Stage::Test => &self.test,
        }
    }

    /// Test `line` from `stream` against each stage listening on that stream.
    /// The first matching stage wins; `None` is an extraction miss.
    pub fn extract(&self, stream: OutputStream, line: &str) -> Option<Extraction> {
        Stage::ALL.into_iter().find_map(|stage| {
            let rule = self.rule(stage);
            if rule.stream != stream {
                return None;
            }
            rule.captures(line).map(|metrics| Extraction { stage, metrics })
        })
    }
}

mod pattern_serde {
    use regex::Regex;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(pattern: &Regex, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(pattern.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Regex, D::Error> {
        let source = String::deserialize(deserializer)?;
        Regex::new(&source).map_err(serde::de::Error::custom)
    }
}
