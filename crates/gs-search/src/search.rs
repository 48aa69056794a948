//! Search space definitions and random sampling.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name (e.g. "learning_rate").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated), optionally
    /// rounded to a number of decimal places.
    LogUniform {
        low: f64,
        high: f64,
        decimals: Option<u32>,
    },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

/// A concrete parameter value produced by a search strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Float(f64),
    Int(i64),
    Json(serde_json::Value),
}

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Json(v) => v.as_f64(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Json(v) => v.as_i64(),
            Self::Float(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Json(v) => v.as_str(),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform {
                low,
                high,
                decimals: None,
            },
        });
        self
    }

    /// Log-uniform dimension whose samples are rounded to `decimals` places.
    pub fn add_log_uniform_rounded(
        mut self,
        name: impl Into<String>,
        low: f64,
        high: f64,
        decimals: u32,
    ) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform {
                low,
                high,
                decimals: Some(decimals),
            },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Round half away from zero to `decimals` places.
pub(crate) fn round_to(value: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    (value * scale).round() / scale
}

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
}

impl RandomSearch {
    pub fn new(space: SearchSpace) -> Self {
        Self { space }
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    /// Draw one value for every dimension, in declaration order.
    pub fn sample_one<R: Rng>(&self, rng: &mut R) -> HashMap<String, ParameterValue> {
        let mut params = HashMap::new();

        for param in &self.space.parameters {
            let value = match &param.kind {
                ParameterKind::IntRange { low, high } => {
                    ParameterValue::Int(rng.gen_range(*low..=*high))
                }
                ParameterKind::LogUniform {
                    low,
                    high,
                    decimals,
                } => {
                    let log_low = low.ln();
                    let log_high = high.ln();
                    let log_val: f64 = rng.gen_range(log_low..=log_high);
                    // exp(ln(x)) can land a hair outside the bounds
                    let mut value = log_val.exp().clamp(*low, *high);
                    if let Some(places) = decimals {
                        value = round_to(value, *places);
                    }
                    ParameterValue::Float(value)
                }
                ParameterKind::Choice { values } => {
                    if values.is_empty() {
                        continue;
                    }
                    let idx = rng.gen_range(0..values.len());
                    ParameterValue::Json(values[idx].clone())
                }
            };
            params.insert(param.name.clone(), value);
        }

        params
    }

    pub fn suggest<R: Rng>(
        &self,
        rng: &mut R,
        count: usize,
    ) -> Vec<HashMap<String, ParameterValue>> {
        (0..count).map(|_| self.sample_one(rng)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn int_range_respects_bounds() {
        let search = RandomSearch::new(SearchSpace::new().add_int("patience", 2, 5));
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut seen = [false; 4];
        for params in search.suggest(&mut rng, 200) {
            let v = params["patience"].as_i64().unwrap();
            assert!((2..=5).contains(&v));
            seen[(v - 2) as usize] = true;
        }
        assert!(seen.iter().all(|s| *s), "every value drawn at least once");
    }

    #[test]
    fn log_uniform_stays_in_bounds() {
        let space = SearchSpace::new().add_log_uniform("lr", 1e-5, 1e-1);
        let search = RandomSearch::new(space);
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        for params in search.suggest(&mut rng, 100) {
            match params.get("lr") {
                Some(ParameterValue::Float(v)) => {
                    assert!(*v >= 1e-5 && *v <= 1e-1, "lr out of bounds: {v}");
                }
                other => panic!("unexpected lr value: {other:?}"),
            }
        }
    }

    #[test]
    fn rounded_log_uniform() {
        let space = SearchSpace::new().add_log_uniform_rounded("reg", 1e-5, 1e-3, 7);
        let search = RandomSearch::new(space);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for params in search.suggest(&mut rng, 100) {
            let v = params["reg"].as_f64().unwrap();
            assert_eq!(round_to(v, 7), v);
        }
    }

    #[test]
    fn choice_parameter_works() {
        let space = SearchSpace::new().add_choice(
            "optimizer",
            vec![serde_json::json!("sgd"), serde_json::json!("adam")],
        );
        let search = RandomSearch::new(space);
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        for params in search.suggest(&mut rng, 30) {
            let s = params["optimizer"].as_str().unwrap();
            assert!(["sgd", "adam"].contains(&s));
        }
    }

    #[test]
    fn same_seed_same_samples() {
        let space = SearchSpace::new()
            .add_int("a", 1, 100)
            .add_log_uniform("b", 0.001, 1.0);
        let search = RandomSearch::new(space);
        let first = search.suggest(&mut ChaCha8Rng::seed_from_u64(7), 5);
        let second = search.suggest(&mut ChaCha8Rng::seed_from_u64(7), 5);
        assert_eq!(first, second);
    }

    #[test]
    fn round_to_places() {
        assert_eq!(round_to(0.000123456, 5), 0.00012);
        assert_eq!(round_to(0.000987654321, 7), 0.0009877);
    }
}
