//! Per-trial configuration sampling for the MP-CNN training program.

use gs_types::{invalid_field, ConfigurationError, HyperparameterConfig, Optimizer};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

use crate::policy::TrialIdPolicy;
use crate::search::{ParameterValue, RandomSearch, SearchSpace};

/// The fixed search space swept for MP-CNN models.
pub fn mpcnn_space() -> SearchSpace {
    SearchSpace::new()
        .add_log_uniform_rounded("learning_rate", 1e-4, 1e-3, 5)
        .add_choice(
            "optimizer",
            Optimizer::ALL.iter().map(|o| json!(o.as_str())).collect(),
        )
        .add_choice("momentum", vec![json!(0.3), json!(0.4), json!(0.5), json!(0.6), json!(0.7)])
        .add_choice("filters", vec![json!(50), json!(100), json!(200), json!(300)])
        .add_log_uniform_rounded("regularization", 1e-5, 1e-3, 7)
        .add_choice("dropout", vec![json!(0), json!(0.1), json!(0.3), json!(0.5)])
        .add_int("patience", 2, 5)
        .add_choice("lr_reduce_factor", vec![json!(0.3), json!(0.5), json!(0.7)])
}

/// Draws one [`HyperparameterConfig`] per call.
///
/// Pure apart from its random source: two samplers seeded alike produce the
/// same sequence of configurations.
#[derive(Debug, Clone)]
pub struct ConfigSampler<R: Rng = ChaCha8Rng> {
    search: RandomSearch,
    trial_ids: TrialIdPolicy,
    rng: R,
}

impl ConfigSampler<ChaCha8Rng> {
    /// Entropy-seeded sampler over [`mpcnn_space`].
    pub fn from_entropy(trial_ids: TrialIdPolicy) -> Self {
        Self::new(mpcnn_space(), trial_ids, ChaCha8Rng::from_entropy())
    }

    /// Deterministic sampler over [`mpcnn_space`].
    pub fn seeded(seed: u64, trial_ids: TrialIdPolicy) -> Self {
        Self::new(mpcnn_space(), trial_ids, ChaCha8Rng::seed_from_u64(seed))
    }
}

impl<R: Rng> ConfigSampler<R> {
    pub fn new(space: SearchSpace, trial_ids: TrialIdPolicy, rng: R) -> Self {
        Self {
            search: RandomSearch::new(space),
            trial_ids,
            rng,
        }
    }

    /// Sample one configuration bound to `device_seed`.
    ///
    /// Fails only when the search space lacks a dimension the training
    /// program requires, or yields a value of the wrong type.
    pub fn sample(&mut self, device_seed: u32) -> Result<HyperparameterConfig, ConfigurationError> {
        let params = self.search.sample_one(&mut self.rng);
        let trial_id = self.trial_ids.next_id(&mut self.rng);
        let config = into_config(&params, device_seed, trial_id)?;
        debug!(trial_id, device = device_seed, lr = config.learning_rate, "sampled configuration");
        Ok(config)
    }
}

fn into_config(
    params: &HashMap<String, ParameterValue>,
    device: u32,
    trial_id: u64,
) -> Result<HyperparameterConfig, ConfigurationError> {
    let optimizer = lookup(params, "optimizer")?
        .as_str()
        .ok_or_else(|| invalid_field!("optimizer", "expected a string"))?
        .parse::<Optimizer>()?;

    Ok(HyperparameterConfig {
        learning_rate: float(params, "learning_rate")?,
        optimizer,
        momentum: float(params, "momentum")?,
        filters: unsigned(params, "filters")?,
        regularization: float(params, "regularization")?,
        dropout: float(params, "dropout")?,
        device,
        patience: unsigned(params, "patience")?,
        lr_reduce_factor: float(params, "lr_reduce_factor")?,
        trial_id,
    })
}

fn lookup<'a>(
    params: &'a HashMap<String, ParameterValue>,
    name: &str,
) -> Result<&'a ParameterValue, ConfigurationError> {
    params
        .get(name)
        .ok_or_else(|| invalid_field!(name, "missing from search space"))
}

fn float(params: &HashMap<String, ParameterValue>, name: &str) -> Result<f64, ConfigurationError> {
    lookup(params, name)?
        .as_f64()
        .ok_or_else(|| invalid_field!(name, "expected a number"))
}

fn unsigned(
    params: &HashMap<String, ParameterValue>,
    name: &str,
) -> Result<u32, ConfigurationError> {
    let value = lookup(params, name)?;
    value
        .as_i64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| invalid_field!(name, "expected a non-negative integer, got {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::round_to;

    #[test]
    fn learning_rate_and_regularization_ranges() {
        let mut sampler = ConfigSampler::seeded(11, TrialIdPolicy::Random);
        for _ in 0..500 {
            let config = sampler.sample(0).unwrap();
            assert!((0.0001..=0.001).contains(&config.learning_rate), "{}", config.learning_rate);
            assert_eq!(round_to(config.learning_rate, 5), config.learning_rate);
            assert!(
                (0.00001..=0.001).contains(&config.regularization),
                "{}",
                config.regularization
            );
            assert_eq!(round_to(config.regularization, 7), config.regularization);
        }
    }

    #[test]
    fn categorical_fields_come_from_candidate_sets() {
        let mut sampler = ConfigSampler::seeded(12, TrialIdPolicy::default());
        for _ in 0..200 {
            let c = sampler.sample(2).unwrap();
            assert_eq!(c.optimizer, Optimizer::Sgd);
            assert!([0.3, 0.4, 0.5, 0.6, 0.7].contains(&c.momentum));
            assert!([50, 100, 200, 300].contains(&c.filters));
            assert!([0.0, 0.1, 0.3, 0.5].contains(&c.dropout));
            assert!((2..=5).contains(&c.patience));
            assert!([0.3, 0.5, 0.7].contains(&c.lr_reduce_factor));
            assert_eq!(c.device, 2);
        }
    }

    #[test]
    fn seeded_samplers_agree() {
        let mut a = ConfigSampler::seeded(99, TrialIdPolicy::Random);
        let mut b = ConfigSampler::seeded(99, TrialIdPolicy::Random);
        for _ in 0..10 {
            assert_eq!(a.sample(1).unwrap(), b.sample(1).unwrap());
        }
    }

    #[test]
    fn sequential_trial_ids() {
        let mut sampler = ConfigSampler::seeded(1, TrialIdPolicy::sequential_from(40));
        let ids: Vec<u64> = (0..3).map(|_| sampler.sample(0).unwrap().trial_id).collect();
        assert_eq!(ids, vec![40, 41, 42]);
    }

    #[test]
    fn missing_dimension_is_configuration_error() {
        let space = SearchSpace::new().add_log_uniform("learning_rate", 1e-4, 1e-3);
        let rng = ChaCha8Rng::seed_from_u64(0);
        let mut sampler = ConfigSampler::new(space, TrialIdPolicy::default(), rng);
        let err = sampler.sample(0).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::InvalidField { ref field, .. } if field == "optimizer"
        ));
    }
}
