//! Hyperparameter configuration for a single trial.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ConfigurationError;

/// Optimizers the training program accepts via `--optimizer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Optimizer {
    Sgd,
}

impl Optimizer {
    /// Candidate set the sampler draws from.
    pub const ALL: [Optimizer; 1] = [Optimizer::Sgd];

    pub fn as_str(&self) -> &'static str {
        match self {
            Optimizer::Sgd => "sgd",
        }
    }
}

impl fmt::Display for Optimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Optimizer {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Optimizer::ALL
            .into_iter()
            .find(|o| o.as_str() == s)
            .ok_or_else(|| ConfigurationError::UnknownOptimizer { name: s.to_string() })
    }
}

/// One sampled point of the search space, bound to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperparameterConfig {
    pub learning_rate: f64,
    pub optimizer: Optimizer,
    pub momentum: f64,
    pub filters: u32,
    pub regularization: f64,
    pub dropout: f64,
    pub device: u32,
    pub patience: u32,
    pub lr_reduce_factor: f64,
    /// Disambiguates artifact filenames between trials.
    pub trial_id: u64,
}

impl HyperparameterConfig {
    /// File name of the model artifact this trial will write. Floats are
    /// written positionally (`0.00001`), never in exponent form.
    pub fn model_file_name(&self) -> String {
        format!(
            "lr_{}_f_{}_reg_{}_id_{}.castor",
            self.learning_rate, self.filters, self.regularization, self.trial_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HyperparameterConfig {
        HyperparameterConfig {
            learning_rate: 0.00042,
            optimizer: Optimizer::Sgd,
            momentum: 0.5,
            filters: 300,
            regularization: 0.0000123,
            dropout: 0.0,
            device: 1,
            patience: 3,
            lr_reduce_factor: 0.3,
            trial_id: 77,
        }
    }

    #[test]
    fn model_file_name_encodes_trial() {
        assert_eq!(
            config().model_file_name(),
            "lr_0.00042_f_300_reg_0.0000123_id_77.castor"
        );
    }

    #[test]
    fn smallest_regularization_stays_positional() {
        let mut config = config();
        config.regularization = 0.00001;
        config.learning_rate = 0.0001;
        assert_eq!(config.model_file_name(), "lr_0.0001_f_300_reg_0.00001_id_77.castor");
    }

    #[test]
    fn optimizer_round_trips_through_str() {
        assert_eq!("sgd".parse::<Optimizer>().unwrap(), Optimizer::Sgd);
        assert!("adam".parse::<Optimizer>().is_err());
    }
}
