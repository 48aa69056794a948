//! Renders a sampled configuration into the training program's argument list.

use gs_types::{invalid_field, Command, ConfigurationError, Dataset, HyperparameterConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Static parts of the training invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerLayout {
    /// Interpreter that runs the training script.
    pub interpreter: String,
    /// Training entry point, passed as the first argument.
    pub script: PathBuf,
    /// Directory model artifacts are written to.
    pub model_dir: PathBuf,
    pub arch: String,
    pub batch_size: u32,
    pub attention: String,
}

impl Default for TrainerLayout {
    fn default() -> Self {
        Self {
            interpreter: "python".to_string(),
            script: PathBuf::from("main.py"),
            model_dir: PathBuf::from("saved_models"),
            arch: "mpcnn".to_string(),
            batch_size: 64,
            attention: "none".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandBuilder {
    layout: TrainerLayout,
}

impl CommandBuilder {
    pub fn new(layout: TrainerLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &TrainerLayout {
        &self.layout
    }

    /// Render `config` as a literal argument vector. Same inputs always give
    /// the same command; no value is ever re-split or shell-interpreted.
    pub fn build(
        &self,
        config: &HyperparameterConfig,
        group: &str,
        dataset: Dataset,
        epochs: u32,
        log_interval: u32,
    ) -> Result<Command, ConfigurationError> {
        if group.trim().is_empty() {
            return Err(invalid_field!("group", "experiment group must not be empty"));
        }
        if epochs == 0 {
            return Err(invalid_field!("epochs", "must be at least 1"));
        }
        if log_interval == 0 {
            return Err(invalid_field!("log_interval", "must be at least 1"));
        }

        let script = self
            .layout
            .script
            .to_str()
            .ok_or_else(|| invalid_field!("script", "path is not valid UTF-8"))?;
        let model_path = self.layout.model_dir.join(config.model_file_name());
        let model_path = model_path
            .to_str()
            .ok_or_else(|| invalid_field!("model_dir", "path is not valid UTF-8"))?;

        Ok(Command::new(self.layout.interpreter.as_str())
            .arg(script)
            .arg(model_path)
            .flag("--arch", &self.layout.arch)
            .flag("--optimizer", config.optimizer)
            .flag("--momentum", config.momentum)
            .flag("--dataset", dataset)
            .flag("--log-interval", log_interval)
            .flag("--epochs", epochs)
            .flag("--device", config.device)
            .flag("--holistic-filters", config.filters)
            .flag("--batch-size", self.layout.batch_size)
            .flag("--lr", config.learning_rate)
            .flag("--regularization", config.regularization)
            .flag("--attention", &self.layout.attention)
            .flag("--dropout", config.dropout)
            .flag("--patience", config.patience)
            .flag("--lr-reduce-factor", config.lr_reduce_factor))
    }
}
