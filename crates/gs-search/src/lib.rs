//! # gs-search
//!
//! Hyperparameter sampling for GpuSweep.
//!
//! Provides the generic search space and random search strategy, the MP-CNN
//! search space and [`ConfigSampler`] built on it, pluggable device and
//! trial-id policies, and the [`CommandBuilder`] that renders a sampled
//! configuration into the training program's argument list.

mod builder;
mod policy;
mod sampler;
mod search;

pub use builder::{CommandBuilder, TrainerLayout};
pub use policy::{ConstantDevice, DevicePolicy, RoundRobin, TrialIdPolicy};
pub use sampler::{mpcnn_space, ConfigSampler};
pub use search::{ParameterDef, ParameterKind, ParameterValue, RandomSearch, SearchSpace};
