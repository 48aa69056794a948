//! GPU worker for GpuSweep.
//!
//! A worker binds to one `gpu<N>` queue and runs one task at a time: it
//! spawns the training command, extracts metrics from its output streams as
//! lines arrive, and appends the resulting events to a [`ResultSink`].

pub mod results;
pub mod runner;
pub mod sink;
pub mod worker;

pub use results::{ResultLog, TrialState, TrialSummary};
pub use runner::TaskRunner;
pub use sink::{default_results_dir, JsonlSink, MemorySink, ResultSink};
pub use worker::{Worker, WorkerConfig};
