//! # gs-queue
//!
//! Queue plumbing between the sweep dispatcher and GPU workers.
//!
//! - [`TaskQueue`] / [`TaskSource`]: producer and consumer halves of a broker
//! - [`MemoryBroker`]: in-process broker for tests and single-host runs
//! - [`SpoolBroker`]: filesystem spool shared by dispatcher and worker processes
//! - [`Dispatcher`]: routes a training command to the `gpu<N>` queue of its device

pub mod broker;
pub mod dispatcher;
pub mod memory;
pub mod spool;

pub use broker::{Ack, ClaimedTask, ConsumerLease, TaskQueue, TaskSource};
pub use dispatcher::Dispatcher;
pub use memory::MemoryBroker;
pub use spool::{default_spool_dir, SpoolBroker};
