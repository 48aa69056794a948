pub mod command;
pub mod config;
pub mod dataset;
pub mod errors;
pub mod extraction;
pub mod record;
pub mod task;

pub use command::*;
pub use config::*;
pub use dataset::*;
pub use errors::*;
pub use extraction::*;
pub use record::*;
pub use task::*;
