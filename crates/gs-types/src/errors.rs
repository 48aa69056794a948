use thiserror::Error;

/// Main error type for the GpuSweep system
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigurationError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Result sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Invalid dataset or configuration. Caller error, never retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("unknown dataset '{name}' (expected one of: trecqa, wikiqa, sick, msrp)")]
    UnknownDataset { name: String },

    #[error("unknown optimizer '{name}'")]
    UnknownOptimizer { name: String },

    #[error("invalid value for {field}: {message}")]
    InvalidField { field: String, message: String },

    #[error("invalid extraction pattern for {stage} stage: {message}")]
    InvalidPattern { stage: String, message: String },

    #[error("invalid queue name '{name}'")]
    InvalidQueueName { name: String },
}

/// Failure to hand a task to the broker at submission time.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("broker unreachable for queue {queue}: {message}")]
    Unreachable { queue: String, message: String },

    #[error("broker rejected task {task_id} on queue {queue}: {message}")]
    Rejected {
        queue: String,
        task_id: String,
        message: String,
    },

    #[error("failed to encode task {task_id}: {source}")]
    Encoding {
        task_id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DispatchError {
    /// Whether every later submission would fail the same way.
    pub fn is_broker_down(&self) -> bool {
        matches!(self, DispatchError::Unreachable { .. })
    }
}

/// Consumer-side broker failures (claiming and acknowledging tasks).
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue {queue} unavailable: {message}")]
    Unavailable { queue: String, message: String },

    #[error("corrupt task file {path}: {message}")]
    CorruptTask { path: String, message: String },

    #[error("queue {queue} already has a consumer")]
    Locked { queue: String },

    #[error("task {task_id} is not claimed on queue {queue}")]
    NotClaimed { queue: String, task_id: String },

    #[error("IO error on queue {queue}: {source}")]
    Io {
        queue: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures persisting or loading result events.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("result log IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed result event at {path}:{line}: {message}")]
    Malformed {
        path: String,
        line: usize,
        message: String,
    },

    #[error("failed to encode result event: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Result type alias for GpuSweep operations
pub type SweepResult<T> = Result<T, SweepError>;

/// Macro for creating field validation errors
#[macro_export]
macro_rules! invalid_field {
    ($field:expr, $($arg:tt)*) => {
        $crate::ConfigurationError::InvalidField {
            field: $field.to_string(),
            message: format!($($arg)*),
        }
    };
}
