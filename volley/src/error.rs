use thiserror::Error;

/// Errors that stop a run from starting or from completing.
///
/// Failures of individual iterations never show up here: they are recorded as
/// data on the corresponding [`crate::IterationResult`].
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The runner configuration is missing a field or has an out-of-range value.
    #[error("invalid runner configuration: {0}")]
    Configuration(String),

    /// The runner configuration could not be parsed at all.
    #[error("malformed runner configuration: {0}")]
    MalformedConfiguration(#[from] serde_json::Error),

    /// A primitive was called with an argument outside its domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The OS refused to give us a worker thread or runtime.
    #[error("failed to spawn {what}: {source}")]
    ResourceExhausted {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A runner instance drives exactly one run.
    #[error("runner has already been used for a run")]
    AlreadyRun,

    /// A worker thread panicked outside of any iteration. The iterations it
    /// had in flight produced no result.
    #[error("worker {id} panicked: {message}")]
    WorkerPanicked { id: usize, message: String },

    /// Joining the background task that waits on worker threads failed.
    #[error("failed to join workers: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = RunnerError> = std::result::Result<T, E>;
