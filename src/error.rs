/// Typed outcomes for registry operations. Escalation from SIGTERM to a
/// forced kill is handled inside `stop` and never surfaces here.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("instance '{0}' already exists")]
    AlreadyExists(String),

    #[error("instance limit reached ({0})")]
    CapacityExceeded(usize),

    #[error("failed to start instance process: {0}")]
    SpawnFailure(#[source] std::io::Error),

    #[error("instance '{0}' not found")]
    NotFound(String),

    #[error("instance '{0}' is not running")]
    NotRunning(String),

    #[error("failed to write to instance '{id}': {source}")]
    WriteFailure {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("output monitor for instance '{id}' failed: {reason}")]
    MonitorFailure { id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, InstanceError>;
