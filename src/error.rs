//! Error types shared across the dispatcher, scheduler and worker.

use thiserror::Error;

/// Failures talking to the coordination store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached; callers retry with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A value in the store did not have the expected shape.
    #[error("store protocol error: {0}")]
    Protocol(String),

    /// An atomic script was rejected by the store.
    #[error("store script error: {0}")]
    Script(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
            StoreError::Unavailable(e.to_string())
        } else if e.kind() == redis::ErrorKind::TypeError {
            StoreError::Protocol(e.to_string())
        } else {
            StoreError::Script(e.to_string())
        }
    }
}

/// Invalid startup configuration. Always fatal, raised before any store mutation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid mix entry `{0}`: expected name=weight")]
    MixEntry(String),

    #[error("invalid weight `{weight}` for profile `{profile}`")]
    MixWeight { profile: String, weight: String },

    #[error("mix is empty or all weights are zero")]
    EmptyMix,

    #[error("unknown profile `{0}`")]
    UnknownProfile(String),

    #[error("unknown weigher `{0}` (expected instances or vcpu)")]
    UnknownWeigher(String),

    #[error("unknown weigher order `{0}` (expected min or max)")]
    UnknownOrder(String),

    #[error("unknown CPU binding mode `{0}` (expected exclusive, shared or none)")]
    UnknownBinding(String),

    #[error("total task count must be positive")]
    ZeroTotal,

    #[error("invalid pacing: {0}")]
    Pacing(String),

    #[error("invalid profile definition `{name}`: {reason}")]
    Profile { name: String, reason: String },

    #[error("invalid core list `{0}`")]
    CoreList(String),

    #[error("invalid worker capacity: {0}")]
    Capacity(String),

    #[error("invalid node id `{0}`")]
    NodeId(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no input files with extension `.{extension}` under {dir}")]
    NoInputs { dir: String, extension: String },

    #[error("failed to read input directory {dir}: {source}")]
    InputDir {
        dir: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode task: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("task executable `{0}` not found")]
    ExecutableNotFound(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
