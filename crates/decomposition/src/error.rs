//! Error type for domain decomposition.

use std::path::PathBuf;

use search::SearchError;
use thiserror::Error;

/// Failures raised by configuration, communication or the controller.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Invalid configuration, detected before any tree is built.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid JSON for the schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A peer could not be reached or hung up.
    #[error("communication with rank {rank} failed: {reason}")]
    Communication {
        /// Peer rank
        rank: usize,
        /// What went wrong
        reason: String,
    },

    /// Another rank aborted the group.
    #[error("process group aborted")]
    Aborted,

    /// Operation called out of order or message of the wrong kind.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Payload does not decode into the expected records.
    #[error("transport error: {0}")]
    Transport(String),

    /// Neighbour search failure.
    #[error(transparent)]
    Search(#[from] SearchError),
}
