//! Error types for the history subsystem

use crate::core::event::{ObjectId, PropertyId};
use crate::core::time_id::TimeId;
use thiserror::Error;

/// Result type alias for history operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the history subsystem
#[derive(Error, Debug)]
pub enum Error {
    /// A blob referenced by the event graph is missing from the store.
    ///
    /// The graph and the store disagree; the operation is aborted.
    #[error("Storage read error: missing entry {key}")]
    StorageRead { key: String },

    /// Container-level storage errors (corruption, bad header, checksum)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No value could be located for a property walking back from a time
    #[error("No stored value for object {object} property {property} at {time}")]
    MissingValue {
        object: ObjectId,
        property: PropertyId,
        time: TimeId,
    },

    /// The requested event is not part of the graph
    #[error("Unknown event: {0}")]
    UnknownEvent(TimeId),

    /// A collaborator failed to produce or apply data
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// The operation cannot run in the current history state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
