//! Engine-level error types

use filedex_storage::FileId;
use filedex_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Error, Debug)]
pub enum IndexError {
    /// Persisted data of an index could not be read or written
    #[error("storage fault in index {index}: {source}")]
    Storage {
        index: String,
        #[source]
        source: StorageError,
    },

    /// The user-supplied indexer failed on one file
    #[error("indexer of {index} failed on file {file}: {message}")]
    Indexer {
        index: String,
        file: FileId,
        message: String,
    },

    /// The host cancelled the running operation
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// No index is registered under this name
    #[error("unknown index: {0}")]
    UnknownIndex(String),

    /// Invalid engine configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl IndexError {
    pub fn storage(index: &str, source: StorageError) -> Self {
        Self::Storage {
            index: index.to_string(),
            source,
        }
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// Two definitions share one index name
    #[error("index {0} is already registered")]
    AlreadyRegistered(String),

    /// The engine already froze its registry
    #[error("cannot register index {0}: registry is frozen")]
    FrozenRegistry(String),

    /// A typed lookup used the wrong key/value types
    #[error("index {0} was requested with key/value types it was not registered with")]
    TypeMismatch(String),
}
