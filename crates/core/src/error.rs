//! Error types for the feature cache
//!
//! This module defines the error type shared by every layer of the cache.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Per-record backend failures are not surfaced through this type: they are
//! logged and skipped at the batch level. Only caller-visible failures
//! (capacity, bad arguments, configuration, I/O during setup) end up here.

use std::io;
use thiserror::Error;

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the feature cache
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file operations on the secondary store)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Insert would push the entry count past the configured maximum
    #[error("Capacity exceeded: {current} entries + {incoming} incoming > maximum {max}")]
    CapacityExceeded {
        /// Entries currently in the cache
        current: usize,
        /// Records in the rejected batch
        incoming: usize,
        /// Configured maximum entry count
        max: usize,
    },

    /// Malformed caller input (empty id set, bad range, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Data corruption detected while decoding a stored record
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Cipher or codec failure
    #[error("Codec error: {0}")]
    CodecError(String),

    /// External registry failure
    #[error("Registry error: {0}")]
    RegistryError(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Background worker pool refused or lost a task
    #[error("Scheduler error: {0}")]
    SchedulerError(String),
}

impl Error {
    /// Convenience constructor for [`Error::InvalidArgument`]
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Convenience constructor for [`Error::Corruption`]
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Whether this error is the atomic capacity rejection of an insert
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Error::CapacityExceeded { .. })
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}
