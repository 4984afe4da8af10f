//! Error types for the rwindex library.
//!
//! All fallible operations in this crate return [`Result`], whose error type
//! is the [`RwIndexError`] enum. The enum uses the `thiserror` crate for
//! automatic `Error` trait implementation and provides convenient
//! constructor methods for the common cases.
//!
//! # Examples
//!
//! ```
//! use rwindex::error::{RwIndexError, Result};
//!
//! fn example_operation() -> Result<()> {
//!     Err(RwIndexError::index("invalid term key length"))
//! }
//!
//! match example_operation() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;

use anyhow;
use thiserror::Error;

/// The main error type for rwindex operations.
#[derive(Error, Debug)]
pub enum RwIndexError {
    /// I/O errors (segment file operations, dumps, merges).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Index-related errors (key length mismatch, ordering violations).
    #[error("Index error: {0}")]
    Index(String),

    /// Storage-related errors (segment format, corrupt records).
    #[error("Storage error: {0}")]
    Storage(String),

    /// A bounded in-memory structure exceeded its configured capacity.
    ///
    /// Recoverable: the caller may trigger a dump to free memory and retry.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Serialization error (row encoding/decoding).
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Invalid operation (e.g. use after close).
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Background worker errors (failed join, dead queue).
    #[error("Dispatcher error: {0}")]
    Dispatcher(String),

    /// Generic error for other cases.
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error.
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with RwIndexError.
pub type Result<T> = std::result::Result<T, RwIndexError>;

impl RwIndexError {
    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        RwIndexError::Index(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        RwIndexError::Storage(msg.into())
    }

    /// Create a new capacity error.
    pub fn capacity<S: Into<String>>(msg: S) -> Self {
        RwIndexError::CapacityExceeded(msg.into())
    }

    /// Create a new serialization error.
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        RwIndexError::SerializationError(msg.into())
    }

    /// Create a new invalid operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        RwIndexError::InvalidOperation(msg.into())
    }

    /// Create a new dispatcher error.
    pub fn dispatcher<S: Into<String>>(msg: S) -> Self {
        RwIndexError::Dispatcher(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        RwIndexError::Other(msg.into())
    }
}
