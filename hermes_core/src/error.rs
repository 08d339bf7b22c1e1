//! Unified error handling for HERMES.
//!
//! Every fallible operation in the bus returns [`HermesResult`]; success is
//! `Ok(())`, never a sentinel variant.

use thiserror::Error;

/// Main error type for HERMES operations
#[derive(Debug, Error)]
pub enum HermesError {
    /// I/O related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input/argument errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation attempted before initialization or after shutdown
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// Already exists errors (for creation/registration operations)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Resource not found errors
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Network transport errors
    #[error("Network error: {0}")]
    Network(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Shared memory and ring buffer errors
    #[error("Memory error: {0}")]
    Memory(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/Deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Payload exceeds the maximum block size of the target channel
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    /// Internal errors with source location for debugging.
    /// Use the `hermes_internal!()` macro to create these; it captures
    /// file/line automatically.
    #[error("Internal error: {message} (at {file}:{line})")]
    Internal {
        message: String,
        file: &'static str,
        line: u32,
    },
}

/// Create an internal error with automatic file/line capture.
///
/// ```rust,ignore
/// use hermes_core::hermes_internal;
/// return Err(hermes_internal!("unexpected dispatch state: {:?}", state));
/// ```
#[macro_export]
macro_rules! hermes_internal {
    ($($arg:tt)*) => {
        $crate::error::HermesError::Internal {
            message: format!($($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// Convenience type alias for Results using HermesError
pub type HermesResult<T> = std::result::Result<T, HermesError>;

/// Short alias: `Result<T>` is equivalent to `HermesResult<T>`
pub type Result<T> = HermesResult<T>;

// ============================================
// From implementations for common error types
// ============================================

impl From<serde_json::Error> for HermesError {
    fn from(err: serde_json::Error) -> Self {
        HermesError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for HermesError {
    fn from(err: bincode::Error) -> Self {
        HermesError::Serialization(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for HermesError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        HermesError::Internal {
            message: "Lock poisoned".to_string(),
            file: file!(),
            line: line!(),
        }
    }
}

// Helper methods
impl HermesError {
    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        HermesError::InvalidInput(msg.into())
    }

    /// Create a not-initialized error
    pub fn not_initialized<S: Into<String>>(msg: S) -> Self {
        HermesError::NotInitialized(msg.into())
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        HermesError::NotFound(msg.into())
    }

    /// Create a network error
    pub fn network<S: Into<String>>(msg: S) -> Self {
        HermesError::Network(msg.into())
    }

    /// Create a memory error
    pub fn memory<S: Into<String>>(msg: S) -> Self {
        HermesError::Memory(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        HermesError::Config(msg.into())
    }
}
