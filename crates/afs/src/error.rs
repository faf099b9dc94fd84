//! Error types shared across the file system, the metadata store and drivers.

use thiserror::Error;

/// Errors that can occur during file system operations
#[derive(Debug, Error)]
pub enum AfsError {
    /// No mounted module covers the path of a point operation
    #[error("no module mounted for path: {0}")]
    NoModule(String),
    /// Entry not found
    #[error("not found: {0}")]
    NotFound(String),
    /// The module does not implement the requested capability
    #[error("module {module} does not support {op}")]
    Unsupported {
        /// Name of the module
        module: String,
        /// Operation that was attempted
        op: &'static str,
    },
    /// Access denied by the module's access mode or policy
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Invalid path format
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// Malformed input (slot annotations, views, state transitions)
    #[error("validation error: {0}")]
    Validation(String),
    /// No registered driver can produce the requested view
    #[error("no driver for view: {0}")]
    NoDriver(String),
    /// A strict read gave up waiting for an in-flight generation
    #[error("timed out waiting for view generation: {0}")]
    Timeout(String),
    /// Error raised by a transformation driver
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
    /// Error from the metadata store
    #[error("metadata store error: {0}")]
    Metadata(#[from] rusqlite::Error),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization or deserialization failure
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Failure of a background task or poisoned lock
    #[error("internal error: {0}")]
    Internal(String),
}

impl AfsError {
    /// Shorthand for [`AfsError::Unsupported`].
    pub fn unsupported(module: &str, op: &'static str) -> Self {
        AfsError::Unsupported {
            module: module.to_string(),
            op,
        }
    }
}

impl From<serde_json::Error> for AfsError {
    fn from(err: serde_json::Error) -> Self {
        AfsError::Serialization(err.to_string())
    }
}

/// Errors raised by transformation drivers
#[derive(Debug, Error)]
pub enum DriverError {
    /// The driver needs an invocation context and none was supplied
    #[error("driver {0} requires an invocation context")]
    MissingContext(String),
    /// The generation backend failed or was cancelled
    #[error("generation failed: {0}")]
    Generation(String),
    /// The source entry cannot be transformed by this driver
    #[error("invalid source: {0}")]
    InvalidSource(String),
}

/// Result alias used throughout the crate
pub type Result<T, E = AfsError> = std::result::Result<T, E>;
