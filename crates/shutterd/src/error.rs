//! Error types for shutterd.
//!
//! This module defines all error types used throughout the shutterd crate.
//! Only [`Error::HardwareUnavailable`]-class startup failures terminate the
//! daemon; every other error is absorbed by its owning component and leaves
//! the daemon in a well-defined, continuing state.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for shutterd operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Capture Errors ===
    /// The capture tool is entirely absent. Fatal at daemon startup.
    #[error("capture tool '{tool}' not found; install it and restart")]
    HardwareUnavailable {
        /// Name of the missing capture tool.
        tool: String,
    },

    /// A capture process failed. Recoverable: the controller logs and
    /// returns to idle.
    #[error("capture process error: {message}")]
    CaptureProcess {
        /// Description of what went wrong.
        message: String,
    },

    // === Disk Errors ===
    /// Free space is below the critical watermark. Blocks new captures
    /// until the disk monitor clears the condition.
    #[error("disk space critical: {free_bytes} bytes free")]
    DiskCritical {
        /// Bytes currently free on the output volume.
        free_bytes: u64,
    },

    // === Upload Errors ===
    /// Authentication with the remote store failed. Pauses the upload
    /// worker only.
    #[error("authentication error: {message}")]
    Auth {
        /// Description of the auth failure.
        message: String,
    },

    /// A transient network failure; retried with backoff.
    #[error("transient network error: {message}")]
    NetworkTransient {
        /// Description of the transient failure.
        message: String,
    },

    /// A permanent network failure; the task is marked failed and the
    /// local file retained.
    #[error("fatal network error: {message}")]
    NetworkFatal {
        /// Description of the permanent failure.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An operation timed out.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for shutterd operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new capture process error.
    #[must_use]
    pub fn capture_process(message: impl Into<String>) -> Self {
        Self::CaptureProcess {
            message: message.into(),
        }
    }

    /// Create a new auth error.
    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a new timeout error.
    #[must_use]
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Check if this error should terminate the daemon at startup.
    #[must_use]
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, Self::HardwareUnavailable { .. })
    }

    /// Check if this error is a disk admission veto.
    #[must_use]
    pub fn is_disk_critical(&self) -> bool {
        matches!(self, Self::DiskCritical { .. })
    }
}
