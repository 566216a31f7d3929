//! Unified error types for the cellblock workspace.
//!
//! Kernel-facing failures keep the `errno` of the syscall that produced them
//! so callers can recover the negative error code the launcher API reports.

use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum CellblockError {
    /// An I/O operation on a host path failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A raw syscall failed.
    #[error("{op} failed: {source}")]
    Sys {
        /// Short description of the failing operation.
        op: String,
        /// The `errno` reported by the kernel.
        source: Errno,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// An operation was attempted in the wrong lifecycle state.
    #[error("container {name} is {state}, cannot {op}")]
    InvalidState {
        /// Container name.
        name: String,
        /// Current lifecycle state.
        state: crate::types::ContainerState,
        /// Rejected operation.
        op: &'static str,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl CellblockError {
    /// Builds a [`CellblockError::Sys`] from an operation label and errno.
    pub fn sys(op: impl Into<String>, source: Errno) -> Self {
        Self::Sys {
            op: op.into(),
            source,
        }
    }

    /// Builds a [`CellblockError::Config`] from a message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns the kernel `errno` behind this error, if there is one.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Sys { source, .. } => Some(*source),
            Self::Io { source, .. } => source.raw_os_error().map(Errno::from_raw),
            Self::NotFound { .. } => Some(Errno::ENOENT),
            Self::Config { .. } | Self::InvalidState { .. } | Self::Serialization { .. } => None,
        }
    }

    /// Returns the negative error code for this error.
    ///
    /// Syscall failures report their own `errno`; everything else is
    /// `-EINVAL`.
    pub fn code(&self) -> i32 {
        -(self.errno().unwrap_or(Errno::EINVAL) as i32)
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CellblockError>;
