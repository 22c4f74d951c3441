//! Unified error types for the urun workspace.
//!
//! Conditions with no algorithmic fallback (a required external tool is
//! missing) are kept as a distinct variant so the binary can terminate on
//! them, while verification mismatches travel as plain `false` results.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum UrunError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
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

    /// An execution mode token is not one of the known modes.
    #[error("invalid execution mode: {mode:?}")]
    InvalidMode {
        /// The rejected token.
        mode: String,
    },

    /// An execution mode is known but has no engine bound to it.
    #[error("execution mode {mode} has no execution engine")]
    NoEngine {
        /// The mode without an engine.
        mode: String,
    },

    /// A required external tool could not be located.
    #[error("{tool} executable not found (searched: {searched})")]
    ToolMissing {
        /// Logical name of the tool.
        tool: &'static str,
        /// Candidate names or locations that were tried.
        searched: String,
    },

    /// An external tool ran but reported failure.
    #[error("{tool} failed: {message}")]
    ToolFailed {
        /// Program that was invoked.
        tool: String,
        /// Exit status or stderr summary.
        message: String,
    },

    /// An external tool did not finish within the configured bound.
    #[error("{tool} timed out after {seconds}s")]
    Timeout {
        /// Program that was invoked.
        tool: String,
        /// Timeout that expired.
        seconds: u64,
    },

    /// A permission or ownership error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl UrunError {
    /// Builds an [`UrunError::Io`] for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns whether no fallback exists for this error and the process
    /// should terminate.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::ToolMissing { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, UrunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_missing_is_fatal() {
        let err = UrunError::ToolMissing {
            tool: "patchelf",
            searched: "patchelf-x86_64, patchelf".into(),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("patchelf"));
    }

    #[test]
    fn io_error_is_not_fatal_and_names_path() {
        let err = UrunError::io("/tmp/x", std::io::Error::other("boom"));
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("/tmp/x"));
    }
}
