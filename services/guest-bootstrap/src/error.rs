//! Error types for the bootstrap agent.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use vmbuild_plan::PlanError;

/// Bootstrap errors with standardized reason codes. Every variant is fatal
/// to the run; nothing is retried.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// TLS material or agent configuration is missing or malformed.
    #[error("configuration_error: {0}")]
    Configuration(String),

    /// Could not reach or complete a handshake with the plan server.
    #[error("connection_failed: {0}")]
    Connection(String),

    /// The plan server sent something other than a complete plan.
    #[error("protocol_error: {0}")]
    Protocol(String),

    /// A transfer entry references a source absent from the manifest.
    #[error("resource_not_found: no resolved resources for source '{source_path}'")]
    ResourceNotFound { source_path: String },

    /// Filesystem create/write/permission failure.
    #[error("io_error: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A shell command could not be launched or exited unsuccessfully.
    #[error("execution_failed: '{command}': {detail}")]
    Execution {
        command: String,
        exit_code: Option<i32>,
        detail: String,
    },

    /// A plan entry failed; wraps the entry's own error.
    #[error("plan entry {index} ({command}) failed: {source}")]
    EntryFailed {
        index: usize,
        command: String,
        #[source]
        source: Box<BootstrapError>,
    },
}

impl BootstrapError {
    /// Get the standardized reason code for this error. For entry failures
    /// this is the code of the underlying error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            BootstrapError::Configuration(_) => "configuration_error",
            BootstrapError::Connection(_) => "connection_failed",
            BootstrapError::Protocol(_) => "protocol_error",
            BootstrapError::ResourceNotFound { .. } => "resource_not_found",
            BootstrapError::Io { .. } => "io_error",
            BootstrapError::Execution { .. } => "execution_failed",
            BootstrapError::EntryFailed { source, .. } => source.reason_code(),
        }
    }

    /// Index of the plan entry that produced this error, if any.
    pub fn entry_index(&self) -> Option<usize> {
        match self {
            BootstrapError::EntryFailed { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        BootstrapError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn in_entry(self, index: usize, command: &str) -> Self {
        BootstrapError::EntryFailed {
            index,
            command: command.to_string(),
            source: Box::new(self),
        }
    }
}

impl From<PlanError> for BootstrapError {
    fn from(err: PlanError) -> Self {
        BootstrapError::Protocol(err.to_string())
    }
}

pub type Result<T, E = BootstrapError> = std::result::Result<T, E>;
