//! Error handling module for volback
//!
//! Provides centralized error types using thiserror. The taxonomy follows the
//! propagation policy of a backup run: anything before workloads are resumed
//! is fatal to the run (`RunError`), anything after is scoped to one volume
//! (`VolumeError`) and only surfaces in the run report.

use thiserror::Error;

use crate::command_runner::ToolError;
use crate::run_state::RunTransitionError;

/// Main error type for everything outside a backup run's own failure policy
#[derive(Error, Debug)]
pub enum VolbackError {
    /// IO errors (config files, lock files, key files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// External tool failures outside of a run
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Collaborator failures outside of a run (maintenance commands)
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Run lock could not be acquired
    #[error("Lock error: {0}")]
    Lock(String),

    /// State machine misuse
    #[error(transparent)]
    Transition(#[from] RunTransitionError),

    /// General errors (catch-all for edge cases)
    #[error("{0}")]
    General(String),
}

/// Result type alias for volback operations
pub type Result<T> = std::result::Result<T, VolbackError>;

impl VolbackError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a lock error
    pub fn lock(msg: impl Into<String>) -> Self {
        Self::Lock(msg.into())
    }

    /// Create a general error
    pub fn general(msg: impl Into<String>) -> Self {
        Self::General(msg.into())
    }
}

/// Failure reported by a collaborator (volume store, workload controller,
/// backup repository).
#[derive(Error, Debug)]
pub enum BackendError {
    /// The snapshot label already exists on one or more volumes
    #[error("snapshot label '{label}' already exists on: {}", volumes.join(", "))]
    Conflict { label: String, volumes: Vec<String> },

    /// The underlying command failed, timed out or produced garbage
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// A named resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Repository integrity check reported damage
    #[error("integrity check failed: {0}")]
    Verification(String),

    /// The command reported success but the post-check disagrees
    #[error("{0}")]
    Unexpected(String),
}

impl BackendError {
    /// Create an unexpected-state error
    pub fn unexpected(msg: impl Into<String>) -> Self {
        Self::Unexpected(msg.into())
    }

    /// True when this is a label collision rather than an operational failure
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Errors that abort a whole run. Each variant is raised before workloads are
/// resumed; the orchestrator has already restored workload state when one of
/// these is reported.
#[derive(Error, Debug)]
pub enum RunError {
    /// Bad volume/workload/repository mapping; no side effect occurred
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// Another run holds the run lock
    #[error("another backup run is in progress: {0}")]
    RunInProgress(String),

    /// Cancelled by the caller
    #[error("run cancelled")]
    Cancelled,

    /// A workload group refused to stop
    #[error("failed to stop workload group '{group}': {source}")]
    WorkloadStopFailed {
        group: String,
        #[source]
        source: BackendError,
    },

    /// The group snapshot could not be taken
    #[error("snapshot '{label}' failed: {source}")]
    SnapshotFailed {
        label: String,
        #[source]
        source: BackendError,
    },

    /// The label is already in use on one of the target volumes
    #[error("snapshot label '{label}' already exists on: {}", volumes.join(", "))]
    SnapshotConflict { label: String, volumes: Vec<String> },
}

impl RunError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::ConfigurationError(msg.into())
    }

    /// Stable machine-readable kind, used in JSON reports
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigurationError(_) => "configuration-error",
            Self::RunInProgress(_) => "run-in-progress",
            Self::Cancelled => "cancelled",
            Self::WorkloadStopFailed { .. } => "workload-stop-failed",
            Self::SnapshotFailed { .. } => "snapshot-failed",
            Self::SnapshotConflict { .. } => "snapshot-conflict",
        }
    }
}

/// Per-volume failure, recorded in the report and never propagated
#[derive(Error, Debug)]
pub enum VolumeError {
    /// Pushing the snapshot into the repository failed
    #[error("backup of '{volume}' failed: {source}")]
    BackupFailed {
        volume: String,
        #[source]
        source: BackendError,
    },

    /// Retention pruning failed after a successful push
    #[error("prune of '{volume}' failed: {source}")]
    PruneFailed {
        volume: String,
        #[source]
        source: BackendError,
    },

    /// The volume's snapshot copy could not be destroyed
    #[error("cleanup of snapshot for '{volume}' failed: {source}")]
    CleanupFailed {
        volume: String,
        #[source]
        source: BackendError,
    },
}
