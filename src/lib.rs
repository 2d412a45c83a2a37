//! volback library
//!
//! Crash-consistent backups of Docker Compose service volumes: stop the
//! workloads, take one atomic ZFS snapshot of every volume, resume, then push
//! each snapshot into its own Borg repository and apply retention.

pub mod backends;
pub mod cli;
pub mod command_runner;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod process_guard;
pub mod retention;
pub mod run_state;
pub mod tools;
pub mod types;

// Re-export main types for convenience
pub use backends::{BackupRepository, VolumeStore, WorkloadController};
pub use command_runner::{run_tool, CommandRunner, SystemRunner, ToolError, ToolInvocation, ToolOutput};
pub use config::VolbackConfig;
pub use error::{BackendError, RunError, VolbackError, VolumeError};
pub use orchestrator::{
    BackupOrchestrator, OrchestratorOptions, OrphanPolicy, RunRequest, VolumeEntry, VolumeResult,
    VolumeSelector,
};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use retention::{Interval, PruneDecision, RetentionPolicy, RetentionRule};
pub use run_state::{CancelToken, RunRecord, RunStage, VolumeStage};
pub use tools::borg::{BorgRepository, BorgSettings, Passphrase};
pub use tools::compose::ComposeController;
pub use tools::zfs::ZfsStore;
pub use types::{
    Archive, GroupName, HealthStatus, OrphanSnapshot, RepositoryInfo, RunOutcome, RunReport,
    SnapshotLabel, Volume, VolumeName, VolumeOutcome, VolumeStatus,
};
