//! Collaborator contracts consumed by the orchestrator.
//!
//! The orchestrator only ever talks to these three traits. Concrete adapters
//! for ZFS, Docker Compose and Borg live in [`crate::tools`]; tests plug in
//! in-memory fakes.

use chrono::NaiveDateTime;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{info, warn};

use crate::error::BackendError;
use crate::retention::RetentionPolicy;
use crate::types::{
    Archive, GroupName, HealthStatus, PushOutcome, RepositoryInfo, Snapshot, SnapshotGroup,
    SnapshotLabel, SnapshotRef, VerifyDepth, VolumeName,
};

/// Creates, lists and destroys point-in-time captures of volumes.
pub trait VolumeStore: Send + Sync {
    /// Capture every named volume under one label, atomically.
    ///
    /// Either a capture exists for every volume afterwards or for none of
    /// them. Returns `BackendError::Conflict` without creating anything when
    /// the label already exists on any of the volumes.
    fn snapshot(
        &self,
        volumes: &[VolumeName],
        label: &SnapshotLabel,
    ) -> Result<SnapshotGroup, BackendError>;

    /// Destroy one volume's capture. Absent captures are not an error.
    fn destroy(&self, label: &SnapshotLabel, volume: &VolumeName) -> Result<(), BackendError>;

    /// Captures of one volume, oldest first
    fn list(&self, volume: &VolumeName) -> Result<Vec<Snapshot>, BackendError>;

    /// Where a repository can read the capture from
    fn resolve(&self, label: &SnapshotLabel, volume: &VolumeName)
    -> Result<SnapshotRef, BackendError>;
}

/// Stops and starts workload groups.
///
/// Both calls are idempotent and return only once the group reached the
/// requested state.
pub trait WorkloadController: Send + Sync {
    fn stop(&self, groups: &BTreeSet<GroupName>) -> Result<(), BackendError>;

    fn start(&self, groups: &BTreeSet<GroupName>) -> Result<(), BackendError>;
}

/// One volume's durable, deduplicated archive store.
pub trait BackupRepository: Send + Sync {
    /// Stable identity of the repository, used to enforce one repository
    /// per volume
    fn location(&self) -> String;

    /// Create the repository if missing. Returns true when it was created.
    fn ensure_initialized(&self) -> Result<bool, BackendError>;

    /// Archive the capture. Pushing a label that already has an archive
    /// returns that archive with `created == false`.
    fn push(&self, snapshot: &SnapshotRef) -> Result<PushOutcome, BackendError>;

    /// Archives managed by volback, in any order
    fn list(&self) -> Result<Vec<Archive>, BackendError>;

    /// Delete one archive by name
    fn delete(&self, archive: &str) -> Result<(), BackendError>;

    /// Restore one archive into `dest`, which must be empty or absent
    fn extract(&self, archive: &str, dest: &Path) -> Result<(), BackendError>;

    /// Repository-wide statistics
    fn info(&self) -> Result<RepositoryInfo, BackendError>;

    /// Reclaim space freed by deletions
    fn compact(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Apply `policy` and return the names of removed archives.
    ///
    /// The decision comes from [`RetentionPolicy::plan`], so the newest
    /// archive survives whatever the repository implementation does.
    fn prune(
        &self,
        policy: &RetentionPolicy,
        now: NaiveDateTime,
    ) -> Result<Vec<String>, BackendError> {
        let archives = self.list()?;
        let decision = policy.plan(&archives, now);

        if decision.remove.is_empty() {
            info!(repository = %self.location(), kept = decision.keep.len(), "nothing to prune");
            return Ok(Vec::new());
        }

        let mut removed = Vec::with_capacity(decision.remove.len());
        for name in &decision.remove {
            self.delete(name)?;
            removed.push(name.clone());
        }

        if let Err(e) = self.compact() {
            // Deleted archives are gone either way; space is reclaimed next time
            warn!(repository = %self.location(), error = %e, "compact after prune failed");
        }

        info!(
            repository = %self.location(),
            removed = removed.len(),
            kept = decision.keep.len(),
            "pruned archives"
        );
        Ok(removed)
    }

    /// Check repository integrity
    fn verify(&self, depth: VerifyDepth) -> Result<HealthStatus, BackendError>;

    /// Write the repository key to `path` and prove it decrypts the repository
    fn export_key(&self, path: &Path) -> Result<(), BackendError>;
}
