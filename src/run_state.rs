//! Backup Run State Machine
//!
//! This module provides the authoritative record of one backup run. It
//! enforces valid transitions so that partial-failure states are explicit
//! values rather than whatever a linear script happened to reach.
//!
//! # Design Principles
//!
//! - **Run-Scoped**: A `RunRecord` is created per run, passed explicitly and
//!   dropped when the run ends. Nothing about a run lives in a static.
//! - **Validated Transitions**: Only the edges below are accepted.
//! - **Rollback Basis**: The record knows which groups were stopped and
//!   whether a snapshot exists, which is exactly what cleanup needs.
//!
//! # Run Flow
//!
//! ```text
//! Idle ─────────────────────┐ every volume reuses an earlier capture
//!   ↓                      │
//! Stopping ──────────┐     │
//!   ↓                │
//! Snapshotting ──────┤
//!   ↓                ├─→ Aborting ─→ Aborted
//! Resuming ──────────┘     │
//!   ↓                      │
//! BackingUp ←──────────────┘
//!   ↓
//! Done | PartialFailure
//! ```
//!
//! # Volume Flow
//!
//! ```text
//! Pending ─→ BackingUp ─→ Pruning ─→ CleaningSnapshot ─→ Succeeded | PruneFailed
//!    │           └─→ BackupFailed
//!    └─→ Skipped
//! ```

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::types::{GroupName, SnapshotLabel, VolumeName, VolumeStatus};

/// Run-level stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStage {
    /// Validated, nothing touched yet
    Idle,
    /// Stopping workload groups
    Stopping,
    /// Taking the group snapshot (workloads are down)
    Snapshotting,
    /// Starting workload groups again
    Resuming,
    /// Per-volume push / prune / cleanup
    BackingUp,
    /// Every volume succeeded (terminal)
    Done,
    /// Some volumes failed (terminal)
    PartialFailure,
    /// Restoring workload state after a fatal error
    Aborting,
    /// Run aborted (terminal)
    Aborted,
}

impl RunStage {
    /// Returns true for Done, PartialFailure and Aborted
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::PartialFailure | Self::Aborted)
    }

    /// True while workloads may be stopped
    #[inline]
    pub const fn is_critical(self) -> bool {
        matches!(self, Self::Stopping | Self::Snapshotting | Self::Resuming)
    }

    /// Stages reachable from this one
    pub const fn successors(self) -> &'static [Self] {
        match self {
            Self::Idle => &[Self::Stopping, Self::BackingUp],
            Self::Stopping => &[Self::Snapshotting, Self::Aborting],
            Self::Snapshotting => &[Self::Resuming, Self::Aborting],
            Self::Resuming => &[Self::BackingUp, Self::Aborting],
            Self::BackingUp => &[Self::Done, Self::PartialFailure],
            Self::Aborting => &[Self::Aborted],
            Self::Done | Self::PartialFailure | Self::Aborted => &[],
        }
    }

    /// Returns a human-readable description of this stage
    pub const fn description(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Stopping => "Stopping workloads",
            Self::Snapshotting => "Taking snapshot",
            Self::Resuming => "Resuming workloads",
            Self::BackingUp => "Backing up volumes",
            Self::Done => "Done",
            Self::PartialFailure => "Partial failure",
            Self::Aborting => "Aborting",
            Self::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Per-volume stages inside the BackingUp phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeStage {
    Pending,
    BackingUp,
    Pruning,
    CleaningSnapshot,
    Succeeded,
    BackupFailed,
    PruneFailed,
    Skipped,
}

impl VolumeStage {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::BackupFailed | Self::PruneFailed | Self::Skipped
        )
    }

    pub const fn successors(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::BackingUp, Self::Skipped],
            Self::BackingUp => &[Self::Pruning, Self::BackupFailed],
            Self::Pruning => &[Self::CleaningSnapshot],
            Self::CleaningSnapshot => &[Self::Succeeded, Self::PruneFailed],
            Self::Succeeded | Self::BackupFailed | Self::PruneFailed | Self::Skipped => &[],
        }
    }

    /// Reported status for a terminal stage
    pub const fn status(self) -> Option<VolumeStatus> {
        match self {
            Self::Succeeded => Some(VolumeStatus::Succeeded),
            Self::BackupFailed => Some(VolumeStatus::BackupFailed),
            Self::PruneFailed => Some(VolumeStatus::PruneFailed),
            Self::Skipped => Some(VolumeStatus::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for VolumeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::BackingUp => "backing up",
            Self::Pruning => "pruning",
            Self::CleaningSnapshot => "cleaning snapshot",
            Self::Succeeded => "succeeded",
            Self::BackupFailed => "backup failed",
            Self::PruneFailed => "prune failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunTransitionError {
    /// Edge not present in the run graph
    #[error("Cannot move run from '{from}' to '{to}'")]
    InvalidRunTransition { from: RunStage, to: RunStage },

    /// Attempted to transition from a terminal state
    #[error("Run is already finished ({from})")]
    FromTerminalState { from: RunStage },

    /// Edge not present in the volume graph
    #[error("Cannot move volume '{volume}' from '{from}' to '{to}'")]
    InvalidVolumeTransition {
        volume: String,
        from: VolumeStage,
        to: VolumeStage,
    },

    /// Volume is not part of this run
    #[error("Volume '{0}' is not part of this run")]
    UnknownVolume(String),
}

/// Cooperative cancellation flag shared between the caller (signal handler,
/// test) and the run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The run decides when it is safe to honour it.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything known about one in-flight run.
///
/// # Example
///
/// ```
/// use volback::run_state::{RunRecord, RunStage};
/// use volback::types::SnapshotLabel;
///
/// let mut record = RunRecord::new(SnapshotLabel::new("nightly").unwrap(), Vec::new());
/// record.transition_to(RunStage::Stopping).unwrap();
///
/// // Cannot skip the snapshot
/// assert!(record.transition_to(RunStage::BackingUp).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct RunRecord {
    label: SnapshotLabel,
    current: RunStage,
    /// Stages entered, with wall-clock timestamps
    history: Vec<(RunStage, DateTime<Utc>)>,
    /// Groups this run has stopped and not yet restarted
    stopped_groups: BTreeSet<GroupName>,
    /// True while captures at `label` created by this run still exist
    snapshot_taken: bool,
    volumes: BTreeMap<VolumeName, VolumeStage>,
    resume_warning: Option<String>,
    downtime_started: Option<Instant>,
    downtime: Option<Duration>,
}

impl RunRecord {
    /// Create a record in the Idle state
    pub fn new(label: SnapshotLabel, volumes: impl IntoIterator<Item = VolumeName>) -> Self {
        Self {
            label,
            current: RunStage::Idle,
            history: vec![(RunStage::Idle, Utc::now())],
            stopped_groups: BTreeSet::new(),
            snapshot_taken: false,
            volumes: volumes
                .into_iter()
                .map(|v| (v, VolumeStage::Pending))
                .collect(),
            resume_warning: None,
            downtime_started: None,
            downtime: None,
        }
    }

    #[inline]
    pub fn label(&self) -> &SnapshotLabel {
        &self.label
    }

    #[inline]
    pub fn current_stage(&self) -> RunStage {
        self.current
    }

    pub fn history(&self) -> &[(RunStage, DateTime<Utc>)] {
        &self.history
    }

    /// Move the run along one edge of the run graph.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if the run already finished
    /// - `InvalidRunTransition` for any edge not in the graph
    pub fn transition_to(&mut self, target: RunStage) -> Result<RunStage, RunTransitionError> {
        if self.current.is_terminal() {
            return Err(RunTransitionError::FromTerminalState { from: self.current });
        }
        if !self.current.successors().contains(&target) {
            return Err(RunTransitionError::InvalidRunTransition {
                from: self.current,
                to: target,
            });
        }

        tracing::debug!(from = %self.current, to = %target, "run transition");
        self.history.push((target, Utc::now()));
        self.current = target;
        Ok(target)
    }

    /// Record that a group has been stopped by this run
    pub fn mark_stopped(&mut self, group: GroupName) {
        self.stopped_groups.insert(group);
    }

    /// Forget stopped groups once they have been started again
    pub fn clear_stopped(&mut self) {
        self.stopped_groups.clear();
    }

    pub fn stopped_groups(&self) -> &BTreeSet<GroupName> {
        &self.stopped_groups
    }

    pub fn set_snapshot_taken(&mut self, taken: bool) {
        self.snapshot_taken = taken;
    }

    #[inline]
    pub fn snapshot_taken(&self) -> bool {
        self.snapshot_taken
    }

    /// Start the downtime clock (first stop call)
    pub fn begin_downtime(&mut self) {
        if self.downtime_started.is_none() {
            self.downtime_started = Some(Instant::now());
        }
    }

    /// Stop the downtime clock (resume finished)
    pub fn end_downtime(&mut self) {
        if let Some(started) = self.downtime_started {
            self.downtime = Some(started.elapsed());
        }
    }

    pub fn downtime(&self) -> Option<Duration> {
        self.downtime
    }

    pub fn set_resume_warning(&mut self, warning: String) {
        self.resume_warning = Some(warning);
    }

    pub fn resume_warning(&self) -> Option<&str> {
        self.resume_warning.as_deref()
    }

    /// Current stage of one volume
    pub fn volume_stage(&self, volume: &VolumeName) -> Option<VolumeStage> {
        self.volumes.get(volume).copied()
    }

    pub fn volumes(&self) -> impl Iterator<Item = (&VolumeName, VolumeStage)> {
        self.volumes.iter().map(|(name, stage)| (name, *stage))
    }

    /// Move one volume along its graph
    pub fn transition_volume(
        &mut self,
        volume: &VolumeName,
        target: VolumeStage,
    ) -> Result<VolumeStage, RunTransitionError> {
        let current = self
            .volumes
            .get_mut(volume)
            .ok_or_else(|| RunTransitionError::UnknownVolume(volume.to_string()))?;

        if !current.successors().contains(&target) {
            return Err(RunTransitionError::InvalidVolumeTransition {
                volume: volume.to_string(),
                from: *current,
                to: target,
            });
        }

        tracing::debug!(volume = %volume, from = %current, to = %target, "volume transition");
        *current = target;
        Ok(target)
    }

    /// Volumes that ended in a failure state
    pub fn failed_volumes(&self) -> Vec<VolumeName> {
        self.volumes
            .iter()
            .filter(|(_, stage)| {
                matches!(stage, VolumeStage::BackupFailed | VolumeStage::PruneFailed)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// True once every volume reached a terminal stage
    pub fn all_volumes_settled(&self) -> bool {
        self.volumes.values().all(|stage| stage.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(volumes: &[&str]) -> RunRecord {
        RunRecord::new(
            SnapshotLabel::new("test").unwrap(),
            volumes.iter().map(|v| VolumeName::new(*v).unwrap()),
        )
    }

    fn vol(name: &str) -> VolumeName {
        VolumeName::new(name).unwrap()
    }

    #[test]
    fn test_record_starts_idle() {
        let rec = record(&["db"]);
        assert_eq!(rec.current_stage(), RunStage::Idle);
        assert_eq!(rec.history().len(), 1);
        assert!(!rec.snapshot_taken());
        assert_eq!(rec.volume_stage(&vol("db")), Some(VolumeStage::Pending));
    }

    #[test]
    fn test_happy_path() {
        let mut rec = record(&[]);
        for stage in [
            RunStage::Stopping,
            RunStage::Snapshotting,
            RunStage::Resuming,
            RunStage::BackingUp,
            RunStage::Done,
        ] {
            rec.transition_to(stage).expect("valid transition");
        }
        assert!(rec.current_stage().is_terminal());
        assert_eq!(rec.history().len(), 6);
    }

    #[test]
    fn test_resume_only_run_goes_straight_to_backing_up() {
        let mut rec = record(&["db"]);
        rec.transition_to(RunStage::BackingUp).unwrap();
        rec.transition_to(RunStage::Done).unwrap();
        assert_eq!(rec.history().len(), 3);
        assert!(!RunStage::Idle.successors().contains(&RunStage::Snapshotting));
    }

    #[test]
    fn test_cannot_skip_snapshot() {
        let mut rec = record(&[]);
        rec.transition_to(RunStage::Stopping).unwrap();
        let err = rec.transition_to(RunStage::Resuming).unwrap_err();
        assert_eq!(
            err,
            RunTransitionError::InvalidRunTransition {
                from: RunStage::Stopping,
                to: RunStage::Resuming
            }
        );
    }

    #[test]
    fn test_abort_reachable_only_from_critical_stages() {
        for stage in [RunStage::Stopping, RunStage::Snapshotting, RunStage::Resuming] {
            assert!(stage.is_critical());
            assert!(stage.successors().contains(&RunStage::Aborting));
        }
        assert!(!RunStage::Idle.successors().contains(&RunStage::Aborting));
        assert!(!RunStage::BackingUp.successors().contains(&RunStage::Aborting));
    }

    #[test]
    fn test_cannot_leave_terminal_state() {
        let mut rec = record(&[]);
        rec.transition_to(RunStage::Stopping).unwrap();
        rec.transition_to(RunStage::Aborting).unwrap();
        rec.transition_to(RunStage::Aborted).unwrap();

        let err = rec.transition_to(RunStage::Stopping).unwrap_err();
        assert!(matches!(err, RunTransitionError::FromTerminalState { .. }));
    }

    #[test]
    fn test_volume_happy_path_and_failures() {
        let mut rec = record(&["db", "media", "wiki"]);

        rec.transition_volume(&vol("db"), VolumeStage::BackingUp).unwrap();
        rec.transition_volume(&vol("db"), VolumeStage::Pruning).unwrap();
        rec.transition_volume(&vol("db"), VolumeStage::CleaningSnapshot).unwrap();
        rec.transition_volume(&vol("db"), VolumeStage::Succeeded).unwrap();

        rec.transition_volume(&vol("media"), VolumeStage::BackingUp).unwrap();
        rec.transition_volume(&vol("media"), VolumeStage::BackupFailed).unwrap();

        rec.transition_volume(&vol("wiki"), VolumeStage::Skipped).unwrap();

        assert!(rec.all_volumes_settled());
        assert_eq!(rec.failed_volumes(), vec![vol("media")]);
    }

    #[test]
    fn test_prune_failure_is_recorded_after_cleanup() {
        let mut rec = record(&["db"]);
        rec.transition_volume(&vol("db"), VolumeStage::BackingUp).unwrap();
        rec.transition_volume(&vol("db"), VolumeStage::Pruning).unwrap();

        let err = rec
            .transition_volume(&vol("db"), VolumeStage::PruneFailed)
            .unwrap_err();
        assert!(matches!(err, RunTransitionError::InvalidVolumeTransition { .. }));

        rec.transition_volume(&vol("db"), VolumeStage::CleaningSnapshot).unwrap();
        rec.transition_volume(&vol("db"), VolumeStage::PruneFailed).unwrap();
        assert_eq!(rec.failed_volumes(), vec![vol("db")]);
    }

    #[test]
    fn test_volume_cannot_skip_push() {
        let mut rec = record(&["db"]);
        let err = rec
            .transition_volume(&vol("db"), VolumeStage::Pruning)
            .unwrap_err();
        assert!(matches!(err, RunTransitionError::InvalidVolumeTransition { .. }));
    }

    #[test]
    fn test_unknown_volume() {
        let mut rec = record(&["db"]);
        let err = rec
            .transition_volume(&vol("other"), VolumeStage::BackingUp)
            .unwrap_err();
        assert_eq!(err, RunTransitionError::UnknownVolume("other".to_string()));
    }

    #[test]
    fn test_terminal_volume_status() {
        assert_eq!(VolumeStage::Succeeded.status(), Some(VolumeStatus::Succeeded));
        assert_eq!(VolumeStage::Pruning.status(), None);
    }

    #[test]
    fn test_stopped_groups_tracking() {
        let mut rec = record(&[]);
        rec.mark_stopped(GroupName::new("x").unwrap());
        rec.mark_stopped(GroupName::new("y").unwrap());
        assert_eq!(rec.stopped_groups().len(), 2);
        rec.clear_stopped();
        assert!(rec.stopped_groups().is_empty());
    }

    #[test]
    fn test_downtime_measured_once() {
        let mut rec = record(&[]);
        assert!(rec.downtime().is_none());
        rec.begin_downtime();
        rec.end_downtime();
        assert!(rec.downtime().is_some());
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_error_display() {
        let err = RunTransitionError::FromTerminalState {
            from: RunStage::Done,
        };
        assert_eq!(err.to_string(), "Run is already finished (Done)");
    }
}
