//! Backup Orchestrator
//!
//! Sequences one backup run across many volumes:
//!
//! ```text
//! stop groups ─→ snapshot(all volumes, one label) ─→ start groups
//!                                                        │
//!             ┌──────────────────────────────────────────┘
//!             ↓ per volume, on a bounded worker pool
//!        push ─→ prune ─→ destroy snapshot
//! ```
//!
//! # Failure Policy
//!
//! - Pre-flight problems (mapping, lock, early cancellation) are `Err` and
//!   nothing has been touched.
//! - Anything before workloads are resumed aborts the run, and the run
//!   restarts every group it stopped before returning.
//! - Anything after resume is scoped to one volume and only shows up in the
//!   [`RunReport`]. A failed push keeps that volume's snapshot on disk.
//!
//! # Retrying a Label
//!
//! Before anything is stopped the run lists each volume's snapshots. A
//! volume that already holds a capture at the run's label (left by a failed
//! push) is not snapshotted again: its capture is pushed, pruned and
//! destroyed like a fresh one. Only the remaining volumes and their groups
//! go through stop, snapshot and resume. When every volume has a capture
//! the run never stops a workload.
//!
//! # Cancellation
//!
//! A [`CancelToken`] is checked before each group is stopped. Once the last
//! group is down, the run always goes through snapshot and resume first;
//! the request is then honoured by discarding the fresh snapshot (before
//! the per-volume phase) or by skipping volumes not yet started. Captures
//! from earlier runs are never discarded on cancellation.

use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Instant;
use strum::{Display, EnumString};
use tracing::{debug, error, info, info_span, warn};

use crate::backends::{BackupRepository, VolumeStore, WorkloadController};
use crate::error::{BackendError, RunError, VolumeError};
use crate::retention::RetentionPolicy;
use crate::run_state::{CancelToken, RunRecord, RunStage, VolumeStage};
use crate::types::{
    Archive, GroupName, HealthStatus, OrphanSnapshot, RepositoryInfo, RunOutcome, RunReport,
    Snapshot, SnapshotLabel, VerifyDepth, Volume, VolumeName, VolumeOutcome, VolumeStatus,
};

/// What to do with snapshots earlier runs left behind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OrphanPolicy {
    /// List them in the report and leave them alone
    #[default]
    Report,
    /// Push them before the current label, then destroy them
    Retry,
}

/// Which volumes an operation applies to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VolumeSelector {
    #[default]
    All,
    Named(Vec<VolumeName>),
}

/// Parameters of one backup run
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub selector: VolumeSelector,
    /// Generated from the snapshot prefix and the local time when absent
    pub label: Option<SnapshotLabel>,
    /// Overrides the configured worker count
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub snapshot_prefix: String,
    pub concurrency: usize,
    pub orphan_policy: OrphanPolicy,
    /// Cross-process lock; in-process exclusion always applies
    pub lock_file: Option<PathBuf>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            snapshot_prefix: "auto-backup".to_string(),
            concurrency: 2,
            orphan_policy: OrphanPolicy::Report,
            lock_file: None,
        }
    }
}

/// One catalog line: a volume and the retention of its repository
#[derive(Debug, Clone)]
pub struct VolumeEntry {
    pub volume: Volume,
    pub retention: RetentionPolicy,
}

/// Per-volume result of a maintenance operation
#[derive(Debug, Clone, Serialize)]
pub struct VolumeResult<T> {
    pub volume: VolumeName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> VolumeResult<T> {
    fn from_result(volume: VolumeName, result: Result<T, BackendError>) -> Self {
        match result {
            Ok(value) => Self {
                volume,
                value: Some(value),
                error: None,
            },
            Err(e) => Self {
                volume,
                value: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Serializes runs: a process-local mutex plus an optional `flock`ed file
/// for other volback processes on the host.
#[derive(Debug, Default)]
pub struct RunLock {
    inner: Mutex<()>,
    path: Option<PathBuf>,
}

/// Held for the duration of a run
pub struct RunLockGuard<'a> {
    _inner: MutexGuard<'a, ()>,
    _file: Option<nix::fcntl::Flock<File>>,
}

impl RunLock {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(()),
            path,
        }
    }

    /// Take the lock without waiting
    pub fn acquire(&self) -> Result<RunLockGuard<'_>, RunError> {
        let inner = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                return Err(RunError::RunInProgress(
                    "another run is active in this process".to_string(),
                ));
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let file = match &self.path {
            Some(path) => Some(lock_file(path)?),
            None => None,
        };

        Ok(RunLockGuard {
            _inner: inner,
            _file: file,
        })
    }
}

fn lock_file(path: &Path) -> Result<nix::fcntl::Flock<File>, RunError> {
    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| {
            RunError::configuration(format!("cannot open lock file {}: {}", path.display(), e))
        })?;

    let locked = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
        if errno == Errno::EWOULDBLOCK {
            RunError::RunInProgress(format!("lock file {} is held", path.display()))
        } else {
            RunError::configuration(format!("cannot lock {}: {}", path.display(), errno))
        }
    })?;

    // Holder's PID, for whoever finds the lock taken
    let mut handle: &File = &locked;
    if handle.set_len(0).is_ok() {
        let _ = writeln!(handle, "{}", std::process::id());
    }
    Ok(locked)
}

/// Snapshots the selected volumes hold before a run touches them
struct Survey {
    /// Everything under a label other than the run's own
    orphans: Vec<OrphanSnapshot>,
    /// Volumes already holding a capture at the run's label
    reused: BTreeSet<VolumeName>,
}

/// Why a run aborted, and which volumes still hold a capture at its label
struct Abort {
    reason: RunError,
    retained: BTreeSet<VolumeName>,
}

impl Abort {
    fn new(reason: RunError, retained: BTreeSet<VolumeName>) -> Self {
        Self { reason, retained }
    }
}

/// A selected volume together with its repository
struct Target<'a> {
    entry: &'a VolumeEntry,
    repository: Arc<dyn BackupRepository>,
}

impl Target<'_> {
    fn name(&self) -> &VolumeName {
        &self.entry.volume.name
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn advance(record: &mut RunRecord, stage: RunStage) {
    if let Err(e) = record.transition_to(stage) {
        error!(error = %e, "run state machine rejected transition");
    }
}

fn set_volume_stage(record: &Mutex<RunRecord>, volume: &VolumeName, stage: VolumeStage) {
    if let Err(e) = lock(record).transition_volume(volume, stage) {
        error!(error = %e, "volume state machine rejected transition");
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// A restore only writes into an absent or empty directory
fn check_restore_destination(dest: &Path) -> Result<(), BackendError> {
    match std::fs::read_dir(dest) {
        Ok(mut entries) => match entries.next() {
            None => Ok(()),
            Some(_) => Err(BackendError::unexpected(format!(
                "restore destination {} is not empty",
                dest.display()
            ))),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BackendError::unexpected(format!(
            "cannot read {}: {}",
            dest.display(),
            e
        ))),
    }
}

/// Drives backup runs and maintenance over a fixed catalog of volumes
pub struct BackupOrchestrator {
    store: Arc<dyn VolumeStore>,
    workloads: Arc<dyn WorkloadController>,
    repositories: BTreeMap<VolumeName, Arc<dyn BackupRepository>>,
    catalog: Vec<VolumeEntry>,
    options: OrchestratorOptions,
    lock: RunLock,
}

impl BackupOrchestrator {
    pub fn new(
        store: Arc<dyn VolumeStore>,
        workloads: Arc<dyn WorkloadController>,
        repositories: BTreeMap<VolumeName, Arc<dyn BackupRepository>>,
        catalog: impl IntoIterator<Item = VolumeEntry>,
        options: OrchestratorOptions,
    ) -> Self {
        let lock = RunLock::new(options.lock_file.clone());
        Self {
            store,
            workloads,
            repositories,
            catalog: catalog.into_iter().collect(),
            options,
            lock,
        }
    }

    pub fn catalog(&self) -> &[VolumeEntry] {
        &self.catalog
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Every volume declared once, with its own repository
    fn check_catalog(&self) -> Result<(), RunError> {
        let mut names = BTreeSet::new();
        let mut locations: BTreeMap<String, &VolumeName> = BTreeMap::new();

        for entry in &self.catalog {
            let name = &entry.volume.name;
            if !names.insert(name) {
                return Err(RunError::configuration(format!(
                    "volume '{}' is declared more than once",
                    name
                )));
            }

            let repository = self.repositories.get(name).ok_or_else(|| {
                RunError::configuration(format!("volume '{}' has no repository", name))
            })?;
            if let Some(other) = locations.insert(repository.location(), name) {
                return Err(RunError::configuration(format!(
                    "volumes '{}' and '{}' share repository {}",
                    other,
                    name,
                    repository.location()
                )));
            }
        }

        if let Some(stray) = self.repositories.keys().find(|name| !names.contains(name)) {
            return Err(RunError::configuration(format!(
                "repository configured for unknown volume '{}'",
                stray
            )));
        }
        Ok(())
    }

    fn select(&self, selector: &VolumeSelector) -> Result<Vec<Target<'_>>, RunError> {
        self.check_catalog()?;

        let entries: Vec<&VolumeEntry> = match selector {
            VolumeSelector::All => self.catalog.iter().collect(),
            VolumeSelector::Named(names) => {
                let mut seen = BTreeSet::new();
                let mut entries = Vec::with_capacity(names.len());
                for name in names {
                    if !seen.insert(name) {
                        return Err(RunError::configuration(format!(
                            "volume '{}' selected twice",
                            name
                        )));
                    }
                    let entry = self
                        .catalog
                        .iter()
                        .find(|e| &e.volume.name == name)
                        .ok_or_else(|| {
                            RunError::configuration(format!("unknown volume '{}'", name))
                        })?;
                    entries.push(entry);
                }
                entries
            }
        };

        if entries.is_empty() {
            return Err(RunError::configuration("no volumes selected"));
        }

        let mut targets: Vec<Target<'_>> = entries
            .into_iter()
            .filter_map(|entry| {
                self.repositories
                    .get(&entry.volume.name)
                    .map(|repository| Target {
                        entry,
                        repository: Arc::clone(repository),
                    })
            })
            .collect();
        targets.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(targets)
    }

    /// Run one backup.
    ///
    /// # Errors
    ///
    /// Only pre-flight failures, before any workload is touched:
    /// `ConfigurationError`, `RunInProgress` and `Cancelled`. Every other
    /// failure is described by the returned report.
    pub fn run(&self, request: &RunRequest, cancel: &CancelToken) -> Result<RunReport, RunError> {
        let targets = self.select(&request.selector)?;

        let concurrency = request.concurrency.unwrap_or(self.options.concurrency);
        if concurrency == 0 {
            return Err(RunError::configuration("concurrency must be at least 1"));
        }

        let label = match &request.label {
            Some(label) => label.clone(),
            None => SnapshotLabel::generate(&self.options.snapshot_prefix, Local::now())
                .map_err(|e| RunError::configuration(e.to_string()))?,
        };

        let _guard = self.lock.acquire()?;
        if cancel.is_cancelled() {
            info!("run cancelled before any workload was stopped");
            return Err(RunError::Cancelled);
        }

        let started_at = Utc::now();
        info!(label = %label, volumes = targets.len(), concurrency, "backup run started");

        let Survey { orphans, reused } = self.survey(&targets, Some(&label));
        if !reused.is_empty() {
            let names: Vec<&str> = reused.iter().map(VolumeName::as_str).collect();
            info!(label = %label, volumes = ?names, "reusing captures left at this label by an earlier run");
        }
        let mut record = RunRecord::new(label, targets.iter().map(|t| t.name().clone()));

        if let Err(abort) = self.capture(&mut record, &targets, &reused, cancel) {
            return Ok(self.aborted_report(record, abort, orphans, started_at));
        }

        let (mut record, mut outcomes) =
            self.back_up_all(record, &targets, &orphans, &reused, concurrency, cancel);
        outcomes.sort_by(|a, b| a.volume.cmp(&b.volume));

        let failed: Vec<VolumeName> = outcomes
            .iter()
            .filter(|o| o.status != VolumeStatus::Succeeded)
            .map(|o| o.volume.clone())
            .collect();

        let outcome = if failed.is_empty() {
            advance(&mut record, RunStage::Done);
            info!(label = %record.label(), volumes = outcomes.len(), "backup run done");
            RunOutcome::Done
        } else {
            advance(&mut record, RunStage::PartialFailure);
            let names: Vec<&str> = failed.iter().map(VolumeName::as_str).collect();
            warn!(label = %record.label(), failed = ?names, "backup run finished with failures");
            RunOutcome::PartialFailure { failed }
        };

        Ok(RunReport {
            label: record.label().clone(),
            outcome,
            volumes: outcomes,
            downtime_ms: record.downtime().map(|d| d.as_millis() as u64),
            resume_warning: record.resume_warning().map(str::to_string),
            orphans,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Stop, snapshot, resume for the volumes without a capture at the
    /// run's label. `Err` means the run must abort; workloads have been
    /// restarted by then.
    fn capture(
        &self,
        record: &mut RunRecord,
        targets: &[Target<'_>],
        reused: &BTreeSet<VolumeName>,
        cancel: &CancelToken,
    ) -> Result<(), Abort> {
        let label = record.label().clone();
        let fresh: Vec<&Target<'_>> = targets
            .iter()
            .filter(|t| !reused.contains(t.name()))
            .collect();
        if fresh.is_empty() {
            info!(label = %label, "every volume already has a capture, no workload is stopped");
            record.set_snapshot_taken(true);
            return Ok(());
        }

        let groups: BTreeSet<GroupName> = fresh
            .iter()
            .map(|t| t.entry.volume.workload.clone())
            .collect();
        let volumes: Vec<VolumeName> = fresh.iter().map(|t| t.name().clone()).collect();

        advance(record, RunStage::Stopping);
        record.begin_downtime();

        for group in &groups {
            if cancel.is_cancelled() {
                warn!(group = %group, "cancellation requested while stopping workloads");
                self.restart_after_abort(record, None);
                return Err(Abort::new(RunError::Cancelled, reused.clone()));
            }

            info!(group = %group, "stopping workload group");
            if let Err(source) = self.workloads.stop(&BTreeSet::from([group.clone()])) {
                error!(group = %group, error = %source, "failed to stop workload group");
                self.restart_after_abort(record, Some(group));
                let reason = RunError::WorkloadStopFailed {
                    group: group.to_string(),
                    source,
                };
                return Err(Abort::new(reason, reused.clone()));
            }
            record.mark_stopped(group.clone());
        }

        advance(record, RunStage::Snapshotting);
        let snapshot_started = Instant::now();
        match self.store.snapshot(&volumes, &label) {
            Ok(group) => {
                record.set_snapshot_taken(true);
                info!(
                    label = %label,
                    volumes = group.volumes.len(),
                    elapsed_ms = elapsed_ms(snapshot_started),
                    "snapshot taken"
                );
            }
            Err(BackendError::Conflict {
                label: taken,
                volumes: clashing,
            }) => {
                // Only reachable when the survey could not list a volume
                error!(label = %taken, volumes = ?clashing, "snapshot label already in use");
                self.restart_after_abort(record, None);
                let mut retained = reused.clone();
                retained.extend(
                    volumes
                        .iter()
                        .filter(|v| clashing.iter().any(|c| c == v.as_str()))
                        .cloned(),
                );
                let reason = RunError::SnapshotConflict {
                    label: taken,
                    volumes: clashing,
                };
                return Err(Abort::new(reason, retained));
            }
            Err(source) => {
                error!(label = %label, error = %source, "snapshot failed");
                let mut retained = reused.clone();
                retained.extend(self.discard_snapshots(&label, &volumes));
                self.restart_after_abort(record, None);
                let reason = RunError::SnapshotFailed {
                    label: label.to_string(),
                    source,
                };
                return Err(Abort::new(reason, retained));
            }
        }

        advance(record, RunStage::Resuming);
        self.resume(record);

        if cancel.is_cancelled() {
            warn!(label = %label, "cancellation honoured after resume, discarding snapshot");
            advance(record, RunStage::Aborting);
            let mut retained = reused.clone();
            retained.extend(self.discard_snapshots(&label, &volumes));
            record.set_snapshot_taken(!retained.is_empty());
            return Err(Abort::new(RunError::Cancelled, retained));
        }
        Ok(())
    }

    /// Start every group this run stopped. Never fails the run.
    fn resume(&self, record: &mut RunRecord) {
        let groups = record.stopped_groups().clone();
        match self.workloads.start(&groups) {
            Ok(()) => info!(groups = groups.len(), "workload groups resumed"),
            Err(e) => {
                error!(
                    label = %record.label(),
                    error = %e,
                    "WORKLOADS DID NOT RESUME; snapshot is intact, continuing with backup"
                );
                record.set_resume_warning(e.to_string());
            }
        }
        record.clear_stopped();
        record.end_downtime();
    }

    /// Move to Aborting and restart stopped groups, plus the one that failed
    /// to stop (it may be half down)
    fn restart_after_abort(&self, record: &mut RunRecord, failing: Option<&GroupName>) {
        advance(record, RunStage::Aborting);

        let mut groups = record.stopped_groups().clone();
        if let Some(group) = failing {
            groups.insert(group.clone());
        }

        if !groups.is_empty() {
            info!(groups = groups.len(), "restarting workload groups after abort");
            if let Err(e) = self.workloads.start(&groups) {
                error!(error = %e, "failed to restart workload groups after abort");
                record.set_resume_warning(e.to_string());
            }
        }
        record.clear_stopped();
        record.end_downtime();
    }

    /// Destroy `label` on each volume; returns the volumes where that failed
    fn discard_snapshots(&self, label: &SnapshotLabel, volumes: &[VolumeName]) -> Vec<VolumeName> {
        let mut failed = Vec::new();
        for volume in volumes {
            if let Err(e) = self.store.destroy(label, volume) {
                error!(volume = %volume, label = %label, error = %e, "failed to destroy snapshot");
                failed.push(volume.clone());
            }
        }
        failed
    }

    fn aborted_report(
        &self,
        mut record: RunRecord,
        abort: Abort,
        orphans: Vec<OrphanSnapshot>,
        started_at: chrono::DateTime<Utc>,
    ) -> RunReport {
        let Abort { reason, retained } = abort;
        advance(&mut record, RunStage::Aborted);
        error!(label = %record.label(), kind = reason.kind(), error = %reason, "backup run aborted");

        let names: Vec<VolumeName> = record.volumes().map(|(name, _)| name.clone()).collect();
        let mut volumes = Vec::with_capacity(names.len());
        for name in names {
            if let Err(e) = record.transition_volume(&name, VolumeStage::Skipped) {
                debug!(error = %e, "volume already settled");
            }
            let kept = retained.contains(&name);
            if kept {
                warn!(volume = %name, label = %record.label(), "capture kept on disk");
            }
            volumes.push(VolumeOutcome::skipped(name, kept));
        }

        RunReport {
            label: record.label().clone(),
            outcome: RunOutcome::Aborted {
                kind: reason.kind().to_string(),
                reason: reason.to_string(),
            },
            volumes,
            downtime_ms: record.downtime().map(|d| d.as_millis() as u64),
            resume_warning: record.resume_warning().map(str::to_string),
            orphans,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Per-volume phase on up to `concurrency` workers
    fn back_up_all(
        &self,
        mut record: RunRecord,
        targets: &[Target<'_>],
        orphans: &[OrphanSnapshot],
        reused: &BTreeSet<VolumeName>,
        concurrency: usize,
        cancel: &CancelToken,
    ) -> (RunRecord, Vec<VolumeOutcome>) {
        advance(&mut record, RunStage::BackingUp);
        let label = record.label().clone();

        let queue: Mutex<VecDeque<&Target<'_>>> = Mutex::new(targets.iter().collect());
        let outcomes = Mutex::new(Vec::with_capacity(targets.len()));
        let record = Mutex::new(record);
        let workers = concurrency.min(targets.len()).max(1);

        std::thread::scope(|scope| {
            let (queue, outcomes, record, label) = (&queue, &outcomes, &record, &label);
            for _ in 0..workers {
                scope.spawn(move || {
                    loop {
                        let next = lock(queue).pop_front();
                        let Some(target) = next else { break };

                        let earlier = reused.contains(target.name());
                        let outcome = if cancel.is_cancelled() {
                            self.skip_volume(target, label, earlier, record)
                        } else {
                            let leftovers: Vec<&SnapshotLabel> = orphans
                                .iter()
                                .filter(|o| o.managed && &o.volume == target.name())
                                .map(|o| &o.label)
                                .collect();
                            self.back_up_volume(target, label, earlier, &leftovers, record)
                        };
                        lock(outcomes).push(outcome);
                    }
                });
            }
        });

        (
            record.into_inner().unwrap_or_else(PoisonError::into_inner),
            outcomes.into_inner().unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Cancelled before this volume started: drop its snapshot unless an
    /// earlier run left it
    fn skip_volume(
        &self,
        target: &Target<'_>,
        label: &SnapshotLabel,
        reused: bool,
        record: &Mutex<RunRecord>,
    ) -> VolumeOutcome {
        let name = target.name();
        set_volume_stage(record, name, VolumeStage::Skipped);

        if reused {
            warn!(volume = %name, "volume skipped after cancellation, earlier capture kept");
            return VolumeOutcome::skipped(name.clone(), true);
        }
        let retained = match self.store.destroy(label, name) {
            Ok(()) => false,
            Err(e) => {
                error!(volume = %name, error = %e, "failed to destroy snapshot of skipped volume");
                true
            }
        };
        warn!(volume = %name, "volume skipped after cancellation");
        VolumeOutcome::skipped(name.clone(), retained)
    }

    /// push → prune → destroy for one volume
    fn back_up_volume(
        &self,
        target: &Target<'_>,
        label: &SnapshotLabel,
        reused: bool,
        orphans: &[&SnapshotLabel],
        record: &Mutex<RunRecord>,
    ) -> VolumeOutcome {
        let name = target.name();
        let span = info_span!("volume", volume = %name);
        let _entered = span.enter();

        let started = Instant::now();
        let mut outcome = VolumeOutcome::skipped(name.clone(), true);
        outcome.reused_snapshot = reused;
        set_volume_stage(record, name, VolumeStage::BackingUp);
        if reused {
            info!(label = %label, "pushing the capture an earlier run left at this label");
        }

        if self.options.orphan_policy == OrphanPolicy::Retry {
            for orphan in orphans {
                match self.recover_orphan(target, orphan) {
                    Ok(()) => outcome.orphans_recovered.push(orphan.to_string()),
                    Err(e) => {
                        warn!(orphan = %orphan, error = %e, "orphaned snapshot not recovered");
                        outcome
                            .warnings
                            .push(format!("orphan '{}' not recovered: {}", orphan, e));
                    }
                }
            }
        }

        let pushed = self
            .store
            .resolve(label, name)
            .and_then(|snapshot| target.repository.push(&snapshot));
        let push = match pushed {
            Ok(push) => push,
            Err(source) => {
                let err = VolumeError::BackupFailed {
                    volume: name.to_string(),
                    source,
                };
                error!(error = %err, "push failed, snapshot kept for retry");
                set_volume_stage(record, name, VolumeStage::BackupFailed);
                outcome.status = VolumeStatus::BackupFailed;
                outcome.error = Some(err.to_string());
                outcome.duration_ms = elapsed_ms(started);
                return outcome;
            }
        };
        outcome.archive = Some(push.archive);
        outcome.archive_created = push.created;

        set_volume_stage(record, name, VolumeStage::Pruning);
        let pruned = target
            .repository
            .prune(&target.entry.retention, Local::now().naive_local());

        // The archive is durable at this point, prune result or not
        set_volume_stage(record, name, VolumeStage::CleaningSnapshot);
        match self.store.destroy(label, name) {
            Ok(()) => outcome.snapshot_retained = false,
            Err(source) => {
                let err = VolumeError::CleanupFailed {
                    volume: name.to_string(),
                    source,
                };
                warn!(error = %err, "snapshot cleanup failed");
                outcome.warnings.push(err.to_string());
            }
        }

        match pruned {
            Ok(removed) => {
                outcome.pruned = removed;
                outcome.status = VolumeStatus::Succeeded;
                set_volume_stage(record, name, VolumeStage::Succeeded);
                info!(
                    archive = outcome.archive.as_deref().unwrap_or_default(),
                    pruned = outcome.pruned.len(),
                    "volume backed up"
                );
            }
            Err(source) => {
                let err = VolumeError::PruneFailed {
                    volume: name.to_string(),
                    source,
                };
                error!(error = %err, "prune failed, archive is kept");
                outcome.status = VolumeStatus::PruneFailed;
                outcome.error = Some(err.to_string());
                set_volume_stage(record, name, VolumeStage::PruneFailed);
            }
        }

        outcome.duration_ms = elapsed_ms(started);
        outcome
    }

    /// Push a leftover snapshot and destroy it once durable
    fn recover_orphan(
        &self,
        target: &Target<'_>,
        orphan: &SnapshotLabel,
    ) -> Result<(), BackendError> {
        let snapshot = self.store.resolve(orphan, target.name())?;
        let pushed = target.repository.push(&snapshot)?;
        info!(orphan = %orphan, archive = %pushed.archive, created = pushed.created, "orphaned snapshot archived");
        self.store.destroy(orphan, target.name())
    }

    /// Every snapshot on the selected volumes other than `current`, plus the
    /// volumes that already hold `current`. Only labels carrying the
    /// configured prefix are `managed`.
    fn survey(&self, targets: &[Target<'_>], current: Option<&SnapshotLabel>) -> Survey {
        let mut orphans = Vec::new();
        let mut reused = BTreeSet::new();
        for target in targets {
            let snapshots = match self.store.list(target.name()) {
                Ok(snapshots) => snapshots,
                Err(e) => {
                    warn!(volume = %target.name(), error = %e, "could not list snapshots");
                    continue;
                }
            };

            for snapshot in snapshots {
                let Ok(label) = SnapshotLabel::new(snapshot.label) else {
                    continue;
                };
                if Some(&label) == current {
                    reused.insert(target.name().clone());
                    continue;
                }
                let managed = label.has_prefix(&self.options.snapshot_prefix);
                orphans.push(OrphanSnapshot {
                    volume: target.name().clone(),
                    label,
                    managed,
                });
            }
        }

        if !orphans.is_empty() {
            let managed = orphans.iter().filter(|o| o.managed).count();
            warn!(
                count = orphans.len(),
                managed,
                policy = %self.options.orphan_policy,
                "snapshots from earlier runs found"
            );
        }
        Survey { orphans, reused }
    }

    fn for_each<T>(
        &self,
        targets: &[Target<'_>],
        op: impl Fn(&Target<'_>) -> Result<T, BackendError>,
    ) -> Vec<VolumeResult<T>> {
        targets
            .iter()
            .map(|target| {
                let span = info_span!("volume", volume = %target.name());
                let _entered = span.enter();
                let result = op(target);
                if let Err(e) = &result {
                    error!(error = %e, "operation failed");
                }
                VolumeResult::from_result(target.name().clone(), result)
            })
            .collect()
    }

    /// Check repository integrity. Damage is a `Healthy`/`Damaged` value,
    /// not an error.
    pub fn verify(
        &self,
        selector: &VolumeSelector,
        depth: VerifyDepth,
    ) -> Result<Vec<VolumeResult<HealthStatus>>, RunError> {
        let targets = self.select(selector)?;
        Ok(self.for_each(&targets, |t| t.repository.verify(depth)))
    }

    /// Apply each volume's retention policy outside a backup run
    pub fn prune(
        &self,
        selector: &VolumeSelector,
    ) -> Result<Vec<VolumeResult<Vec<String>>>, RunError> {
        let targets = self.select(selector)?;
        let _guard = self.lock.acquire()?;
        let now = Local::now().naive_local();
        Ok(self.for_each(&targets, |t| t.repository.prune(&t.entry.retention, now)))
    }

    /// Create missing repositories; `true` for each one created
    pub fn init_repositories(
        &self,
        selector: &VolumeSelector,
    ) -> Result<Vec<VolumeResult<bool>>, RunError> {
        let targets = self.select(selector)?;
        Ok(self.for_each(&targets, |t| t.repository.ensure_initialized()))
    }

    /// Export each repository key to `<dir>/<volume>.key`
    pub fn export_keys(
        &self,
        selector: &VolumeSelector,
        dir: &Path,
    ) -> Result<Vec<VolumeResult<PathBuf>>, RunError> {
        let targets = self.select(selector)?;
        Ok(self.for_each(&targets, |t| {
            let path = dir.join(format!("{}.key", t.name()));
            t.repository.export_key(&path).map(|()| path)
        }))
    }

    /// Snapshots left behind by earlier runs
    pub fn find_orphans(&self, selector: &VolumeSelector) -> Result<Vec<OrphanSnapshot>, RunError> {
        let targets = self.select(selector)?;
        Ok(self.survey(&targets, None).orphans)
    }

    pub fn snapshots(
        &self,
        selector: &VolumeSelector,
    ) -> Result<Vec<VolumeResult<Vec<Snapshot>>>, RunError> {
        let targets = self.select(selector)?;
        Ok(self.for_each(&targets, |t| self.store.list(t.name())))
    }

    /// Destroy one label on the selected volumes
    pub fn destroy_snapshot(
        &self,
        selector: &VolumeSelector,
        label: &SnapshotLabel,
    ) -> Result<Vec<VolumeResult<String>>, RunError> {
        let targets = self.select(selector)?;
        let _guard = self.lock.acquire()?;
        Ok(self.for_each(&targets, |t| {
            self.store.destroy(label, t.name()).map(|()| label.to_string())
        }))
    }

    pub fn archives(
        &self,
        selector: &VolumeSelector,
    ) -> Result<Vec<VolumeResult<Vec<Archive>>>, RunError> {
        let targets = self.select(selector)?;
        Ok(self.for_each(&targets, |t| t.repository.list()))
    }

    /// Restore one archive of `volume` into `dest`
    pub fn extract_archive(
        &self,
        volume: &VolumeName,
        archive: &str,
        dest: &Path,
    ) -> Result<Vec<VolumeResult<PathBuf>>, RunError> {
        let targets = self.select(&VolumeSelector::Named(vec![volume.clone()]))?;
        Ok(self.for_each(&targets, |t| {
            check_restore_destination(dest)?;
            t.repository.extract(archive, dest)?;
            Ok(dest.to_path_buf())
        }))
    }

    /// Delete one archive of `volume`. Holds the run lock.
    pub fn delete_archive(
        &self,
        volume: &VolumeName,
        archive: &str,
    ) -> Result<Vec<VolumeResult<String>>, RunError> {
        let targets = self.select(&VolumeSelector::Named(vec![volume.clone()]))?;
        let _guard = self.lock.acquire()?;
        Ok(self.for_each(&targets, |t| {
            t.repository.delete(archive).map(|()| archive.to_string())
        }))
    }

    pub fn repository_info(
        &self,
        selector: &VolumeSelector,
    ) -> Result<Vec<VolumeResult<RepositoryInfo>>, RunError> {
        let targets = self.select(selector)?;
        Ok(self.for_each(&targets, |t| t.repository.info()))
    }
}
