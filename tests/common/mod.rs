// Shared fixtures for the orchestrator integration tests.
//
// In-memory stand-ins for ZFS, Docker Compose and Borg. They all share one
// `Host` so tests can assert on the order of events and on which workload
// groups were running when something happened.

#![allow(dead_code)]

use chrono::{Local, NaiveDateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use volback::backends::{BackupRepository, VolumeStore, WorkloadController};
use volback::error::BackendError;
use volback::orchestrator::{BackupOrchestrator, OrchestratorOptions, VolumeEntry};
use volback::retention::RetentionPolicy;
use volback::run_state::CancelToken;
use volback::types::{
    Archive, GroupName, HealthStatus, PushOutcome, RepositoryInfo, Snapshot, SnapshotGroup,
    SnapshotLabel, SnapshotRef, VerifyDepth, Volume, VolumeName,
};

pub fn volume(name: &str) -> VolumeName {
    VolumeName::new(name).unwrap()
}

pub fn group(name: &str) -> GroupName {
    GroupName::new(name).unwrap()
}

pub fn label(value: &str) -> SnapshotLabel {
    SnapshotLabel::new(value).unwrap()
}

/// State shared by every fake
#[derive(Default)]
pub struct Host {
    events: Mutex<Vec<String>>,
    running: Mutex<BTreeSet<GroupName>>,
    active_pushes: AtomicUsize,
    max_active_pushes: AtomicUsize,
}

impl Host {
    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Index of the first event starting with `prefix`
    pub fn first(&self, prefix: &str) -> Option<usize> {
        self.events().iter().position(|e| e.starts_with(prefix))
    }

    /// Index of the last event starting with `prefix`
    pub fn last(&self, prefix: &str) -> Option<usize> {
        self.events().iter().rposition(|e| e.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn running(&self) -> BTreeSet<GroupName> {
        self.running.lock().unwrap().clone()
    }

    pub fn max_active_pushes(&self) -> usize {
        self.max_active_pushes.load(Ordering::SeqCst)
    }
}

// -----------------------------------------------------------------------------
// Workloads
// -----------------------------------------------------------------------------

pub struct FakeWorkloads {
    host: Arc<Host>,
    pub fail_stop: Mutex<Option<GroupName>>,
    pub fail_start: AtomicBool,
    /// Cancelled right after the n-th successful stop call (1-based)
    pub cancel_after_stops: Mutex<Option<(usize, CancelToken)>>,
    stops: AtomicUsize,
}

impl FakeWorkloads {
    fn new(host: Arc<Host>) -> Self {
        Self {
            host,
            fail_stop: Mutex::new(None),
            fail_start: AtomicBool::new(false),
            cancel_after_stops: Mutex::new(None),
            stops: AtomicUsize::new(0),
        }
    }
}

fn join(groups: &BTreeSet<GroupName>) -> String {
    groups
        .iter()
        .map(GroupName::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

impl WorkloadController for FakeWorkloads {
    fn stop(&self, groups: &BTreeSet<GroupName>) -> Result<(), BackendError> {
        if let Some(failing) = self.fail_stop.lock().unwrap().as_ref() {
            if groups.contains(failing) {
                self.host.record(format!("stop-failed:{}", failing));
                // Half down: the group is no longer serving
                self.host.running.lock().unwrap().remove(failing);
                return Err(BackendError::unexpected(format!("{} did not stop", failing)));
            }
        }

        for group in groups {
            self.host.running.lock().unwrap().remove(group);
        }
        self.host.record(format!("stop:{}", join(groups)));

        let stops = self.stops.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = self.cancel_after_stops.lock().unwrap().as_ref() {
            if stops == *after {
                token.cancel();
            }
        }
        Ok(())
    }

    fn start(&self, groups: &BTreeSet<GroupName>) -> Result<(), BackendError> {
        if self.fail_start.load(Ordering::SeqCst) {
            self.host.record(format!("start-failed:{}", join(groups)));
            return Err(BackendError::unexpected("compose up timed out"));
        }
        self.host.running.lock().unwrap().extend(groups.iter().cloned());
        self.host.record(format!("start:{}", join(groups)));
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Snapshots
// -----------------------------------------------------------------------------

pub struct FakeStore {
    host: Arc<Host>,
    snapshots: Mutex<BTreeMap<VolumeName, BTreeSet<String>>>,
    /// Fail the snapshot after creating this many captures
    pub fail_snapshot_after: Mutex<Option<usize>>,
    pub fail_destroy: Mutex<BTreeSet<VolumeName>>,
    /// Listing fails, so labels in use are only discovered at snapshot time
    pub fail_list: AtomicBool,
    /// Running groups observed at each snapshot call
    pub running_at_snapshot: Mutex<Vec<BTreeSet<GroupName>>>,
}

impl FakeStore {
    fn new(host: Arc<Host>, volumes: &[VolumeName]) -> Self {
        Self {
            host,
            snapshots: Mutex::new(
                volumes
                    .iter()
                    .map(|v| (v.clone(), BTreeSet::new()))
                    .collect(),
            ),
            fail_snapshot_after: Mutex::new(None),
            fail_destroy: Mutex::new(BTreeSet::new()),
            fail_list: AtomicBool::new(false),
            running_at_snapshot: Mutex::new(Vec::new()),
        }
    }

    /// Leave a capture behind, as an earlier run would
    pub fn plant(&self, volume: &VolumeName, label: &str) {
        self.snapshots
            .lock()
            .unwrap()
            .entry(volume.clone())
            .or_default()
            .insert(label.to_string());
    }

    pub fn has(&self, volume: &VolumeName, label: &str) -> bool {
        self.snapshots
            .lock()
            .unwrap()
            .get(volume)
            .is_some_and(|labels| labels.contains(label))
    }

    pub fn labels(&self, volume: &VolumeName) -> Vec<String> {
        self.snapshots
            .lock()
            .unwrap()
            .get(volume)
            .map(|labels| labels.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.snapshots.lock().unwrap().values().map(BTreeSet::len).sum()
    }
}

impl VolumeStore for FakeStore {
    fn snapshot(
        &self,
        volumes: &[VolumeName],
        label: &SnapshotLabel,
    ) -> Result<SnapshotGroup, BackendError> {
        self.running_at_snapshot
            .lock()
            .unwrap()
            .push(self.host.running());

        let mut snapshots = self.snapshots.lock().unwrap();
        let clashing: Vec<String> = volumes
            .iter()
            .filter(|v| snapshots.get(*v).is_some_and(|l| l.contains(label.as_str())))
            .map(|v| v.to_string())
            .collect();
        if !clashing.is_empty() {
            self.host.record(format!("snapshot-conflict:{}", label));
            return Err(BackendError::Conflict {
                label: label.to_string(),
                volumes: clashing,
            });
        }

        let fail_after = *self.fail_snapshot_after.lock().unwrap();
        for (created, volume) in volumes.iter().enumerate() {
            if fail_after == Some(created) {
                self.host.record(format!("snapshot-failed:{}", label));
                return Err(BackendError::unexpected("out of space"));
            }
            snapshots
                .entry(volume.clone())
                .or_default()
                .insert(label.to_string());
        }

        self.host.record(format!("snapshot:{}", label));
        Ok(SnapshotGroup {
            label: label.clone(),
            volumes: volumes.to_vec(),
            created: Utc::now(),
        })
    }

    fn destroy(&self, label: &SnapshotLabel, volume: &VolumeName) -> Result<(), BackendError> {
        if self.fail_destroy.lock().unwrap().contains(volume) {
            self.host.record(format!("destroy-failed:{}:{}", volume, label));
            return Err(BackendError::unexpected("dataset is busy"));
        }
        if let Some(labels) = self.snapshots.lock().unwrap().get_mut(volume) {
            labels.remove(label.as_str());
        }
        self.host.record(format!("destroy:{}:{}", volume, label));
        Ok(())
    }

    fn list(&self, volume: &VolumeName) -> Result<Vec<Snapshot>, BackendError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(BackendError::unexpected("zfs list timed out"));
        }
        Ok(self
            .labels(volume)
            .into_iter()
            .map(|label| Snapshot {
                label,
                volume: volume.clone(),
                created: None,
            })
            .collect())
    }

    fn resolve(
        &self,
        label: &SnapshotLabel,
        volume: &VolumeName,
    ) -> Result<SnapshotRef, BackendError> {
        if !self.has(volume, label.as_str()) {
            return Err(BackendError::NotFound(format!("{}@{}", volume, label)));
        }
        Ok(SnapshotRef {
            label: label.clone(),
            volume: volume.clone(),
            path: PathBuf::from(format!("/srv/{}/.zfs/snapshot/{}", volume, label)),
        })
    }
}

// -----------------------------------------------------------------------------
// Repositories
// -----------------------------------------------------------------------------

pub struct FakeRepo {
    host: Arc<Host>,
    location: String,
    archives: Mutex<Vec<Archive>>,
    pub fail_push: AtomicBool,
    pub fail_list: AtomicBool,
    pub damaged: AtomicBool,
    pub push_delay: Mutex<Option<Duration>>,
    pub cancel_on_push: Mutex<Option<CancelToken>>,
    /// Running groups observed at each push
    pub running_at_push: Mutex<Vec<BTreeSet<GroupName>>>,
}

impl FakeRepo {
    fn new(host: Arc<Host>, location: impl Into<String>) -> Self {
        Self {
            host,
            location: location.into(),
            archives: Mutex::new(Vec::new()),
            fail_push: AtomicBool::new(false),
            fail_list: AtomicBool::new(false),
            damaged: AtomicBool::new(false),
            push_delay: Mutex::new(None),
            cancel_on_push: Mutex::new(None),
            running_at_push: Mutex::new(Vec::new()),
        }
    }

    pub fn add_archive(&self, name: &str, time: NaiveDateTime) {
        self.archives.lock().unwrap().push(Archive {
            name: name.to_string(),
            time,
            id: None,
        });
    }

    pub fn archive_names(&self) -> Vec<String> {
        self.archives
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.name.clone())
            .collect()
    }
}

impl BackupRepository for FakeRepo {
    fn location(&self) -> String {
        self.location.clone()
    }

    fn ensure_initialized(&self) -> Result<bool, BackendError> {
        Ok(false)
    }

    fn push(&self, snapshot: &SnapshotRef) -> Result<PushOutcome, BackendError> {
        self.running_at_push.lock().unwrap().push(self.host.running());
        if let Some(token) = self.cancel_on_push.lock().unwrap().as_ref() {
            token.cancel();
        }

        let active = self.host.active_pushes.fetch_add(1, Ordering::SeqCst) + 1;
        self.host
            .max_active_pushes
            .fetch_max(active, Ordering::SeqCst);
        if let Some(delay) = *self.push_delay.lock().unwrap() {
            std::thread::sleep(delay);
        }
        self.host.active_pushes.fetch_sub(1, Ordering::SeqCst);

        if self.fail_push.load(Ordering::SeqCst) {
            self.host.record(format!("push-failed:{}", snapshot.volume));
            return Err(BackendError::unexpected("connection reset by peer"));
        }

        let name = snapshot.label.to_string();
        let mut archives = self.archives.lock().unwrap();
        let created = !archives.iter().any(|a| a.name == name);
        if created {
            archives.push(Archive {
                name: name.clone(),
                time: Local::now().naive_local(),
                id: None,
            });
        }
        self.host
            .record(format!("push:{}:{}", snapshot.volume, snapshot.label));
        Ok(PushOutcome {
            archive: name,
            created,
        })
    }

    fn list(&self) -> Result<Vec<Archive>, BackendError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(BackendError::unexpected("repository lock timeout"));
        }
        Ok(self.archives.lock().unwrap().clone())
    }

    fn delete(&self, archive: &str) -> Result<(), BackendError> {
        self.archives.lock().unwrap().retain(|a| a.name != archive);
        self.host.record(format!("delete:{}:{}", self.location, archive));
        Ok(())
    }

    fn verify(&self, _depth: VerifyDepth) -> Result<HealthStatus, BackendError> {
        if self.damaged.load(Ordering::SeqCst) {
            return Ok(HealthStatus::Damaged {
                detail: "segment 12 checksum mismatch".to_string(),
            });
        }
        Ok(HealthStatus::Healthy)
    }

    fn export_key(&self, path: &Path) -> Result<(), BackendError> {
        std::fs::write(path, format!("key for {}", self.location))
            .map_err(|e| BackendError::unexpected(e.to_string()))
    }

    fn extract(&self, archive: &str, dest: &Path) -> Result<(), BackendError> {
        if !self.archive_names().iter().any(|name| name == archive) {
            return Err(BackendError::NotFound(format!("{}::{}", self.location, archive)));
        }
        std::fs::create_dir_all(dest)
            .and_then(|()| std::fs::write(dest.join("RESTORED_FROM"), archive))
            .map_err(|e| BackendError::unexpected(e.to_string()))?;
        self.host.record(format!("extract:{}:{}", self.location, archive));
        Ok(())
    }

    fn info(&self) -> Result<RepositoryInfo, BackendError> {
        Ok(RepositoryInfo {
            location: self.location.clone(),
            archives: self.list()?.len(),
            ..RepositoryInfo::default()
        })
    }
}

// -----------------------------------------------------------------------------
// Fixture
// -----------------------------------------------------------------------------

/// A catalog of `(volume, workload group)` pairs wired to fakes
pub struct Fixture {
    pub host: Arc<Host>,
    pub store: Arc<FakeStore>,
    pub workloads: Arc<FakeWorkloads>,
    pub repos: BTreeMap<VolumeName, Arc<FakeRepo>>,
    pub catalog: Vec<VolumeEntry>,
    pub options: OrchestratorOptions,
}

impl Fixture {
    pub fn new(layout: &[(&str, &str)]) -> Self {
        let host = Arc::new(Host::default());
        let names: Vec<VolumeName> = layout.iter().map(|(v, _)| volume(v)).collect();

        let catalog: Vec<VolumeEntry> = layout
            .iter()
            .map(|(v, g)| VolumeEntry {
                volume: Volume {
                    name: volume(v),
                    dataset: format!("datapool/services/{}", v),
                    mountpoint: PathBuf::from(format!("/srv/{}", v)),
                    workload: group(g),
                },
                retention: RetentionPolicy::default(),
            })
            .collect();

        let repos = names
            .iter()
            .map(|v| {
                let repo = FakeRepo::new(Arc::clone(&host), format!("backup:/repos/{}", v));
                (v.clone(), Arc::new(repo))
            })
            .collect();

        host.running
            .lock()
            .unwrap()
            .extend(layout.iter().map(|(_, g)| group(g)));

        Self {
            store: Arc::new(FakeStore::new(Arc::clone(&host), &names)),
            workloads: Arc::new(FakeWorkloads::new(Arc::clone(&host))),
            host,
            repos,
            catalog,
            options: OrchestratorOptions::default(),
        }
    }

    /// The database and media server layout from the deployment docs
    pub fn db_and_media() -> Self {
        Self::new(&[("db", "postgres"), ("media", "jellyfin")])
    }

    pub fn repo(&self, name: &str) -> &Arc<FakeRepo> {
        &self.repos[&volume(name)]
    }

    pub fn set_retention(&mut self, name: &str, policy: RetentionPolicy) {
        if let Some(entry) = self
            .catalog
            .iter_mut()
            .find(|e| e.volume.name.as_str() == name)
        {
            entry.retention = policy;
        }
    }

    pub fn orchestrator(&self) -> BackupOrchestrator {
        let repositories: BTreeMap<VolumeName, Arc<dyn BackupRepository>> = self
            .repos
            .iter()
            .map(|(name, repo)| {
                let repo: Arc<dyn BackupRepository> = Arc::clone(repo) as Arc<dyn BackupRepository>;
                (name.clone(), repo)
            })
            .collect();

        BackupOrchestrator::new(
            Arc::clone(&self.store) as Arc<dyn VolumeStore>,
            Arc::clone(&self.workloads) as Arc<dyn WorkloadController>,
            repositories,
            self.catalog.clone(),
            self.options.clone(),
        )
    }
}
