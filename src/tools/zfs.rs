//! ZFS adapter: one child dataset per volume, one `zfs snapshot` per group.
//!
//! `zfs snapshot a@l b@l ...` is atomic in ZFS: all snapshots are taken in
//! the same transaction group or none are. The adapter still pre-checks for
//! label collisions and post-verifies every capture, and destroys any
//! partial result, so a misbehaving pool never leaves half a group behind.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::run_checked;
use crate::backends::VolumeStore;
use crate::command_runner::{CommandRunner, ToolError, ToolInvocation};
use crate::error::BackendError;
use crate::types::{Snapshot, SnapshotGroup, SnapshotLabel, SnapshotRef, Volume, VolumeName};

/// Directory under a mountpoint that exposes snapshots read-only
pub const SNAPSHOT_DIR: &str = ".zfs/snapshot";

/// Arguments for `zfs snapshot`.
///
/// | Rust Field  | CLI |
/// |-------------|-----|
/// | `snapshots` | positional `dataset@label`, one per volume |
#[derive(Debug, Clone)]
pub struct ZfsSnapshotArgs {
    pub snapshots: Vec<String>,
}

impl ToolInvocation for ZfsSnapshotArgs {
    fn program(&self) -> &'static str {
        "zfs"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["snapshot".to_string()];
        args.extend(self.snapshots.iter().cloned());
        args
    }
}

/// Arguments for `zfs destroy dataset@label`.
///
/// Only ever given a full snapshot name; a bare dataset name here would
/// destroy the volume itself, so [`ZfsDestroyArgs::new`] refuses it.
#[derive(Debug, Clone)]
pub struct ZfsDestroyArgs {
    snapshot: String,
}

impl ZfsDestroyArgs {
    pub fn new(snapshot: impl Into<String>) -> Result<Self, BackendError> {
        let snapshot = snapshot.into();
        if !snapshot.contains('@') {
            return Err(BackendError::unexpected(format!(
                "refusing to destroy '{}': not a snapshot name",
                snapshot
            )));
        }
        Ok(Self { snapshot })
    }
}

impl ToolInvocation for ZfsDestroyArgs {
    fn program(&self) -> &'static str {
        "zfs"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["destroy".to_string(), self.snapshot.clone()]
    }
}

/// Existence probe: `zfs list -H -o name -t snapshot <name>`.
///
/// Exit 0 means present, exit 1 means absent.
#[derive(Debug, Clone)]
pub struct ZfsSnapshotExistsArgs {
    pub snapshot: String,
}

impl ToolInvocation for ZfsSnapshotExistsArgs {
    fn program(&self) -> &'static str {
        "zfs"
    }

    fn to_cli_args(&self) -> Vec<String> {
        ["list", "-H", "-o", "name", "-t", "snapshot", self.snapshot.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

/// Snapshots directly on one dataset, oldest first, creation as epoch
/// seconds.
#[derive(Debug, Clone)]
pub struct ZfsListSnapshotsArgs {
    pub dataset: String,
}

impl ToolInvocation for ZfsListSnapshotsArgs {
    fn program(&self) -> &'static str {
        "zfs"
    }

    fn to_cli_args(&self) -> Vec<String> {
        [
            "list", "-H", "-p", "-t", "snapshot", "-o", "name,creation", "-s", "creation", "-d",
            "1", self.dataset.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

/// Direct children of the parent dataset with their mount state
#[derive(Debug, Clone)]
pub struct ZfsListChildrenArgs {
    pub parent: String,
}

impl ToolInvocation for ZfsListChildrenArgs {
    fn program(&self) -> &'static str {
        "zfs"
    }

    fn to_cli_args(&self) -> Vec<String> {
        [
            "list", "-H", "-o", "name,mountpoint,mounted", "-t", "filesystem", "-r", "-d", "1",
            self.parent.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

/// A mounted child of the parent dataset
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MountedDataset {
    pub dataset: String,
    pub mountpoint: PathBuf,
}

/// [`VolumeStore`] backed by ZFS child datasets
pub struct ZfsStore {
    runner: Arc<dyn CommandRunner>,
    parent_dataset: String,
    volumes: BTreeMap<VolumeName, Volume>,
    snapshot_timeout: Option<Duration>,
    command_timeout: Option<Duration>,
}

impl ZfsStore {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        parent_dataset: impl Into<String>,
        volumes: impl IntoIterator<Item = Volume>,
    ) -> Self {
        Self {
            runner,
            parent_dataset: parent_dataset.into(),
            volumes: volumes.into_iter().map(|v| (v.name.clone(), v)).collect(),
            snapshot_timeout: None,
            command_timeout: None,
        }
    }

    /// Deadline for `zfs snapshot` and for every other zfs call
    pub fn with_timeouts(mut self, snapshot: Option<Duration>, other: Option<Duration>) -> Self {
        self.snapshot_timeout = snapshot;
        self.command_timeout = other;
        self
    }

    fn volume(&self, name: &VolumeName) -> Result<&Volume, BackendError> {
        self.volumes
            .get(name)
            .ok_or_else(|| BackendError::NotFound(format!("volume '{}' is not configured", name)))
    }

    fn full_name(volume: &Volume, label: &SnapshotLabel) -> String {
        format!("{}@{}", volume.dataset, label)
    }

    fn snapshot_exists(&self, full_name: &str) -> Result<bool, BackendError> {
        let args = ZfsSnapshotExistsArgs {
            snapshot: full_name.to_string(),
        };
        let output = self.runner.run(&args, self.command_timeout)?;
        match output.exit_code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => {
                output.ensure_success()?;
                Ok(true)
            }
        }
    }

    /// Destroy whatever exists at `label` for these volumes, logging failures
    fn discard_partial(&self, volumes: &[VolumeName], label: &SnapshotLabel) {
        for name in volumes {
            if let Err(e) = self.destroy(label, name) {
                error!(volume = %name, label = %label, error = %e, "failed to remove partial snapshot");
            }
        }
    }

    /// Mounted direct children of the parent dataset
    pub fn datasets(&self) -> Result<Vec<MountedDataset>, BackendError> {
        let args = ZfsListChildrenArgs {
            parent: self.parent_dataset.clone(),
        };
        let output = run_checked(self.runner.as_ref(), &args, self.command_timeout)?;
        parse_children(&output.stdout, &self.parent_dataset)
            .map_err(|reason| ToolError::parse(args.render(), reason).into())
    }
}

impl VolumeStore for ZfsStore {
    fn snapshot(
        &self,
        volumes: &[VolumeName],
        label: &SnapshotLabel,
    ) -> Result<SnapshotGroup, BackendError> {
        let targets = volumes
            .iter()
            .map(|name| self.volume(name))
            .collect::<Result<Vec<_>, _>>()?;

        let mut conflicts = Vec::new();
        for volume in &targets {
            if self.snapshot_exists(&Self::full_name(volume, label))? {
                conflicts.push(volume.name.to_string());
            }
        }
        if !conflicts.is_empty() {
            return Err(BackendError::Conflict {
                label: label.to_string(),
                volumes: conflicts,
            });
        }

        let args = ZfsSnapshotArgs {
            snapshots: targets.iter().map(|v| Self::full_name(v, label)).collect(),
        };

        let taken = run_checked(self.runner.as_ref(), &args, self.snapshot_timeout).and_then(|_| {
            let mut missing = Vec::new();
            for volume in &targets {
                if !self.snapshot_exists(&Self::full_name(volume, label))? {
                    missing.push(volume.name.to_string());
                }
            }
            if missing.is_empty() {
                Ok(())
            } else {
                Err(BackendError::unexpected(format!(
                    "zfs reported success but '{}' is missing on: {}",
                    label,
                    missing.join(", ")
                )))
            }
        });

        if let Err(e) = taken {
            warn!(label = %label, error = %e, "snapshot failed, removing any partial captures");
            self.discard_partial(volumes, label);
            return Err(e);
        }

        info!(label = %label, volumes = targets.len(), "snapshot group created");
        Ok(SnapshotGroup {
            label: label.clone(),
            volumes: volumes.to_vec(),
            created: Utc::now(),
        })
    }

    fn destroy(&self, label: &SnapshotLabel, volume: &VolumeName) -> Result<(), BackendError> {
        let full_name = Self::full_name(self.volume(volume)?, label);

        if !self.snapshot_exists(&full_name)? {
            debug!(snapshot = %full_name, "snapshot already absent");
            return Ok(());
        }

        run_checked(
            self.runner.as_ref(),
            &ZfsDestroyArgs::new(full_name.clone())?,
            self.command_timeout,
        )?;

        if self.snapshot_exists(&full_name)? {
            return Err(BackendError::unexpected(format!(
                "snapshot '{}' still exists after destroy",
                full_name
            )));
        }
        info!(snapshot = %full_name, "snapshot destroyed");
        Ok(())
    }

    fn list(&self, volume: &VolumeName) -> Result<Vec<Snapshot>, BackendError> {
        let dataset = &self.volume(volume)?.dataset;
        let args = ZfsListSnapshotsArgs {
            dataset: dataset.clone(),
        };
        let output = run_checked(self.runner.as_ref(), &args, self.command_timeout)?;
        parse_snapshots(&output.stdout, dataset, volume)
            .map_err(|reason| ToolError::parse(args.render(), reason).into())
    }

    fn resolve(
        &self,
        label: &SnapshotLabel,
        volume: &VolumeName,
    ) -> Result<SnapshotRef, BackendError> {
        let target = self.volume(volume)?;
        let full_name = Self::full_name(target, label);
        if !self.snapshot_exists(&full_name)? {
            return Err(BackendError::NotFound(format!("snapshot '{}'", full_name)));
        }

        Ok(SnapshotRef {
            label: label.clone(),
            volume: volume.clone(),
            path: target.mountpoint.join(SNAPSHOT_DIR).join(label.as_str()),
        })
    }
}

/// Parse `name<TAB>creation` lines for one dataset
fn parse_snapshots(
    stdout: &str,
    dataset: &str,
    volume: &VolumeName,
) -> Result<Vec<Snapshot>, String> {
    let mut snapshots = Vec::new();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let (name, creation) = line
            .split_once('\t')
            .ok_or_else(|| format!("expected two columns in '{}'", line))?;
        let Some((owner, label)) = name.split_once('@') else {
            continue;
        };
        if owner != dataset {
            continue;
        }

        let created = creation
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

        snapshots.push(Snapshot {
            label: label.to_string(),
            volume: volume.clone(),
            created,
        });
    }
    Ok(snapshots)
}

/// Parse `name<TAB>mountpoint<TAB>mounted` lines, dropping the parent itself
fn parse_children(stdout: &str, parent: &str) -> Result<Vec<MountedDataset>, String> {
    let mut children = Vec::new();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split('\t').collect();
        let [name, mountpoint, mounted] = fields[..] else {
            return Err(format!("expected three columns in '{}'", line));
        };
        if name == parent || mounted != "yes" {
            continue;
        }
        children.push(MountedDataset {
            dataset: name.to_string(),
            mountpoint: PathBuf::from(mountpoint),
        });
    }
    Ok(children)
}
