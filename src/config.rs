//! Configuration file handling.
//!
//! One JSON file describes the host: where the volumes live in ZFS, where
//! the compose projects are, where the Borg repositories go, and which
//! volumes exist. Everything a run needs is derived from it; nothing is
//! persisted back except through `save_to_file`.
//!
//! ```json
//! {
//!   "zfs": { "parent_dataset": "datapool/services", "mount_base": "/srv" },
//!   "compose": { "services_dir": "/opt/services" },
//!   "borg": { "repo_base": "ssh://backup@nas/./borg" },
//!   "volumes": [
//!     { "name": "db", "workload": "nextcloud" },
//!     { "name": "media", "workload": "jellyfin" }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::backends::BackupRepository;
use crate::command_runner::CommandRunner;
use crate::error::{Result, VolbackError};
use crate::orchestrator::{BackupOrchestrator, OrchestratorOptions, OrphanPolicy, VolumeEntry};
use crate::retention::RetentionPolicy;
use crate::tools::borg::{BorgRepository, BorgSettings, Passphrase, repo_path};
use crate::tools::compose::ComposeController;
use crate::tools::zfs::ZfsStore;
use crate::types::{GroupName, SnapshotLabel, Volume, VolumeName};

/// Path used when neither `--config` nor `VOLBACK_CONFIG` is given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/volback/config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZfsConfig {
    /// Dataset whose children are the volumes, e.g. `datapool/services`
    pub parent_dataset: String,
    /// Where children are mounted when a volume gives no mountpoint
    pub mount_base: PathBuf,
    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComposeConfig {
    /// Holds one `<group>/docker-compose.yml` per workload group
    pub services_dir: PathBuf,
    /// `docker compose stop --timeout`
    #[serde(default)]
    pub stop_grace_secs: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BorgConfig {
    pub repo_base: String,
    #[serde(default)]
    pub rsh: Option<String>,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default)]
    pub exclude_from: Option<PathBuf>,
    #[serde(default)]
    pub archive_prefix: Option<String>,
    #[serde(default = "default_encryption")]
    pub encryption: String,
    /// Environment variable holding the repository passphrase
    #[serde(default = "default_passphrase_env")]
    pub passphrase_env: String,
}

/// Per-call deadlines in seconds; 0 disables a deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub stop_secs: u64,
    pub start_secs: u64,
    pub snapshot_secs: u64,
    pub push_secs: u64,
    pub check_secs: u64,
    pub command_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            stop_secs: 300,
            start_secs: 600,
            snapshot_secs: 60,
            push_secs: 6 * 60 * 60,
            check_secs: 0,
            command_secs: 600,
        }
    }
}

fn deadline(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// One volume as written in the file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeConfig {
    pub name: VolumeName,
    pub workload: GroupName,
    /// Defaults to `<parent_dataset>/<name>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    /// Defaults to `<mount_base>/<name>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<PathBuf>,
    /// Compose file of the workload group, when not in the default place
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_file: Option<PathBuf>,
    /// Replaces the global retention for this volume's repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionPolicy>,
}

/// Complete volback configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolbackConfig {
    pub zfs: ZfsConfig,
    pub compose: ComposeConfig,
    pub borg: BorgConfig,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub orphan_policy: OrphanPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_file: Option<PathBuf>,
    pub volumes: Vec<VolumeConfig>,
}

fn default_snapshot_prefix() -> String {
    "auto-backup".to_string()
}

fn default_compression() -> String {
    "zstd,3".to_string()
}

fn default_encryption() -> String {
    "repokey-blake2".to_string()
}

fn default_passphrase_env() -> String {
    "BORG_PASSPHRASE".to_string()
}

fn default_concurrency() -> usize {
    2
}

impl VolbackConfig {
    /// Load and validate a configuration file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            VolbackError::config(format!("failed to read {}: {}", path.display(), e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            VolbackError::config(format!("failed to parse {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration as pretty-printed JSON
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Check everything that can be checked without touching the host
    pub fn validate(&self) -> Result<()> {
        if self.zfs.parent_dataset.trim().is_empty() || self.zfs.parent_dataset.contains('@') {
            return Err(VolbackError::config(
                "zfs.parent_dataset must be a dataset name",
            ));
        }
        SnapshotLabel::new(&self.zfs.snapshot_prefix)
            .map_err(|e| VolbackError::config(format!("zfs.snapshot_prefix: {}", e)))?;

        if self.borg.repo_base.trim().is_empty() {
            return Err(VolbackError::config("borg.repo_base must be set"));
        }
        if let Some(prefix) = &self.borg.archive_prefix {
            SnapshotLabel::new(prefix)
                .map_err(|e| VolbackError::config(format!("borg.archive_prefix: {}", e)))?;
        }
        if self.borg.passphrase_env.trim().is_empty() {
            return Err(VolbackError::config("borg.passphrase_env must be set"));
        }

        if self.concurrency == 0 {
            return Err(VolbackError::config("concurrency must be at least 1"));
        }

        self.retention
            .validate()
            .map_err(|e| VolbackError::config(format!("retention: {}", e)))?;

        if self.volumes.is_empty() {
            return Err(VolbackError::config("at least one volume must be declared"));
        }

        let mut names = BTreeSet::new();
        let mut datasets = BTreeSet::new();
        let mut repositories = BTreeMap::new();
        let mut compose_files: BTreeMap<&GroupName, &Path> = BTreeMap::new();

        for volume in &self.volumes {
            if !names.insert(&volume.name) {
                return Err(VolbackError::config(format!(
                    "volume '{}' is declared more than once",
                    volume.name
                )));
            }

            let dataset = self.dataset_of(volume);
            if dataset.contains('@') || dataset.ends_with('/') {
                return Err(VolbackError::config(format!(
                    "volume '{}': '{}' is not a dataset name",
                    volume.name, dataset
                )));
            }
            if !datasets.insert(dataset.clone()) {
                return Err(VolbackError::config(format!(
                    "volume '{}': dataset '{}' is used by another volume",
                    volume.name, dataset
                )));
            }

            let repository = repo_path(&self.borg.repo_base, &dataset);
            if let Some(other) = repositories.insert(repository.clone(), &volume.name) {
                return Err(VolbackError::config(format!(
                    "volumes '{}' and '{}' would share repository {}",
                    other, volume.name, repository
                )));
            }

            if let Some(file) = &volume.compose_file {
                if let Some(previous) = compose_files.insert(&volume.workload, file) {
                    if previous != file.as_path() {
                        return Err(VolbackError::config(format!(
                            "workload '{}' has two compose files: {} and {}",
                            volume.workload,
                            previous.display(),
                            file.display()
                        )));
                    }
                }
            }

            if let Some(retention) = &volume.retention {
                retention.validate().map_err(|e| {
                    VolbackError::config(format!("volume '{}' retention: {}", volume.name, e))
                })?;
            }
        }

        Ok(())
    }

    fn dataset_of(&self, volume: &VolumeConfig) -> String {
        volume.dataset.clone().unwrap_or_else(|| {
            format!(
                "{}/{}",
                self.zfs.parent_dataset.trim_end_matches('/'),
                volume.name
            )
        })
    }

    /// Resolved volumes, in file order
    pub fn volumes(&self) -> Vec<Volume> {
        self.volumes
            .iter()
            .map(|v| Volume {
                name: v.name.clone(),
                dataset: self.dataset_of(v),
                mountpoint: v
                    .mountpoint
                    .clone()
                    .unwrap_or_else(|| self.zfs.mount_base.join(v.name.as_str())),
                workload: v.workload.clone(),
            })
            .collect()
    }

    /// Volumes with their effective retention
    pub fn catalog(&self) -> Vec<VolumeEntry> {
        self.volumes()
            .into_iter()
            .zip(&self.volumes)
            .map(|(volume, declared)| VolumeEntry {
                volume,
                retention: declared
                    .retention
                    .clone()
                    .unwrap_or_else(|| self.retention.clone()),
            })
            .collect()
    }

    /// Read the repository passphrase from the configured variable
    pub fn passphrase(&self) -> Result<Passphrase> {
        match std::env::var(&self.borg.passphrase_env) {
            Ok(value) if !value.is_empty() => Ok(Passphrase::new(value)),
            _ => Err(VolbackError::config(format!(
                "repository passphrase not set: export {}",
                self.borg.passphrase_env
            ))),
        }
    }

    pub fn borg_settings(&self, passphrase: Passphrase) -> BorgSettings {
        BorgSettings {
            repo_base: self.borg.repo_base.clone(),
            passphrase,
            rsh: self.borg.rsh.clone(),
            compression: self.borg.compression.clone(),
            exclude_from: self.borg.exclude_from.clone(),
            archive_prefix: self.borg.archive_prefix.clone(),
            encryption: self.borg.encryption.clone(),
            push_timeout: deadline(self.timeouts.push_secs),
            check_timeout: deadline(self.timeouts.check_secs),
            command_timeout: deadline(self.timeouts.command_secs),
        }
    }

    pub fn build_store(&self, runner: Arc<dyn CommandRunner>) -> ZfsStore {
        ZfsStore::new(runner, self.zfs.parent_dataset.clone(), self.volumes()).with_timeouts(
            deadline(self.timeouts.snapshot_secs),
            deadline(self.timeouts.command_secs),
        )
    }

    pub fn build_controller(&self, runner: Arc<dyn CommandRunner>) -> ComposeController {
        let mut controller = ComposeController::new(runner, self.compose.services_dir.clone())
            .with_stop_grace(self.compose.stop_grace_secs)
            .with_timeouts(
                deadline(self.timeouts.stop_secs),
                deadline(self.timeouts.start_secs),
            );
        for volume in &self.volumes {
            if let Some(file) = &volume.compose_file {
                controller = controller.with_file(volume.workload.clone(), file.clone());
            }
        }
        controller
    }

    pub fn build_repositories(
        &self,
        runner: Arc<dyn CommandRunner>,
        settings: BorgSettings,
    ) -> BTreeMap<VolumeName, Arc<dyn BackupRepository>> {
        let settings = Arc::new(settings);
        self.volumes()
            .into_iter()
            .map(|volume| {
                let repository: Arc<dyn BackupRepository> = Arc::new(BorgRepository::for_dataset(
                    Arc::clone(&runner),
                    Arc::clone(&settings),
                    &volume.dataset,
                ));
                (volume.name, repository)
            })
            .collect()
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            snapshot_prefix: self.zfs.snapshot_prefix.clone(),
            concurrency: self.concurrency,
            orphan_policy: self.orphan_policy,
            lock_file: self.lock_file.clone(),
        }
    }

    /// Wire the real ZFS, Compose and Borg adapters together
    pub fn build_orchestrator(&self, runner: Arc<dyn CommandRunner>) -> Result<BackupOrchestrator> {
        let settings = self.borg_settings(self.passphrase()?);
        Ok(self.build_orchestrator_with(runner, settings))
    }

    /// Same as `build_orchestrator` with explicit Borg settings. Commands
    /// that never reach a repository pass a settings value without a
    /// passphrase.
    pub fn build_orchestrator_with(
        &self,
        runner: Arc<dyn CommandRunner>,
        settings: BorgSettings,
    ) -> BackupOrchestrator {
        BackupOrchestrator::new(
            Arc::new(self.build_store(Arc::clone(&runner))),
            Arc::new(self.build_controller(Arc::clone(&runner))),
            self.build_repositories(runner, settings),
            self.catalog(),
            self.orchestrator_options(),
        )
    }
}
