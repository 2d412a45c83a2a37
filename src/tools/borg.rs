//! Borg adapter: one repository per volume.
//!
//! Each volume's repository lives at `<repo_base>/<dataset with '/' → '_'>`,
//! so two volumes can never share one. The repository location and
//! passphrase travel through `BORG_REPO` / `BORG_PASSPHRASE`, which keeps the
//! secret off the command line and lets archives be addressed as `::name`.
//!
//! Archives are created from inside the read-only snapshot directory with
//! `.` as the source path, so archive contents are relative to the volume
//! root and never mention the snapshot label.

use chrono::NaiveDateTime;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::run_checked;
use crate::backends::BackupRepository;
use crate::command_runner::{CommandRunner, ToolError, ToolInvocation};
use crate::error::BackendError;
use crate::types::{
    Archive, HealthStatus, PushOutcome, RepositoryInfo, SnapshotLabel, SnapshotRef, VerifyDepth,
};

/// `borg info` exit code for a missing repository
const EXIT_REPO_MISSING: i32 = 2;

/// ssh option added for long-running `borg check`
const KEEP_ALIVE: &str = "-o ServerAliveInterval=60";

/// Timestamp format of `borg list --json`
const BORG_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Repository passphrase. Never printed.
#[derive(Clone, Default)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(***)")
    }
}

/// Settings shared by every repository of one host
#[derive(Debug, Clone)]
pub struct BorgSettings {
    /// Base location; local path or `ssh://user@host/path`
    pub repo_base: String,
    pub passphrase: Passphrase,
    /// Value for `BORG_RSH`, e.g. `ssh -i /root/.ssh/backup_key`
    pub rsh: Option<String>,
    pub compression: String,
    pub exclude_from: Option<PathBuf>,
    /// Archives are named `<prefix>-<label>` when set
    pub archive_prefix: Option<String>,
    pub encryption: String,
    pub push_timeout: Option<Duration>,
    pub check_timeout: Option<Duration>,
    pub command_timeout: Option<Duration>,
}

impl Default for BorgSettings {
    fn default() -> Self {
        Self {
            repo_base: String::new(),
            passphrase: Passphrase::default(),
            rsh: None,
            compression: "zstd,3".to_string(),
            exclude_from: None,
            archive_prefix: None,
            encryption: "repokey-blake2".to_string(),
            push_timeout: None,
            check_timeout: None,
            command_timeout: None,
        }
    }
}

/// Repository location for a dataset: `<base>/<dataset with / replaced by _>`
pub fn repo_path(base: &str, dataset: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), dataset.replace('/', "_"))
}

/// Environment contract shared by all borg calls
#[derive(Debug, Clone)]
struct BorgEnv {
    repo: String,
    passphrase: Passphrase,
    rsh: Option<String>,
    keep_alive: bool,
    key_file: Option<PathBuf>,
}

impl BorgEnv {
    fn vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("BORG_REPO".to_string(), self.repo.clone()),
            (
                "BORG_PASSPHRASE".to_string(),
                self.passphrase.expose().to_string(),
            ),
        ];

        let rsh = match (&self.rsh, self.keep_alive) {
            (Some(rsh), true) => Some(format!("{} {}", rsh, KEEP_ALIVE)),
            (None, true) => Some(format!("ssh {}", KEEP_ALIVE)),
            (rsh, false) => rsh.clone(),
        };
        if let Some(rsh) = rsh {
            vars.push(("BORG_RSH".to_string(), rsh));
        }
        if let Some(key_file) = &self.key_file {
            vars.push(("BORG_KEY_FILE".to_string(), key_file.display().to_string()));
        }
        vars
    }
}

/// One borg subcommand with its flags
pub trait BorgSubcommand {
    fn args(&self) -> Vec<String>;

    fn working_dir(&self) -> Option<&Path> {
        None
    }
}

/// A subcommand bound to a repository environment
struct BorgInvocation<'a> {
    command: &'a dyn BorgSubcommand,
    env: BorgEnv,
}

impl ToolInvocation for BorgInvocation<'_> {
    fn program(&self) -> &'static str {
        "borg"
    }

    fn to_cli_args(&self) -> Vec<String> {
        self.command.args()
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        self.env.vars()
    }

    fn working_dir(&self) -> Option<&Path> {
        self.command.working_dir()
    }
}

/// `borg info [--json]`
#[derive(Debug, Clone, Copy)]
pub struct BorgInfoArgs {
    pub json: bool,
}

impl BorgSubcommand for BorgInfoArgs {
    fn args(&self) -> Vec<String> {
        let mut args = vec!["info".to_string()];
        if self.json {
            args.push("--json".to_string());
        }
        args
    }
}

/// `borg init --encryption=<mode>`
#[derive(Debug, Clone)]
pub struct BorgInitArgs {
    pub encryption: String,
}

impl BorgSubcommand for BorgInitArgs {
    fn args(&self) -> Vec<String> {
        vec!["init".to_string(), format!("--encryption={}", self.encryption)]
    }
}

/// `borg create`, run from inside the snapshot directory.
///
/// | Rust Field     | CLI |
/// |----------------|-----|
/// | `archive`      | `::<archive>` |
/// | `compression`  | `--compression <c>` |
/// | `exclude_from` | `--exclude-from <file>` |
/// | `source`       | working directory; source path is `.` |
#[derive(Debug, Clone)]
pub struct BorgCreateArgs {
    pub archive: String,
    pub compression: String,
    pub exclude_from: Option<PathBuf>,
    pub source: PathBuf,
}

impl BorgSubcommand for BorgCreateArgs {
    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--stats".to_string(),
            "--compression".to_string(),
            self.compression.clone(),
        ];
        if let Some(exclude) = &self.exclude_from {
            args.push("--exclude-from".to_string());
            args.push(exclude.display().to_string());
        }
        args.push(format!("::{}", self.archive));
        args.push(".".to_string());
        args
    }

    fn working_dir(&self) -> Option<&Path> {
        Some(&self.source)
    }
}

/// `borg list --json [--glob-archives <glob>]`
#[derive(Debug, Clone)]
pub struct BorgListArgs {
    pub glob: Option<String>,
}

impl BorgSubcommand for BorgListArgs {
    fn args(&self) -> Vec<String> {
        let mut args = vec!["list".to_string(), "--json".to_string()];
        if let Some(glob) = &self.glob {
            args.push("--glob-archives".to_string());
            args.push(glob.clone());
        }
        args
    }
}

/// `borg delete ::<archive>`
#[derive(Debug, Clone)]
pub struct BorgDeleteArgs {
    pub archive: String,
}

impl BorgSubcommand for BorgDeleteArgs {
    fn args(&self) -> Vec<String> {
        vec!["delete".to_string(), format!("::{}", self.archive)]
    }
}

/// `borg extract ::<archive>`, run from inside the restore directory
#[derive(Debug, Clone)]
pub struct BorgExtractArgs {
    pub archive: String,
    pub dest: PathBuf,
}

impl BorgSubcommand for BorgExtractArgs {
    fn args(&self) -> Vec<String> {
        vec!["extract".to_string(), format!("::{}", self.archive)]
    }

    fn working_dir(&self) -> Option<&Path> {
        Some(&self.dest)
    }
}

/// `borg compact`
#[derive(Debug, Clone, Copy)]
pub struct BorgCompactArgs;

impl BorgSubcommand for BorgCompactArgs {
    fn args(&self) -> Vec<String> {
        vec!["compact".to_string()]
    }
}

/// `borg check [--verify-data]`
#[derive(Debug, Clone, Copy)]
pub struct BorgCheckArgs {
    pub depth: VerifyDepth,
}

impl BorgSubcommand for BorgCheckArgs {
    fn args(&self) -> Vec<String> {
        let mut args = vec!["check".to_string()];
        if self.depth == VerifyDepth::Data {
            args.push("--verify-data".to_string());
        }
        args
    }
}

/// `borg key export --paper <repo> <path>`
#[derive(Debug, Clone)]
pub struct BorgKeyExportArgs {
    pub repo: String,
    pub path: PathBuf,
}

impl BorgSubcommand for BorgKeyExportArgs {
    fn args(&self) -> Vec<String> {
        vec![
            "key".to_string(),
            "export".to_string(),
            "--paper".to_string(),
            self.repo.clone(),
            self.path.display().to_string(),
        ]
    }
}

#[derive(Debug, Deserialize)]
struct BorgListing {
    archives: Vec<BorgListEntry>,
}

/// Borg prints `archive`/`name` and `start`/`time` as duplicates; only
/// `name` and `time` are read.
#[derive(Debug, Deserialize)]
struct BorgListEntry {
    name: String,
    #[serde(default)]
    id: Option<String>,
    time: String,
}

#[derive(Debug, Deserialize)]
struct BorgInfo {
    repository: BorgInfoRepository,
    #[serde(default)]
    encryption: Option<BorgInfoEncryption>,
    #[serde(default)]
    cache: Option<BorgInfoCache>,
}

#[derive(Debug, Deserialize)]
struct BorgInfoRepository {
    id: String,
    location: String,
    #[serde(default)]
    last_modified: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BorgInfoEncryption {
    mode: String,
}

#[derive(Debug, Deserialize)]
struct BorgInfoCache {
    stats: BorgCacheStats,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BorgCacheStats {
    total_size: u64,
    total_csize: u64,
    unique_csize: u64,
}

/// Parse the JSON printed by `borg info --json` for a repository
fn parse_info(stdout: &str) -> Result<RepositoryInfo, String> {
    let info: BorgInfo = serde_json::from_str(stdout).map_err(|e| e.to_string())?;
    let stats = info.cache.map(|c| c.stats).unwrap_or_default();
    Ok(RepositoryInfo {
        location: info.repository.location,
        id: Some(info.repository.id),
        encryption: info.encryption.map(|e| e.mode),
        last_modified: info.repository.last_modified,
        archives: 0,
        original_size: stats.total_size,
        compressed_size: stats.total_csize,
        deduplicated_size: stats.unique_csize,
    })
}

/// Parse the JSON printed by `borg list --json`
fn parse_listing(stdout: &str) -> Result<Vec<Archive>, String> {
    let listing: BorgListing = serde_json::from_str(stdout).map_err(|e| e.to_string())?;
    listing
        .archives
        .into_iter()
        .map(|entry| {
            let time = NaiveDateTime::parse_from_str(&entry.time, BORG_TIME_FORMAT)
                .map_err(|e| format!("archive '{}' has bad time '{}': {}", entry.name, entry.time, e))?;
            Ok(Archive {
                name: entry.name,
                time,
                id: entry.id,
            })
        })
        .collect()
}

/// [`BackupRepository`] backed by one Borg repository
pub struct BorgRepository {
    runner: Arc<dyn CommandRunner>,
    settings: Arc<BorgSettings>,
    repo: String,
}

impl BorgRepository {
    /// Repository for the volume stored in `dataset`
    pub fn for_dataset(
        runner: Arc<dyn CommandRunner>,
        settings: Arc<BorgSettings>,
        dataset: &str,
    ) -> Self {
        let repo = repo_path(&settings.repo_base, dataset);
        Self {
            runner,
            settings,
            repo,
        }
    }

    /// Archive name for a snapshot label
    pub fn archive_name(&self, label: &SnapshotLabel) -> String {
        match &self.settings.archive_prefix {
            Some(prefix) => format!("{}-{}", prefix, label),
            None => label.to_string(),
        }
    }

    fn env(&self) -> BorgEnv {
        BorgEnv {
            repo: self.repo.clone(),
            passphrase: self.settings.passphrase.clone(),
            rsh: self.settings.rsh.clone(),
            keep_alive: false,
            key_file: None,
        }
    }

    fn invoke<'a>(&self, command: &'a dyn BorgSubcommand) -> BorgInvocation<'a> {
        BorgInvocation {
            command,
            env: self.env(),
        }
    }

    fn repository_exists(&self) -> Result<bool, BackendError> {
        let output = self
            .runner
            .run(
                &self.invoke(&BorgInfoArgs { json: false }),
                self.settings.command_timeout,
            )?;
        match output.exit_code {
            Some(0) => Ok(true),
            Some(EXIT_REPO_MISSING) => Ok(false),
            _ => {
                output.ensure_success()?;
                Ok(true)
            }
        }
    }

    fn find_archive(&self, name: &str) -> Result<Option<Archive>, BackendError> {
        Ok(self.list()?.into_iter().find(|a| a.name == name))
    }
}

impl BackupRepository for BorgRepository {
    fn location(&self) -> String {
        self.repo.clone()
    }

    fn ensure_initialized(&self) -> Result<bool, BackendError> {
        if self.repository_exists()? {
            debug!(repository = %self.repo, "repository exists");
            return Ok(false);
        }

        info!(repository = %self.repo, encryption = %self.settings.encryption, "initializing repository");
        let init = BorgInitArgs {
            encryption: self.settings.encryption.clone(),
        };
        run_checked(
            self.runner.as_ref(),
            &self.invoke(&init),
            self.settings.command_timeout,
        )?;

        if !self.repository_exists()? {
            return Err(BackendError::unexpected(format!(
                "repository {} still missing after init",
                self.repo
            )));
        }
        Ok(true)
    }

    fn push(&self, snapshot: &SnapshotRef) -> Result<PushOutcome, BackendError> {
        if !snapshot.path.is_dir() {
            return Err(BackendError::NotFound(format!(
                "snapshot directory {}",
                snapshot.path.display()
            )));
        }

        self.ensure_initialized()?;

        let archive = self.archive_name(&snapshot.label);
        if self.find_archive(&archive)?.is_some() {
            info!(repository = %self.repo, archive = %archive, "archive already exists, skipping push");
            return Ok(PushOutcome {
                archive,
                created: false,
            });
        }

        let create = BorgCreateArgs {
            archive: archive.clone(),
            compression: self.settings.compression.clone(),
            exclude_from: self.settings.exclude_from.clone(),
            source: snapshot.path.clone(),
        };
        let output = run_checked(
            self.runner.as_ref(),
            &self.invoke(&create),
            self.settings.push_timeout,
        )?;
        if !output.stderr.trim().is_empty() {
            // --stats goes to stderr
            debug!(repository = %self.repo, stats = %output.stderr.trim(), "borg create stats");
        }

        if self.find_archive(&archive)?.is_none() {
            return Err(BackendError::unexpected(format!(
                "archive '{}' missing from {} after create",
                archive, self.repo
            )));
        }

        info!(repository = %self.repo, archive = %archive, "archive created");
        Ok(PushOutcome {
            archive,
            created: true,
        })
    }

    fn list(&self) -> Result<Vec<Archive>, BackendError> {
        let args = BorgListArgs {
            glob: self
                .settings
                .archive_prefix
                .as_ref()
                .map(|prefix| format!("{}-*", prefix)),
        };
        let invocation = self.invoke(&args);
        let output = run_checked(
            self.runner.as_ref(),
            &invocation,
            self.settings.command_timeout,
        )?;
        parse_listing(&output.stdout)
            .map_err(|reason| ToolError::parse(invocation.render(), reason).into())
    }

    fn delete(&self, archive: &str) -> Result<(), BackendError> {
        let args = BorgDeleteArgs {
            archive: archive.to_string(),
        };
        run_checked(
            self.runner.as_ref(),
            &self.invoke(&args),
            self.settings.command_timeout,
        )?;
        info!(repository = %self.repo, archive, "archive deleted");
        Ok(())
    }

    fn compact(&self) -> Result<(), BackendError> {
        run_checked(
            self.runner.as_ref(),
            &self.invoke(&BorgCompactArgs),
            self.settings.command_timeout,
        )?;
        Ok(())
    }

    fn extract(&self, archive: &str, dest: &Path) -> Result<(), BackendError> {
        std::fs::create_dir_all(dest).map_err(|e| {
            BackendError::unexpected(format!("cannot create {}: {}", dest.display(), e))
        })?;

        let args = BorgExtractArgs {
            archive: archive.to_string(),
            dest: dest.to_path_buf(),
        };
        run_checked(
            self.runner.as_ref(),
            &self.invoke(&args),
            self.settings.push_timeout,
        )?;
        info!(repository = %self.repo, archive, dest = %dest.display(), "archive extracted");
        Ok(())
    }

    fn info(&self) -> Result<RepositoryInfo, BackendError> {
        let args = BorgInfoArgs { json: true };
        let invocation = self.invoke(&args);
        let output = run_checked(
            self.runner.as_ref(),
            &invocation,
            self.settings.command_timeout,
        )?;
        let mut info = parse_info(&output.stdout)
            .map_err(|reason| ToolError::parse(invocation.render(), reason))?;
        info.archives = self.list()?.len();
        Ok(info)
    }

    fn verify(&self, depth: VerifyDepth) -> Result<HealthStatus, BackendError> {
        let args = BorgCheckArgs { depth };
        let mut invocation = self.invoke(&args);
        invocation.env.keep_alive = true;

        let output = self.runner.run(&invocation, self.settings.check_timeout)?;
        if output.success {
            info!(repository = %self.repo, depth = %depth, "repository healthy");
            return Ok(HealthStatus::Healthy);
        }

        let detail = match output.stderr.trim() {
            "" => format!("borg check exited with {}", output.exit_code.unwrap_or(-1)),
            stderr => stderr.to_string(),
        };
        warn!(repository = %self.repo, detail = %detail, "repository check failed");
        Ok(HealthStatus::Damaged { detail })
    }

    fn export_key(&self, path: &Path) -> Result<(), BackendError> {
        use std::os::unix::fs::PermissionsExt;

        let remove_partial = || {
            if path.exists() {
                match std::fs::remove_file(path) {
                    Ok(()) => info!(path = %path.display(), "removed partial key file"),
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial key file"),
                }
            }
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BackendError::unexpected(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let export = BorgKeyExportArgs {
            repo: self.repo.clone(),
            path: path.to_path_buf(),
        };
        if let Err(e) = run_checked(
            self.runner.as_ref(),
            &self.invoke(&export),
            self.settings.command_timeout,
        ) {
            remove_partial();
            return Err(e);
        }

        if path.exists() {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|e| {
                BackendError::unexpected(format!("cannot restrict {}: {}", path.display(), e))
            })?;
        }

        let list = BorgListArgs { glob: None };
        let mut invocation = self.invoke(&list);
        invocation.env.key_file = Some(path.to_path_buf());
        let verified = run_checked(
            self.runner.as_ref(),
            &invocation,
            self.settings.command_timeout,
        );
        if let Err(e) = verified {
            remove_partial();
            return Err(BackendError::Verification(format!(
                "exported key for {} does not open the repository: {}",
                self.repo, e
            )));
        }

        info!(repository = %self.repo, path = %path.display(), "recovery key exported and verified");
        Ok(())
    }
}
