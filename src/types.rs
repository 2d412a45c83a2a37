//! Data model for volback
//!
//! Validated identifiers replace raw strings wherever a value ends up on an
//! external command line (dataset names, compose project names, snapshot
//! labels), so a typo or an injected `@`/`/` is rejected at load time instead
//! of being handed to `zfs` or `borg`.

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use strum::{Display, EnumString};
use thiserror::Error;

/// Maximum length of a volume or workload group name
pub const MAX_NAME_LEN: usize = 64;

/// Maximum length of a snapshot label
pub const MAX_LABEL_LEN: usize = 200;

/// Error for identifiers that fail validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {kind} '{value}': {reason}")]
pub struct NameError {
    pub kind: &'static str,
    pub value: String,
    pub reason: String,
}

fn check_identifier(
    kind: &'static str,
    value: &str,
    max_len: usize,
    extra: &[char],
) -> Result<(), NameError> {
    let fail = |reason: &str| NameError {
        kind,
        value: value.to_string(),
        reason: reason.to_string(),
    };

    if value.is_empty() {
        return Err(fail("must not be empty"));
    }
    if value.len() > max_len {
        return Err(fail(&format!("must be at most {} characters", max_len)));
    }
    if value.starts_with('-') || value.starts_with('.') {
        return Err(fail("must not start with '-' or '.'"));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-' || extra.contains(c)))
    {
        return Err(fail(&format!("character '{}' is not allowed", bad)));
    }
    Ok(())
}

macro_rules! validated_name {
    ($(#[$meta:meta])* $name:ident, $kind:literal, $max:expr, $extra:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap a raw string
            pub fn new(value: impl Into<String>) -> Result<Self, NameError> {
                let value = value.into();
                check_identifier($kind, &value, $max, $extra)?;
                Ok(Self(value))
            }

            /// Borrow the raw string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = NameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = NameError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

validated_name!(
    /// Stable name of one volume (one ZFS child dataset per service)
    VolumeName,
    "volume name",
    MAX_NAME_LEN,
    &['.']
);

validated_name!(
    /// Name of a workload group (one Docker Compose project)
    GroupName,
    "workload group",
    MAX_NAME_LEN,
    &['.']
);

validated_name!(
    /// Label shared by every capture taken in one snapshot group.
    ///
    /// Also the identity of the archive the capture becomes, so the same
    /// label always maps to the same archive name.
    SnapshotLabel,
    "snapshot label",
    MAX_LABEL_LEN,
    &['.', ':']
);

impl SnapshotLabel {
    /// Generate a timestamped label: `<prefix>_%Y-%m-%d_%H-%M-%S`
    pub fn generate(prefix: &str, now: DateTime<Local>) -> Result<Self, NameError> {
        Self::new(format!("{}_{}", prefix, now.format("%Y-%m-%d_%H-%M-%S")))
    }

    /// True when the label was produced by `generate` with this prefix
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('_'))
    }
}

/// One isolated unit of persistent data. Created by provisioning, only ever
/// referenced here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: VolumeName,
    /// Backing ZFS dataset, e.g. `datapool/services/db`
    pub dataset: String,
    /// Where the dataset is mounted on the host
    pub mountpoint: PathBuf,
    /// The workload group that writes to this volume
    pub workload: GroupName,
}

/// Captures of several volumes taken together under one label
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotGroup {
    pub label: SnapshotLabel,
    pub volumes: Vec<VolumeName>,
    pub created: DateTime<Utc>,
}

/// One volume's copy of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub label: String,
    pub volume: VolumeName,
    pub created: Option<DateTime<Utc>>,
}

/// Everything a repository needs to read one volume's capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRef {
    pub label: SnapshotLabel,
    pub volume: VolumeName,
    /// Read-only directory holding the captured data
    pub path: PathBuf,
}

/// One backup of one snapshot inside a repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    pub name: String,
    pub time: NaiveDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Result of a push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    pub archive: String,
    /// False when an archive with this name already existed and was kept
    pub created: bool,
}

/// How thoroughly a repository is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum VerifyDepth {
    /// Repository and archive metadata only
    #[default]
    Metadata,
    /// Read and verify every data chunk (slow)
    Data,
}

/// Repository health as reported by `verify`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum HealthStatus {
    Healthy,
    Damaged { detail: String },
}

/// Final status of one volume in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum VolumeStatus {
    Succeeded,
    BackupFailed,
    PruneFailed,
    /// Never attempted: the run was aborted or cancelled first
    Skipped,
}

/// Per-volume line of the run report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeOutcome {
    pub volume: VolumeName,
    pub status: VolumeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
    /// False when the archive already existed for this label
    pub archive_created: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pruned: Vec<String>,
    /// True when this volume's capture is still on disk after the run
    pub snapshot_retained: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub orphans_recovered: Vec<String>,
    /// True when the push read a capture left at this label by an earlier run
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reused_snapshot: bool,
    pub duration_ms: u64,
}

impl VolumeOutcome {
    /// Outcome for a volume that was never processed
    pub fn skipped(volume: VolumeName, snapshot_retained: bool) -> Self {
        Self {
            volume,
            status: VolumeStatus::Skipped,
            archive: None,
            archive_created: false,
            pruned: Vec::new(),
            snapshot_retained,
            error: None,
            warnings: Vec::new(),
            orphans_recovered: Vec::new(),
            reused_snapshot: false,
            duration_ms: 0,
        }
    }
}

/// A capture left behind by an earlier run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanSnapshot {
    pub volume: VolumeName,
    pub label: SnapshotLabel,
    /// Label carries the configured snapshot prefix; only these are retried
    pub managed: bool,
}

/// Repository statistics from `borg info`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepositoryInfo {
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    pub archives: usize,
    /// Bytes before compression and deduplication
    pub original_size: u64,
    pub compressed_size: u64,
    /// Bytes actually stored
    pub deduplicated_size: u64,
}

/// Terminal state of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum RunOutcome {
    Done,
    PartialFailure { failed: Vec<VolumeName> },
    Aborted { kind: String, reason: String },
}

/// Machine-readable summary of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub label: SnapshotLabel,
    pub outcome: RunOutcome,
    pub volumes: Vec<VolumeOutcome>,
    /// Time between the first stop call and the end of the resume step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downtime_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_warning: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub orphans: Vec<OrphanSnapshot>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Process exit code: 0 done, 1 partial failure, 2 aborted
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Done => 0,
            RunOutcome::PartialFailure { .. } => 1,
            RunOutcome::Aborted { .. } => 2,
        }
    }

    /// Status of one volume, if it was part of the run
    pub fn status_of(&self, volume: &str) -> Option<VolumeStatus> {
        self.volumes
            .iter()
            .find(|v| v.volume.as_str() == volume)
            .map(|v| v.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_names_accept_service_names() {
        assert!(VolumeName::new("db").is_ok());
        assert!(VolumeName::new("media_2").is_ok());
        assert!(GroupName::new("nextcloud-aio").is_ok());
    }

    #[test]
    fn test_names_reject_path_and_snapshot_separators() {
        assert!(VolumeName::new("pool/db").is_err());
        assert!(VolumeName::new("db@now").is_err());
        assert!(VolumeName::new("").is_err());
        assert!(VolumeName::new("-rf").is_err());
    }

    #[test]
    fn test_label_allows_colons_and_dots() {
        let label = SnapshotLabel::new("2024-01-01T00:00:00.5").unwrap();
        assert_eq!(label.as_str(), "2024-01-01T00:00:00.5");
        assert!(SnapshotLabel::new("a b").is_err());
        assert!(SnapshotLabel::new("x".repeat(MAX_LABEL_LEN + 1)).is_err());
    }

    #[test]
    fn test_generate_label() {
        let now = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let label = SnapshotLabel::generate("auto-backup", now).unwrap();
        assert_eq!(label.as_str(), "auto-backup_2024-01-02_03-04-05");
        assert!(label.has_prefix("auto-backup"));
        assert!(!label.has_prefix("auto"));
    }

    #[test]
    fn test_name_error_message() {
        let err = VolumeName::new("a/b").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid volume name 'a/b': character '/' is not allowed"
        );
    }

    #[test]
    fn test_names_deserialize_with_validation() {
        let ok: VolumeName = serde_json::from_str("\"db\"").unwrap();
        assert_eq!(ok.as_str(), "db");
        assert!(serde_json::from_str::<VolumeName>("\"a/b\"").is_err());
    }

    #[test]
    fn test_volume_status_strings() {
        assert_eq!(VolumeStatus::BackupFailed.to_string(), "backup-failed");
        assert_eq!(
            "prune-failed".parse::<VolumeStatus>().unwrap(),
            VolumeStatus::PruneFailed
        );
        assert_eq!(
            serde_json::to_string(&VolumeStatus::Succeeded).unwrap(),
            "\"succeeded\""
        );
    }

    #[test]
    fn test_outcome_serializes_with_state_tag() {
        let outcome = RunOutcome::PartialFailure {
            failed: vec![VolumeName::new("media").unwrap()],
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["state"], "partial-failure");
        assert_eq!(json["failed"][0], "media");
    }
}
