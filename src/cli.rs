use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;
use crate::orchestrator::VolumeSelector;
use crate::types::{SnapshotLabel, VolumeName};

/// volback - crash-consistent, low-downtime backups of service volumes
#[derive(Parser, Debug)]
#[command(name = "volback")]
#[command(about = "Stop workloads, snapshot every volume at once, resume, then archive each volume")]
#[command(version)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "VOLBACK_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Volume selection shared by most commands
#[derive(Args, Debug, Clone, Default)]
pub struct VolumeArgs {
    /// Volume to include (repeatable); all volumes when omitted
    #[arg(long = "volume", value_name = "NAME")]
    pub volumes: Vec<VolumeName>,
}

impl VolumeArgs {
    pub fn selector(&self) -> VolumeSelector {
        if self.volumes.is_empty() {
            VolumeSelector::All
        } else {
            VolumeSelector::Named(self.volumes.clone())
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a backup: stop, snapshot, resume, then push/prune/clean per volume
    Backup {
        #[command(flatten)]
        select: VolumeArgs,
        /// Snapshot label (default: <prefix>_<local timestamp>)
        #[arg(short, long)]
        label: Option<SnapshotLabel>,
        /// Volumes processed in parallel after workloads resume
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Check repository integrity
    Verify {
        #[command(flatten)]
        select: VolumeArgs,
        /// Read and verify every data chunk (slow)
        #[arg(long)]
        verify_data: bool,
    },
    /// Apply retention policies without running a backup
    Prune {
        #[command(flatten)]
        select: VolumeArgs,
    },
    /// Create missing repositories
    Init {
        #[command(flatten)]
        select: VolumeArgs,
    },
    /// Inspect or remove snapshots
    Snapshots {
        #[command(subcommand)]
        action: SnapshotCommands,
    },
    /// Inspect, restore or delete repository archives
    Archives {
        #[command(subcommand)]
        action: ArchiveCommands,
    },
    /// Repository statistics
    Repos {
        #[command(subcommand)]
        action: RepoCommands,
    },
    /// List snapshots left behind by earlier runs
    Orphans {
        #[command(flatten)]
        select: VolumeArgs,
    },
    /// Repository key management
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Validate the configuration against the host
    Validate,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommands {
    /// List snapshots per volume
    List {
        #[command(flatten)]
        select: VolumeArgs,
    },
    /// Destroy one label on the selected volumes
    Destroy {
        #[command(flatten)]
        select: VolumeArgs,
        #[arg(short, long)]
        label: SnapshotLabel,
    },
}

#[derive(Subcommand, Debug)]
pub enum ArchiveCommands {
    /// List archives per repository
    List {
        #[command(flatten)]
        select: VolumeArgs,
    },
    /// Restore one archive into an empty directory
    Extract {
        #[arg(long)]
        volume: VolumeName,
        #[arg(long)]
        archive: String,
        /// Created when missing; must be empty otherwise
        #[arg(long)]
        dest: PathBuf,
    },
    /// Delete one archive from a volume's repository
    Delete {
        #[arg(long)]
        volume: VolumeName,
        #[arg(long)]
        archive: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum RepoCommands {
    /// Size, encryption and archive count per repository
    Info {
        #[command(flatten)]
        select: VolumeArgs,
    },
}

#[derive(Subcommand, Debug)]
pub enum KeyCommands {
    /// Export and verify each repository key as `<dir>/<volume>.key`
    Export {
        #[command(flatten)]
        select: VolumeArgs,
        #[arg(long)]
        dir: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["volback"]).is_err());
    }

    #[test]
    fn test_cli_backup_defaults() {
        let cli = Cli::try_parse_from(["volback", "backup"]).unwrap();
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        match cli.command {
            Commands::Backup {
                select,
                label,
                concurrency,
            } => {
                assert_eq!(select.selector(), VolumeSelector::All);
                assert!(label.is_none());
                assert!(concurrency.is_none());
            }
            _ => panic!("Expected Backup command"),
        }
    }

    #[test]
    fn test_cli_backup_with_volumes_and_label() {
        let cli = Cli::try_parse_from([
            "volback",
            "--config",
            "/tmp/volback.json",
            "backup",
            "--volume",
            "db",
            "--volume",
            "media",
            "--label",
            "2024-01-01",
            "--concurrency",
            "4",
            "--json",
        ])
        .unwrap();

        assert!(cli.json);
        assert_eq!(cli.config, PathBuf::from("/tmp/volback.json"));
        match cli.command {
            Commands::Backup {
                select,
                label,
                concurrency,
            } => {
                assert_eq!(
                    select.selector(),
                    VolumeSelector::Named(vec![
                        VolumeName::new("db").unwrap(),
                        VolumeName::new("media").unwrap()
                    ])
                );
                assert_eq!(label.unwrap().as_str(), "2024-01-01");
                assert_eq!(concurrency, Some(4));
            }
            _ => panic!("Expected Backup command"),
        }
    }

    #[test]
    fn test_cli_rejects_invalid_names() {
        assert!(Cli::try_parse_from(["volback", "backup", "--volume", "a/b"]).is_err());
        assert!(Cli::try_parse_from(["volback", "backup", "--label", "x@y"]).is_err());
    }

    #[test]
    fn test_cli_verbosity() {
        let cli = Cli::try_parse_from(["volback", "-vv", "validate"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(Cli::try_parse_from(["volback", "-v", "-q", "validate"]).is_err());
    }

    #[test]
    fn test_cli_nested_commands() {
        let cli = Cli::try_parse_from(["volback", "snapshots", "destroy", "--label", "old"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Snapshots {
                action: SnapshotCommands::Destroy { .. }
            }
        ));

        let cli = Cli::try_parse_from(["volback", "keys", "export", "--dir", "/root/keys"]).unwrap();
        match cli.command {
            Commands::Keys {
                action: KeyCommands::Export { dir, .. },
            } => assert_eq!(dir, PathBuf::from("/root/keys")),
            _ => panic!("Expected keys export"),
        }

        let cli = Cli::try_parse_from(["volback", "verify", "--verify-data"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Verify {
                verify_data: true,
                ..
            }
        ));
    }

    #[test]
    fn test_cli_archive_restore_and_delete() {
        let cli = Cli::try_parse_from([
            "volback",
            "archives",
            "extract",
            "--volume",
            "db",
            "--archive",
            "auto-backup_2024-06-01_03-00-00",
            "--dest",
            "/srv/restore/db",
        ])
        .unwrap();
        match cli.command {
            Commands::Archives {
                action:
                    ArchiveCommands::Extract {
                        volume,
                        archive,
                        dest,
                    },
            } => {
                assert_eq!(volume.as_str(), "db");
                assert_eq!(archive, "auto-backup_2024-06-01_03-00-00");
                assert_eq!(dest, PathBuf::from("/srv/restore/db"));
            }
            _ => panic!("Expected archives extract"),
        }

        // A restore names exactly one volume and a destination
        assert!(Cli::try_parse_from(["volback", "archives", "extract", "--archive", "a"]).is_err());

        let cli = Cli::try_parse_from([
            "volback", "archives", "delete", "--volume", "media", "--archive", "old",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Archives {
                action: ArchiveCommands::Delete { .. }
            }
        ));
    }

    #[test]
    fn test_cli_repos_info() {
        let cli = Cli::try_parse_from(["volback", "--json", "repos", "info", "--volume", "db"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Repos {
                action: RepoCommands::Info { select },
            } => assert_eq!(
                select.selector(),
                VolumeSelector::Named(vec![VolumeName::new("db").unwrap()])
            ),
            _ => panic!("Expected repos info"),
        }
    }
}
