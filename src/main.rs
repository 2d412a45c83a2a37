//! volback - main entry point
//!
//! Parses the command line, sets up logging and child-process cleanup, and
//! hands the work to the library. Exit codes: 0 done, 1 partial failure or
//! unhealthy result, 2 aborted run or error.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use volback::cli::{ArchiveCommands, Cli, Commands, KeyCommands, RepoCommands, SnapshotCommands};
use volback::command_runner::{CommandRunner, SystemRunner};
use volback::config::VolbackConfig;
use volback::orchestrator::{BackupOrchestrator, RunRequest, VolumeResult};
use volback::process_guard::{self, ProcessGuard};
use volback::run_state::CancelToken;
use volback::tools::borg::Passphrase;
use volback::types::{HealthStatus, RunOutcome, RunReport, VerifyDepth, VolumeStatus};

const EXIT_OK: i32 = 0;
const EXIT_PARTIAL: i32 = 1;
const EXIT_ERROR: i32 = 2;

/// Initialize tracing. `RUST_LOG` wins over the verbosity flags.
fn init_logging(verbose: u8, quiet: bool) {
    let default_level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse_args();
    init_logging(cli.verbose, cli.quiet);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}

/// Everything that holds resources lives in here so it is dropped before
/// `process::exit`
fn run(cli: Cli) -> Result<i32> {
    let _guard = ProcessGuard::new();
    let cancel = CancelToken::new();
    if let Err(e) = process_guard::init_signal_handlers(cancel.clone()) {
        warn!(error = %e, "failed to install signal handlers");
    }

    let config = VolbackConfig::load_from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    debug!(config = %cli.config.display(), volumes = config.volumes.len(), "configuration loaded");

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let json = cli.json;

    match cli.command {
        Commands::Backup {
            select,
            label,
            concurrency,
        } => {
            let orchestrator = config.build_orchestrator(runner)?;
            let request = RunRequest {
                selector: select.selector(),
                label,
                concurrency,
            };
            match orchestrator.run(&request, &cancel) {
                Ok(report) => {
                    print_report(&report, json)?;
                    Ok(report.exit_code())
                }
                Err(e) => {
                    error!(kind = e.kind(), "{}", e);
                    Ok(EXIT_ERROR)
                }
            }
        }
        Commands::Verify {
            select,
            verify_data,
        } => {
            let depth = if verify_data {
                VerifyDepth::Data
            } else {
                VerifyDepth::Metadata
            };
            let orchestrator = config.build_orchestrator(runner)?;
            let results = orchestrator.verify(&select.selector(), depth)?;
            print_results(&results, json, |status| match status {
                HealthStatus::Healthy => "healthy".to_string(),
                HealthStatus::Damaged { detail } => format!("DAMAGED: {}", detail),
            })?;
            let healthy = results
                .iter()
                .all(|r| matches!(r.value, Some(HealthStatus::Healthy)));
            Ok(if healthy { EXIT_OK } else { EXIT_PARTIAL })
        }
        Commands::Prune { select } => {
            let orchestrator = config.build_orchestrator(runner)?;
            let results = orchestrator.prune(&select.selector())?;
            print_results(&results, json, |removed| {
                format!("removed {} archive(s)", removed.len())
            })?;
            Ok(results_exit_code(&results))
        }
        Commands::Init { select } => {
            let orchestrator = config.build_orchestrator(runner)?;
            let results = orchestrator.init_repositories(&select.selector())?;
            print_results(&results, json, |created| {
                let state = if *created { "created" } else { "exists" };
                state.to_string()
            })?;
            Ok(results_exit_code(&results))
        }
        Commands::Snapshots { action } => {
            let orchestrator = without_repository_access(&config, runner);
            match action {
                SnapshotCommands::List { select } => {
                    let results = orchestrator.snapshots(&select.selector())?;
                    print_results(&results, json, |snapshots| {
                        snapshots
                            .iter()
                            .map(|s| s.label.as_str())
                            .collect::<Vec<_>>()
                            .join(" ")
                    })?;
                    Ok(results_exit_code(&results))
                }
                SnapshotCommands::Destroy { select, label } => {
                    let results = orchestrator.destroy_snapshot(&select.selector(), &label)?;
                    print_results(&results, json, |label| format!("{} destroyed", label))?;
                    Ok(results_exit_code(&results))
                }
            }
        }
        Commands::Archives { action } => {
            let orchestrator = config.build_orchestrator(runner)?;
            match action {
                ArchiveCommands::List { select } => {
                    let results = orchestrator.archives(&select.selector())?;
                    print_results(&results, json, |archives| {
                        archives
                            .iter()
                            .map(|a| format!("{} ({})", a.name, a.time))
                            .collect::<Vec<_>>()
                            .join(", ")
                    })?;
                    Ok(results_exit_code(&results))
                }
                ArchiveCommands::Extract {
                    volume,
                    archive,
                    dest,
                } => {
                    let results = orchestrator.extract_archive(&volume, &archive, &dest)?;
                    print_results(&results, json, |dest| {
                        format!("{} restored into {}", archive, dest.display())
                    })?;
                    Ok(results_exit_code(&results))
                }
                ArchiveCommands::Delete { volume, archive } => {
                    let results = orchestrator.delete_archive(&volume, &archive)?;
                    print_results(&results, json, |archive| format!("{} deleted", archive))?;
                    Ok(results_exit_code(&results))
                }
            }
        }
        Commands::Repos {
            action: RepoCommands::Info { select },
        } => {
            let orchestrator = config.build_orchestrator(runner)?;
            let results = orchestrator.repository_info(&select.selector())?;
            print_results(&results, json, |info| {
                format!(
                    "{} archive(s), {} bytes stored ({} original), {}",
                    info.archives,
                    info.deduplicated_size,
                    info.original_size,
                    info.encryption.as_deref().unwrap_or("unknown encryption")
                )
            })?;
            Ok(results_exit_code(&results))
        }
        Commands::Orphans { select } => {
            let orchestrator = without_repository_access(&config, runner);
            let orphans = orchestrator.find_orphans(&select.selector())?;
            if json {
                print_json(&orphans)?;
            } else if orphans.is_empty() {
                println!("no orphaned snapshots");
            } else {
                for orphan in &orphans {
                    let owner = if orphan.managed { "" } else { " (not volback's)" };
                    println!("{:<20} {}{}", orphan.volume.as_str(), orphan.label, owner);
                }
            }
            Ok(EXIT_OK)
        }
        Commands::Keys {
            action: KeyCommands::Export { select, dir },
        } => {
            let orchestrator = config.build_orchestrator(runner)?;
            let results = orchestrator.export_keys(&select.selector(), &dir)?;
            print_results(&results, json, |path| path.display().to_string())?;
            Ok(results_exit_code(&results))
        }
        Commands::Validate => validate(&config, runner, json),
    }
}

/// Orchestrator for commands that only touch snapshots
fn without_repository_access(
    config: &VolbackConfig,
    runner: Arc<dyn CommandRunner>,
) -> BackupOrchestrator {
    config.build_orchestrator_with(runner, config.borg_settings(Passphrase::default()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serializing output")?
    );
    Ok(())
}

fn print_results<T: Serialize>(
    results: &[VolumeResult<T>],
    json: bool,
    describe: impl Fn(&T) -> String,
) -> Result<()> {
    if json {
        return print_json(results);
    }
    for result in results {
        match (&result.value, &result.error) {
            (Some(value), _) => println!("{:<20} {}", result.volume.as_str(), describe(value)),
            (None, Some(error)) => println!("{:<20} FAILED: {}", result.volume.as_str(), error),
            (None, None) => println!("{:<20} -", result.volume.as_str()),
        }
    }
    Ok(())
}

fn results_exit_code<T>(results: &[VolumeResult<T>]) -> i32 {
    if results.iter().all(VolumeResult::is_ok) {
        EXIT_OK
    } else {
        EXIT_PARTIAL
    }
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }

    match &report.outcome {
        RunOutcome::Done => println!("run {}: done", report.label),
        RunOutcome::PartialFailure { failed } => {
            let names: Vec<&str> = failed.iter().map(|v| v.as_str()).collect();
            println!(
                "run {}: PARTIAL FAILURE ({})",
                report.label,
                names.join(", ")
            );
        }
        RunOutcome::Aborted { kind, reason } => {
            println!("run {}: ABORTED [{}] {}", report.label, kind, reason)
        }
    }

    for volume in &report.volumes {
        let detail = match volume.status {
            VolumeStatus::Succeeded => {
                let archive = volume.archive.as_deref().unwrap_or("-");
                let note = if volume.archive_created {
                    ""
                } else {
                    " (already existed)"
                };
                format!("{}{}, pruned {}", archive, note, volume.pruned.len())
            }
            _ => volume.error.clone().unwrap_or_default(),
        };
        println!(
            "  {:<20} {:<14} {}",
            volume.volume.as_str(),
            volume.status.to_string(),
            detail
        );
        for warning in &volume.warnings {
            println!("  {:<20} warning: {}", "", warning);
        }
        if volume.reused_snapshot {
            println!("  {:<20} pushed the capture kept by an earlier run", "");
        }
        if volume.snapshot_retained {
            println!("  {:<20} snapshot kept on disk", "");
        }
    }

    if let Some(ms) = report.downtime_ms {
        println!("downtime: {} ms", ms);
    }
    if let Some(warning) = &report.resume_warning {
        println!("WARNING: workloads may still be stopped: {}", warning);
    }
    if !report.orphans.is_empty() {
        println!("orphaned snapshots: {}", report.orphans.len());
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ValidationReport {
    volumes: usize,
    problems: Vec<String>,
    notes: Vec<String>,
}

/// Check the configuration against the host: datasets, compose files,
/// passphrase
fn validate(config: &VolbackConfig, runner: Arc<dyn CommandRunner>, json: bool) -> Result<i32> {
    let mut report = ValidationReport {
        volumes: config.volumes.len(),
        problems: Vec::new(),
        notes: Vec::new(),
    };

    if let Err(e) = config.passphrase() {
        report.problems.push(e.to_string());
    }

    let store = config.build_store(Arc::clone(&runner));
    match store.datasets() {
        Ok(mounted) => {
            let mounted: BTreeSet<&str> = mounted.iter().map(|d| d.dataset.as_str()).collect();
            let configured = config.volumes();
            for volume in &configured {
                if !mounted.contains(volume.dataset.as_str()) {
                    report.problems.push(format!(
                        "volume '{}': dataset {} is not mounted",
                        volume.name, volume.dataset
                    ));
                }
            }
            for dataset in mounted {
                if !configured.iter().any(|v| v.dataset == dataset) {
                    report
                        .notes
                        .push(format!("dataset {} has no volume entry", dataset));
                }
            }
        }
        Err(e) => report
            .problems
            .push(format!("cannot list datasets: {}", e)),
    }

    let controller = config.build_controller(runner);
    let groups: BTreeSet<_> = config.volumes.iter().map(|v| v.workload.clone()).collect();
    for group in &groups {
        let file = controller.compose_file(group);
        if !file.is_file() {
            report.problems.push(format!(
                "workload '{}': compose file {} not found",
                group,
                file.display()
            ));
        }
    }
    check_writable_parent(config.lock_file.as_deref(), &mut report);

    if json {
        print_json(&report)?;
    } else {
        for note in &report.notes {
            println!("note: {}", note);
        }
        for problem in &report.problems {
            println!("problem: {}", problem);
        }
        if report.problems.is_empty() {
            println!("configuration valid: {} volume(s)", report.volumes);
        }
    }

    info!(problems = report.problems.len(), "validation finished");
    Ok(if report.problems.is_empty() {
        EXIT_OK
    } else {
        EXIT_PARTIAL
    })
}

fn check_writable_parent(lock_file: Option<&Path>, report: &mut ValidationReport) {
    let Some(parent) = lock_file.and_then(Path::parent) else {
        return;
    };
    if !parent.is_dir() {
        report.problems.push(format!(
            "lock file directory {} does not exist",
            parent.display()
        ));
    }
}
