//! Docker Compose adapter: one compose project per workload group.
//!
//! `docker compose stop` returns once every container has exited, and
//! `docker compose up -d --wait` once every container is running (healthy,
//! where a healthcheck exists). Both are no-ops on a group already in the
//! target state.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use super::run_checked;
use crate::backends::WorkloadController;
use crate::command_runner::{CommandRunner, ToolInvocation};
use crate::error::BackendError;
use crate::types::GroupName;

/// Compose file name looked up inside `<services_dir>/<group>/`
pub const DEFAULT_COMPOSE_FILE: &str = "docker-compose.yml";

/// What to do with a compose project
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeAction {
    Stop,
    Up,
}

/// Arguments for `docker compose -f <file> stop|up -d --wait`.
///
/// | Rust Field | CLI |
/// |------------|-----|
/// | `file`     | `-f <file>` |
/// | `action`   | `stop` or `up -d --wait` |
/// | `stop_grace` | `--timeout <secs>` (stop only) |
#[derive(Debug, Clone)]
pub struct ComposeArgs {
    pub file: PathBuf,
    pub action: ComposeAction,
    pub stop_grace: Option<u32>,
}

impl ToolInvocation for ComposeArgs {
    fn program(&self) -> &'static str {
        "docker"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "compose".to_string(),
            "-f".to_string(),
            self.file.display().to_string(),
        ];
        match self.action {
            ComposeAction::Stop => {
                args.push("stop".to_string());
                if let Some(secs) = self.stop_grace {
                    args.push("--timeout".to_string());
                    args.push(secs.to_string());
                }
            }
            ComposeAction::Up => {
                args.extend(["up", "-d", "--wait"].map(String::from));
            }
        }
        args
    }

    fn working_dir(&self) -> Option<&Path> {
        self.file.parent()
    }
}

/// [`WorkloadController`] over Docker Compose projects
pub struct ComposeController {
    runner: Arc<dyn CommandRunner>,
    services_dir: PathBuf,
    files: BTreeMap<GroupName, PathBuf>,
    stop_grace: Option<u32>,
    stop_timeout: Option<Duration>,
    start_timeout: Option<Duration>,
}

impl ComposeController {
    pub fn new(runner: Arc<dyn CommandRunner>, services_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            services_dir: services_dir.into(),
            files: BTreeMap::new(),
            stop_grace: None,
            stop_timeout: None,
            start_timeout: None,
        }
    }

    /// Use an explicit compose file for one group
    pub fn with_file(mut self, group: GroupName, file: impl Into<PathBuf>) -> Self {
        self.files.insert(group, file.into());
        self
    }

    /// Seconds containers get to exit before Docker kills them
    pub fn with_stop_grace(mut self, secs: Option<u32>) -> Self {
        self.stop_grace = secs;
        self
    }

    pub fn with_timeouts(mut self, stop: Option<Duration>, start: Option<Duration>) -> Self {
        self.stop_timeout = stop;
        self.start_timeout = start;
        self
    }

    /// Compose file for a group
    pub fn compose_file(&self, group: &GroupName) -> PathBuf {
        self.files.get(group).cloned().unwrap_or_else(|| {
            self.services_dir
                .join(group.as_str())
                .join(DEFAULT_COMPOSE_FILE)
        })
    }

    fn run(&self, group: &GroupName, action: ComposeAction) -> Result<(), BackendError> {
        let file = self.compose_file(group);
        if !file.is_file() {
            return Err(BackendError::NotFound(format!(
                "compose file for group '{}' at {}",
                group,
                file.display()
            )));
        }

        let timeout = match action {
            ComposeAction::Stop => self.stop_timeout,
            ComposeAction::Up => self.start_timeout,
        };
        let args = ComposeArgs {
            file,
            action,
            stop_grace: self.stop_grace,
        };
        run_checked(self.runner.as_ref(), &args, timeout)?;
        Ok(())
    }
}

impl WorkloadController for ComposeController {
    /// Stops groups in order and returns at the first failure
    fn stop(&self, groups: &BTreeSet<GroupName>) -> Result<(), BackendError> {
        for group in groups {
            self.run(group, ComposeAction::Stop)?;
            info!(group = %group, "workload group stopped");
        }
        Ok(())
    }

    /// Attempts every group even if one fails
    fn start(&self, groups: &BTreeSet<GroupName>) -> Result<(), BackendError> {
        let mut failures = Vec::new();
        for group in groups {
            match self.run(group, ComposeAction::Up) {
                Ok(()) => info!(group = %group, "workload group started"),
                Err(e) => {
                    error!(group = %group, error = %e, "failed to start workload group");
                    failures.push((group, e));
                }
            }
        }

        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0).1),
            _ => Err(BackendError::unexpected(
                failures
                    .iter()
                    .map(|(group, e)| format!("{}: {}", group, e))
                    .collect::<Vec<_>>()
                    .join("; "),
            )),
        }
    }
}
