//! Adapters that map the collaborator traits onto real command-line tools.
//!
//! - [`zfs`]: `VolumeStore` over `zfs snapshot` / `zfs destroy` / `zfs list`
//! - [`compose`]: `WorkloadController` over `docker compose stop` / `up`
//! - [`borg`]: `BackupRepository` over `borg init` / `create` / `prune`-style
//!   delete / `check` / `key export`
//!
//! Each tool's invocations are typed argument structs implementing
//! [`ToolInvocation`](crate::command_runner::ToolInvocation), so the flag
//! mapping lives in exactly one place and is unit-tested.

pub mod borg;
pub mod compose;
pub mod zfs;

use std::time::Duration;

use crate::command_runner::{CommandRunner, ToolInvocation, ToolOutput};
use crate::error::BackendError;

/// Run a command and turn a non-zero exit into an error
pub(crate) fn run_checked(
    runner: &dyn CommandRunner,
    invocation: &dyn ToolInvocation,
    timeout: Option<Duration>,
) -> Result<ToolOutput, BackendError> {
    let output = runner.run(invocation, timeout)?;
    output.ensure_success()?;
    Ok(output)
}
