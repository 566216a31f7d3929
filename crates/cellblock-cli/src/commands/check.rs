//! `cellblock check` — validate a container description.

use std::path::PathBuf;
use std::process::ExitCode;

use cellblock_common::config::LauncherSettings;
use clap::Args;

use crate::description::ContainerDescription;

/// Arguments for the `check` command.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Path to the JSON container description.
    pub description: PathBuf,
}

/// Executes the `check` command.
///
/// # Errors
///
/// Returns an error if the description cannot be loaded or is rejected.
pub fn execute(args: &CheckArgs, settings: &LauncherSettings) -> anyhow::Result<ExitCode> {
    let description = ContainerDescription::load(&args.description)?;
    let config = description.to_config(settings.cgroup_parent.as_deref())?;
    tracing::info!(
        description = %args.description.display(),
        program = ?config.program(),
        mounts = config.mounts().len(),
        devices = config.devices().len(),
        "description is valid"
    );
    Ok(ExitCode::SUCCESS)
}
