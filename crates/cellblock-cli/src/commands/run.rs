//! `cellblock run` — start a container and wait for it.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use cellblock_common::config::LauncherSettings;
use cellblock_runtime::container::{Backends, Container};
use clap::Args;
use nix::sys::signal::{Signal, kill};

use crate::description::ContainerDescription;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the JSON container description.
    pub description: PathBuf,

    /// Container name; also the cgroup name.
    #[arg(short, long, default_value = "container")]
    pub name: String,

    /// Directory the run directory is created in; overrides the settings.
    #[arg(long)]
    pub run_dir: Option<PathBuf>,
}

/// Executes the `run` command.
///
/// Ctrl-C kills the program; the container is torn down either way and
/// the command exits with the program's status.
///
/// # Errors
///
/// Returns an error if the description is invalid, the container fails
/// to start, or waiting for it fails.
pub fn execute(args: RunArgs, settings: &LauncherSettings) -> anyhow::Result<ExitCode> {
    let description = ContainerDescription::load(&args.description)?;
    let config = description.to_config(settings.cgroup_parent.as_deref())?;

    let run_dir = args.run_dir.unwrap_or_else(|| settings.run_dir.clone());
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create {}", run_dir.display()))?;

    let backends = Backends::linux().with_cgroup_root(&settings.cgroup_root);
    let mut container = Container::with_backends(&args.name, &run_dir, backends)?;
    container
        .start(&config)
        .with_context(|| format!("failed to start container {}", args.name))?;

    if let Some(pid) = container.pid() {
        ctrlc::set_handler(move || {
            if let Err(e) = kill(pid, Signal::SIGKILL) {
                tracing::warn!(%pid, error = %e, "failed to kill container");
            }
        })
        .context("failed to set Ctrl+C handler")?;
    }

    let exit = container.wait()?;
    tracing::info!(name = %args.name, %exit, "container finished");
    Ok(ExitCode::from(u8::try_from(exit.code()).unwrap_or(u8::MAX)))
}
