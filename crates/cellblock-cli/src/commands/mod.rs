//! CLI command definitions and dispatch.

pub mod check;
pub mod run;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use cellblock_common::config::LauncherSettings;
use clap::{Parser, Subcommand};

/// cellblock — single-container launcher.
#[derive(Parser, Debug)]
#[command(name = "cellblock", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Launcher settings file (JSON).
    #[arg(long, global = true, env = "CELLBLOCK_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a container and wait for its program to exit.
    Run(run::RunArgs),
    /// Validate a container description without starting anything.
    Check(check::CheckArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the settings cannot be loaded or the command fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let settings = match &cli.settings {
        Some(path) => LauncherSettings::load(path)
            .with_context(|| format!("failed to load settings {}", path.display()))?,
        None => LauncherSettings::default(),
    };
    match cli.command {
        Command::Run(args) => run::execute(args, &settings),
        Command::Check(args) => check::execute(&args, &settings),
    }
}
