//! # cellblock
//!
//! Launches a single container from a JSON description: builds its root,
//! cgroup, mounts, and device nodes, runs the program in fresh namespaces,
//! and removes everything again when it exits.

mod commands;
mod description;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::commands::Cli;

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    commands::execute(cli)
}
