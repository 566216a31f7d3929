//! SELinux relabelling of host-side mounts.
//!
//! Mounts performed from the host are not labelled by the container's
//! policy. When a `setfiles` binary is configured it is run over every
//! writable external mount with the container root as its alternate root.

use std::path::{Path, PathBuf};
use std::process::Command;

use cellblock_common::error::{CellblockError, Result};
use cellblock_core::filesystem::mount::resolve_in_root;
use nix::errno::Errno;
use nix::mount::MsFlags;

use crate::config::Config;

/// Mount points that are never relabelled.
const SKIPPED_DESTINATIONS: [&str; 2] = ["/data", "/cache"];

/// Host paths `setfiles` must relabel for `config` under `root`.
///
/// In-namespace mounts, read-only mounts, and the data and cache
/// partitions are left alone.
pub fn destinations(config: &Config, root: &Path) -> Vec<PathBuf> {
    config
        .mounts()
        .iter()
        .filter(|m| !m.mount_in_ns && !m.flags.contains(MsFlags::MS_RDONLY))
        .filter(|m| !SKIPPED_DESTINATIONS.iter().any(|d| m.destination == Path::new(d)))
        .map(|m| resolve_in_root(root, &m.destination))
        .collect()
}

/// Runs `command -r <root> <root>/file_contexts <destinations...>` with an
/// empty environment and waits for it.
///
/// # Errors
///
/// Returns an error if the command cannot be spawned or exits unsuccessfully.
pub fn run(command: &Path, root: &Path, destinations: &[PathBuf]) -> Result<()> {
    let status = Command::new(command)
        .env_clear()
        .arg("-r")
        .arg(root)
        .arg(root.join("file_contexts"))
        .args(destinations)
        .status()
        .map_err(|e| CellblockError::Io {
            path: command.to_path_buf(),
            source: e,
        })?;
    if !status.success() {
        return Err(CellblockError::sys(
            format!("{} ({status})", command.display()),
            Errno::EIO,
        ));
    }
    tracing::info!(
        command = %command.display(),
        paths = destinations.len(),
        "relabelled external mounts"
    );
    Ok(())
}
