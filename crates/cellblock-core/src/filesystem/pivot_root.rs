//! Secure root filesystem switching via `pivot_root(2)`.
//!
//! More secure than `chroot` because it actually changes the root mount
//! point rather than just the process's view of `/`. Uses the
//! `pivot_root(".", ".")` idiom, which stacks the old root on top of the
//! new one so it can be lazily detached without a scratch directory.

use std::path::Path;

use cellblock_common::error::{CellblockError, Result};
use nix::mount::MntFlags;

/// Makes `new_root` the root of the calling process's mount namespace and
/// detaches the old root.
///
/// `new_root` must be a mount point. Runs in the sandboxed child, so it
/// does not log.
///
/// # Errors
///
/// Returns an error if any of `chdir`, `pivot_root`, or `umount2` fails.
pub fn pivot_root(new_root: &Path) -> Result<()> {
    nix::unistd::chdir(new_root)
        .map_err(|e| CellblockError::sys(format!("chdir {}", new_root.display()), e))?;
    nix::unistd::pivot_root(".", ".").map_err(|e| CellblockError::sys("pivot_root", e))?;
    nix::mount::umount2(".", MntFlags::MNT_DETACH)
        .map_err(|e| CellblockError::sys("umount old root", e))?;
    nix::unistd::chdir("/").map_err(|e| CellblockError::sys("chdir /", e))
}
