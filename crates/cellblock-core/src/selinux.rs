//! SELinux exec contexts.

use std::path::PathBuf;

use cellblock_common::error::{CellblockError, Result};

/// Sets the SELinux context the calling thread's next `execve(2)` runs in.
///
/// # Errors
///
/// Returns an error if the thread's `attr/exec` file cannot be written,
/// which includes kernels without SELinux.
pub fn set_exec_context(context: &str) -> Result<()> {
    let path = PathBuf::from(format!(
        "/proc/self/task/{}/attr/exec",
        nix::unistd::gettid()
    ));
    std::fs::write(&path, context).map_err(|e| CellblockError::Io { path, source: e })
}
