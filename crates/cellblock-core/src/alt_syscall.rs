//! Alternate syscall tables.
//!
//! Chrome OS kernels can switch a process to a named, restricted syscall
//! table. The switch is inherited across `execve(2)` and cannot be undone.

use std::ffi::CString;

use cellblock_common::error::{CellblockError, Result};
use nix::errno::Errno;

const PR_ALT_SYSCALL: libc::c_int = 0x4372_4f53;
const PR_ALT_SYSCALL_SET_SYSCALL_TABLE: libc::c_ulong = 1;

/// Switches the calling process to the syscall table called `name`.
///
/// # Errors
///
/// Returns an error if the name contains a NUL byte or the kernel does
/// not support the table.
pub fn use_table(name: &str) -> Result<()> {
    let table = CString::new(name)
        .map_err(|_| CellblockError::config(format!("invalid syscall table name \"{name}\"")))?;
    // SAFETY: `table` is a valid NUL-terminated string that outlives the
    // call; the kernel only reads it.
    let ret = unsafe {
        libc::prctl(
            PR_ALT_SYSCALL,
            PR_ALT_SYSCALL_SET_SYSCALL_TABLE,
            table.as_ptr(),
            0,
            0,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(CellblockError::sys(
            format!("set syscall table {name}"),
            Errno::last(),
        ))
    }
}
