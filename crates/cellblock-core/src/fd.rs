//! File descriptor hygiene for the sandboxed child.

use std::os::fd::RawFd;

use cellblock_common::error::{CellblockError, Result};
use nix::errno::Errno;

const FD_DIR: &str = "/proc/self/fd";

/// Lists the open descriptors of the calling process.
///
/// # Errors
///
/// Returns an error if `/proc/self/fd` cannot be read.
pub fn open_fds() -> Result<Vec<RawFd>> {
    let entries = std::fs::read_dir(FD_DIR).map_err(|e| CellblockError::Io {
        path: FD_DIR.into(),
        source: e,
    })?;
    Ok(entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .collect())
}

/// Closes every descriptor above stderr that is not in `keep`.
///
/// # Errors
///
/// Returns an error if the open descriptors cannot be listed.
pub fn close_all_except(keep: &[RawFd]) -> Result<()> {
    for fd in open_fds()? {
        if fd > 2 && !keep.contains(&fd) {
            // The directory handle used for listing is already closed, so
            // EBADF here is expected for its number.
            match nix::unistd::close(fd) {
                Ok(()) | Err(Errno::EBADF) => {}
                Err(e) => return Err(CellblockError::sys(format!("close fd {fd}"), e)),
            }
        }
    }
    Ok(())
}

/// Clears `FD_CLOEXEC` so `fd` survives `execve(2)`.
///
/// # Errors
///
/// Returns the `fcntl(2)` error.
pub fn clear_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: F_GETFD/F_SETFD only touch the descriptor flags of `fd`.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(CellblockError::sys(format!("F_GETFD {fd}"), Errno::last()));
    }
    // SAFETY: as above.
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
    if ret < 0 {
        return Err(CellblockError::sys(format!("F_SETFD {fd}"), Errno::last()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::*;

    #[test]
    fn lists_stdio() {
        let fds = open_fds().unwrap();
        assert!(fds.contains(&0) || fds.contains(&1) || fds.contains(&2));
    }

    #[test]
    fn clears_cloexec_flag() {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        clear_cloexec(fd).unwrap();
        // SAFETY: `fd` is owned by `file`, which is still open.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0);
    }
}
