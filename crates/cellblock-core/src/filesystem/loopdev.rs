//! Loop devices for image-backed mounts.
//!
//! A free device is requested from `/dev/loop-control` and bound to the
//! backing file with `LOOP_SET_FD`. Another process can claim the same
//! free device between the two calls, in which case binding fails with
//! `EBUSY` and a new device is requested.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use cellblock_common::constants::{LOOP_CONTROL_PATH, LOOP_DEVICE_PREFIX};
use cellblock_common::error::{CellblockError, Result};
use nix::errno::Errno;

const LOOP_SET_FD: u32 = 0x4C00;
const LOOP_CLR_FD: u32 = 0x4C01;
const LOOP_CTL_GET_FREE: u32 = 0x4C82;

/// Upper bound on `EBUSY` retries before giving up.
const MAX_ATTACH_ATTEMPTS: usize = 16;

nix::ioctl_none_bad!(
    /// Returns the number of a free loop device.
    loop_ctl_get_free,
    LOOP_CTL_GET_FREE
);
nix::ioctl_write_int_bad!(
    /// Binds the loop device to the file descriptor argument.
    loop_set_fd,
    LOOP_SET_FD
);
nix::ioctl_none_bad!(
    /// Unbinds the loop device from its backing file.
    loop_clr_fd,
    LOOP_CLR_FD
);

/// Binds `backing` to a free loop device and returns its path.
///
/// # Errors
///
/// Returns an error if the backing file or loop control node cannot be
/// opened, or if no device could be bound.
pub fn attach(backing: &Path) -> Result<PathBuf> {
    let backing_file = open(backing, false)?;
    let control = open(Path::new(LOOP_CONTROL_PATH), true)?;

    for _ in 0..MAX_ATTACH_ATTEMPTS {
        // SAFETY: `control` is an open loop-control descriptor; the ioctl
        // takes no argument.
        let num = unsafe { loop_ctl_get_free(control.as_raw_fd()) }
            .map_err(|e| CellblockError::sys("LOOP_CTL_GET_FREE", e))?;
        let device = PathBuf::from(format!("{LOOP_DEVICE_PREFIX}{num}"));
        let loop_file = open(&device, false)?;

        // SAFETY: both descriptors are open for the duration of the call;
        // the argument is passed by value.
        match unsafe { loop_set_fd(loop_file.as_raw_fd(), backing_file.as_raw_fd()) } {
            Ok(_) => {
                tracing::info!(
                    device = %device.display(),
                    backing = %backing.display(),
                    "loop device attached"
                );
                return Ok(device);
            }
            Err(Errno::EBUSY) => {
                tracing::debug!(device = %device.display(), "loop device taken, retrying");
            }
            Err(e) => {
                return Err(CellblockError::sys(
                    format!("LOOP_SET_FD {}", device.display()),
                    e,
                ));
            }
        }
    }
    Err(CellblockError::sys("attach loop device", Errno::EBUSY))
}

/// Unbinds the loop device at `device`.
///
/// # Errors
///
/// Returns an error if the device cannot be opened or `LOOP_CLR_FD` fails.
pub fn detach(device: &Path) -> Result<()> {
    let file = open(device, false)?;
    // SAFETY: `file` is an open loop device descriptor; the ioctl takes no
    // argument.
    let _ = unsafe { loop_clr_fd(file.as_raw_fd()) }
        .map_err(|e| CellblockError::sys(format!("LOOP_CLR_FD {}", device.display()), e))?;
    tracing::info!(device = %device.display(), "loop device detached");
    Ok(())
}

fn open(path: &Path, write: bool) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(write)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
        .map_err(|e| CellblockError::Io {
            path: path.to_path_buf(),
            source: e,
        })
}
