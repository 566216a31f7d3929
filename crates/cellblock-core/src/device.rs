//! Device node creation inside a container root.

use std::path::{Path, PathBuf};

use cellblock_common::error::{CellblockError, Result};
use cellblock_common::types::DeviceType;
use nix::errno::Errno;

use crate::syscall::Syscall;

/// A fully resolved device node to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    /// Host path of the node, already joined onto the container root.
    pub path: PathBuf,
    /// Block or character device.
    pub kind: DeviceType,
    /// Permission bits.
    pub mode: u32,
    /// Major number.
    pub major: u32,
    /// Minor number.
    pub minor: u32,
    /// Owner on the host.
    pub uid: u32,
    /// Group on the host.
    pub gid: u32,
}

/// Creates `node`, then sets its owner and mode.
///
/// An existing node at the path is reused.
///
/// # Errors
///
/// Returns an error if `mknod`, `chown`, or `chmod` fails.
pub fn create_node(sys: &dyn Syscall, node: &DeviceNode) -> Result<()> {
    match sys.mknod(&node.path, node.kind, node.mode, node.major, node.minor) {
        Ok(()) => {}
        Err(e) if e.errno() == Some(Errno::EEXIST) => {
            tracing::debug!(path = %node.path.display(), "device node already exists");
        }
        Err(e) => return Err(e),
    }
    sys.chown(&node.path, node.uid, node.gid)?;
    sys.chmod(&node.path, node.mode)?;
    tracing::debug!(
        path = %node.path.display(),
        kind = %node.kind,
        major = node.major,
        minor = node.minor,
        "device node created"
    );
    Ok(())
}

/// Minor number of the host device node at `path`, if it exists and is a
/// device.
pub fn host_minor(path: &Path) -> Option<u32> {
    let stat = nix::sys::stat::stat(path).ok()?;
    let kind = stat.st_mode & libc::S_IFMT;
    if kind != libc::S_IFCHR && kind != libc::S_IFBLK {
        return None;
    }
    u32::try_from(nix::sys::stat::minor(stat.st_rdev)).ok()
}

/// Major and minor numbers of the device node at `path`.
///
/// # Errors
///
/// Returns an error if `path` cannot be stat'ed or is not a device node.
pub fn host_device_numbers(path: &Path) -> Result<(u32, u32)> {
    let stat = nix::sys::stat::stat(path)
        .map_err(|e| CellblockError::sys(format!("stat {}", path.display()), e))?;
    let kind = stat.st_mode & libc::S_IFMT;
    if kind != libc::S_IFCHR && kind != libc::S_IFBLK {
        return Err(CellblockError::config(format!(
            "{} is not a device node",
            path.display()
        )));
    }
    let number = |n: u64| {
        u32::try_from(n).map_err(|_| {
            CellblockError::config(format!("device number of {} out of range", path.display()))
        })
    };
    Ok((
        number(nix::sys::stat::major(stat.st_rdev))?,
        number(nix::sys::stat::minor(stat.st_rdev))?,
    ))
}
