//! Injectable kernel operations.
//!
//! Everything the launcher does to the host's mount table, device nodes,
//! loop devices, and file ownership goes through [`Syscall`]. Production
//! code uses [`LinuxSyscall`]; tests substitute a recording fake so the
//! orchestration logic can run without privileges.

use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use cellblock_common::error::{CellblockError, Result};
use cellblock_common::types::DeviceType;
use nix::mount::{MntFlags, MsFlags};
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::{Gid, Uid};

use crate::filesystem::loopdev;

/// Host-mutating operations used while building a container.
pub trait Syscall: fmt::Debug + Send + Sync {
    /// Mounts `source` at `target`.
    ///
    /// # Errors
    ///
    /// Returns the kernel error from `mount(2)`.
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()>;

    /// Unmounts `target`.
    ///
    /// # Errors
    ///
    /// Returns the kernel error from `umount2(2)`.
    fn umount(&self, target: &Path, flags: MntFlags) -> Result<()>;

    /// Creates a device node.
    ///
    /// # Errors
    ///
    /// Returns the kernel error from `mknod(2)`; `EEXIST` is reported as-is.
    fn mknod(&self, path: &Path, kind: DeviceType, mode: u32, major: u32, minor: u32)
    -> Result<()>;

    /// Changes the owner of `path`.
    ///
    /// # Errors
    ///
    /// Returns the kernel error from `chown(2)`.
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<()>;

    /// Changes the permission bits of `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the permissions cannot be changed.
    fn chmod(&self, path: &Path, mode: u32) -> Result<()>;

    /// Attaches `backing` to a free loop device and returns the device path.
    ///
    /// # Errors
    ///
    /// Returns an error if no loop device could be bound.
    fn attach_loop(&self, backing: &Path) -> Result<PathBuf>;

    /// Detaches a loop device previously returned by [`Syscall::attach_loop`].
    ///
    /// # Errors
    ///
    /// Returns the kernel error from `LOOP_CLR_FD`.
    fn detach_loop(&self, device: &Path) -> Result<()>;

    /// Whether the calling process runs with host root privileges.
    fn is_privileged(&self) -> bool;
}

/// [`Syscall`] implementation backed by the running kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxSyscall;

impl Syscall for LinuxSyscall {
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        nix::mount::mount(source, target, fstype, flags, data)
            .map_err(|e| CellblockError::sys(format!("mount {}", target.display()), e))?;
        tracing::debug!(
            source = ?source,
            target = %target.display(),
            fstype = ?fstype,
            flags = flags.bits(),
            "mounted"
        );
        Ok(())
    }

    fn umount(&self, target: &Path, flags: MntFlags) -> Result<()> {
        nix::mount::umount2(target, flags)
            .map_err(|e| CellblockError::sys(format!("umount {}", target.display()), e))
    }

    fn mknod(
        &self,
        path: &Path,
        kind: DeviceType,
        mode: u32,
        major: u32,
        minor: u32,
    ) -> Result<()> {
        let sflag = match kind {
            DeviceType::Block => SFlag::S_IFBLK,
            DeviceType::Char => SFlag::S_IFCHR,
            DeviceType::All => {
                return Err(CellblockError::config(format!(
                    "cannot create node {} of type 'a'",
                    path.display()
                )));
            }
        };
        let dev = nix::sys::stat::makedev(u64::from(major), u64::from(minor));
        nix::sys::stat::mknod(path, sflag, Mode::from_bits_truncate(mode), dev)
            .map_err(|e| CellblockError::sys(format!("mknod {}", path.display()), e))
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        nix::unistd::chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
            .map_err(|e| CellblockError::sys(format!("chown {}", path.display()), e))
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
            CellblockError::Io {
                path: path.to_path_buf(),
                source: e,
            }
        })
    }

    fn attach_loop(&self, backing: &Path) -> Result<PathBuf> {
        loopdev::attach(backing)
    }

    fn detach_loop(&self, device: &Path) -> Result<()> {
        loopdev::detach(device)
    }

    fn is_privileged(&self) -> bool {
        Uid::effective().is_root()
    }
}
