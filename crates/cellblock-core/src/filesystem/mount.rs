//! Mount utilities for container filesystem setup.
//!
//! The kernel ignores most per-mount flags on the initial `MS_BIND` call,
//! so bind mounts that carry them are followed by an `MS_REMOUNT`.

use std::fs::{DirBuilder, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Component, Path, PathBuf};

use cellblock_common::error::{CellblockError, Result};
use nix::mount::{MntFlags, MsFlags};

use crate::syscall::Syscall;

/// Flags that only take effect on a bind mount through a remount.
const BIND_REMOUNT_FLAGS: MsFlags = MsFlags::MS_RDONLY
    .union(MsFlags::MS_NOSUID)
    .union(MsFlags::MS_NODEV)
    .union(MsFlags::MS_NOEXEC);

/// Whether a mount with `flags` must be followed by an `MS_REMOUNT` for
/// all of its flags to apply.
pub const fn needs_remount(flags: MsFlags) -> bool {
    flags.contains(MsFlags::MS_BIND) && flags.intersects(BIND_REMOUNT_FLAGS)
}

/// Joins `path`, interpreted inside the container, onto the host path of
/// the container root.
///
/// Absolute paths are re-rooted rather than replacing `root`.
pub fn resolve_in_root(root: &Path, path: &Path) -> PathBuf {
    let relative: PathBuf = path
        .components()
        .filter(|c| matches!(c, Component::Normal(_) | Component::ParentDir))
        .collect();
    root.join(relative)
}

/// Performs a mount, following bind mounts with a remount when they carry
/// flags the initial bind would drop.
///
/// # Errors
///
/// Returns the error of the failing `mount(2)` call. If the remount
/// fails, the bind is unmounted again before returning.
pub fn mount_with_remount(
    sys: &dyn Syscall,
    source: Option<&Path>,
    target: &Path,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    sys.mount(source, target, fstype, flags, data)?;
    if needs_remount(flags) {
        sys.mount(source, target, None, flags | MsFlags::MS_REMOUNT, data)
            .map_err(|e| undo_bind(sys, target, e))?;
    }
    Ok(())
}

/// Bind-mounts the container rootfs onto `target`.
///
/// `flags` are the rootfs mount flags; when non-empty they are applied by
/// a remount without `MS_REC`.
///
/// # Errors
///
/// Returns the error of the failing `mount(2)` call. If the remount
/// fails, the bind is unmounted again before returning.
pub fn bind_rootfs(sys: &dyn Syscall, rootfs: &Path, target: &Path, flags: MsFlags) -> Result<()> {
    let bind = MsFlags::MS_BIND | (flags & MsFlags::MS_REC);
    sys.mount(Some(rootfs), target, None, bind, None)?;
    if !flags.is_empty() {
        let remount = (flags | MsFlags::MS_BIND | MsFlags::MS_REMOUNT) - MsFlags::MS_REC;
        sys.mount(None, target, None, remount, None)
            .map_err(|e| undo_bind(sys, target, e))?;
    }
    tracing::debug!(
        rootfs = %rootfs.display(),
        target = %target.display(),
        "rootfs bound"
    );
    Ok(())
}

/// Detaches a bind whose follow-up remount failed; returns the remount error.
fn undo_bind(sys: &dyn Syscall, target: &Path, err: CellblockError) -> CellblockError {
    if let Err(e) = sys.umount(target, MntFlags::MNT_DETACH) {
        tracing::warn!(
            target = %target.display(),
            error = %e,
            "failed to unmount bind after remount failure"
        );
    }
    err
}

/// Creates a mount destination that does not exist yet.
///
/// The destination becomes a directory when the source is missing, a
/// directory, or a block device (which is mounted as a filesystem), and
/// an empty file otherwise. The new entry gets `mode` and is owned by
/// `uid`/`gid`. Existing destinations are left untouched.
///
/// # Errors
///
/// Returns an error if the entry cannot be created or re-owned.
pub fn create_destination(
    sys: &dyn Syscall,
    dest: &Path,
    source: Option<&Path>,
    uid: u32,
    gid: u32,
    mode: u32,
) -> Result<()> {
    if dest.symlink_metadata().is_ok() {
        return Ok(());
    }
    let wants_dir = source
        .and_then(|s| std::fs::metadata(s).ok())
        .is_none_or(|meta| {
            use std::os::unix::fs::FileTypeExt;
            meta.is_dir() || meta.file_type().is_block_device()
        });

    if wants_dir {
        make_dir(dest, mode)?;
    } else {
        touch_file(dest, mode)?;
    }
    sys.chmod(dest, mode)?;
    sys.chown(dest, uid, gid)?;
    tracing::debug!(path = %dest.display(), dir = wants_dir, "mount destination created");
    Ok(())
}

/// Creates `path` and any missing parents with `mode`.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn make_dir(path: &Path, mode: u32) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .map_err(|e| CellblockError::Io {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Creates an empty file at `path` with `mode`.
///
/// # Errors
///
/// Returns an error if the file cannot be created.
pub fn touch_file(path: &Path, mode: u32) -> Result<()> {
    let _file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(mode)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
        .map_err(|e| CellblockError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
    Ok(())
}
