//! The sandboxed child, from `clone(2)` to `execve(2)`.
//!
//! Nothing here logs or returns errors to a caller: a failing step writes
//! its errno to the error pipe and the child exits. Everything the child
//! needs is prepared by the parent before the clone.

use std::convert::Infallible;
use std::ffi::CString;
use std::os::fd::RawFd;
use std::path::Path;

use cellblock_common::error::{CellblockError, Result};
use cellblock_core::filesystem::mount::{needs_remount, resolve_in_root};
use cellblock_core::filesystem::pivot_root::pivot_root;
use cellblock_core::{alt_syscall, capability, fd, rlimit};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Gid, Pid, Uid};

use crate::jail::JailPlan;
use crate::mounts::NsMount;

/// Path and argv of the program as C strings.
#[derive(Debug, Clone)]
pub struct ExecArgs {
    path: CString,
    argv: Vec<CString>,
}

impl ExecArgs {
    /// Converts `program` for `execv(3)`.
    ///
    /// # Errors
    ///
    /// Returns an error if `program` is empty or an argument contains a
    /// NUL byte.
    pub fn new(program: &[String]) -> Result<Self> {
        let argv = program
            .iter()
            .map(|arg| {
                CString::new(arg.as_str()).map_err(|_| {
                    CellblockError::config(format!("argument \"{arg}\" contains a NUL byte"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let path = argv
            .first()
            .cloned()
            .ok_or_else(|| CellblockError::config("program must not be empty"))?;
        Ok(Self { path, argv })
    }
}

/// Pipe ends inherited by the child. The peers are the parent's ends.
#[derive(Debug, Clone, Copy)]
pub struct ChildFds {
    /// Read end of the start signal.
    pub ready: RawFd,
    /// Write end of the start signal.
    pub ready_peer: RawFd,
    /// Write end of the error pipe; close-on-exec.
    pub error: RawFd,
    /// Read end of the error pipe.
    pub error_peer: RawFd,
}

/// Entry point of the cloned child. Only returns on failure.
pub fn child_main(plan: &JailPlan, exec: &ExecArgs, fds: ChildFds) -> isize {
    let _ = nix::unistd::close(fds.ready_peer);
    let _ = nix::unistd::close(fds.error_peer);

    let Err(err) = wait_for_parent(fds.ready).and_then(|()| enter(plan, exec, fds.error)) else {
        return 0;
    };
    report(fds.error, errno_of(&err));
    1
}

fn wait_for_parent(ready: RawFd) -> Result<()> {
    let mut byte = 0u8;
    loop {
        // SAFETY: `ready` is an open pipe end and `byte` is a valid
        // one-byte buffer.
        let n = unsafe { libc::read(ready, (&raw mut byte).cast(), 1) };
        match n {
            1 => break,
            0 => return Err(CellblockError::sys("wait for parent", Errno::EPIPE)),
            _ if Errno::last() == Errno::EINTR => {}
            _ => return Err(CellblockError::sys("wait for parent", Errno::last())),
        }
    }
    let _ = nix::unistd::close(ready);
    Ok(())
}

fn enter(plan: &JailPlan, exec: &ExecArgs, error_fd: RawFd) -> Result<()> {
    for &fd in &plan.inherited_fds {
        fd::clear_cloexec(fd)?;
    }
    if !plan.keep_fds_open {
        let mut keep = plan.inherited_fds.clone();
        keep.push(error_fd);
        fd::close_all_except(&keep)?;
    }

    if plan.namespaces.mount {
        nix::mount::mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_SLAVE,
            None::<&str>,
        )
        .map_err(|e| CellblockError::sys("make / a slave mount", e))?;
        for mount in &plan.mounts {
            mount_in_namespace(&plan.root, mount)?;
        }
        pivot_root(&plan.root)?;
    }

    if plan.capabilities.is_some() && (plan.uid > 0 || plan.gid > 0) {
        capability::set_keep_caps()?;
    }
    if plan.gid > 0 {
        let gid = Gid::from_raw(plan.gid);
        nix::unistd::setresgid(gid, gid, gid).map_err(|e| CellblockError::sys("setresgid", e))?;
    }
    if plan.uid > 0 {
        let uid = Uid::from_raw(plan.uid);
        nix::unistd::setresuid(uid, uid, uid).map_err(|e| CellblockError::sys("setresuid", e))?;
    }

    if let Some(table) = &plan.alt_syscall_table {
        alt_syscall::use_table(table)?;
    }
    rlimit::apply(&plan.rlimits)?;
    if let Some(policy) = &plan.capabilities {
        capability::apply(policy)?;
    }

    if !plan.run_as_init {
        become_init(error_fd)?;
    }

    for hook in &plan.pre_exec {
        hook().map_err(|e| {
            CellblockError::sys(
                "pre-exec hook",
                e.raw_os_error().map_or(Errno::EINVAL, Errno::from_raw),
            )
        })?;
    }

    let Err(e) = execv(exec);
    Err(e)
}

fn mount_in_namespace(root: &Path, mount: &NsMount) -> Result<()> {
    let target = resolve_in_root(root, &mount.destination);
    let sys_err = |e| CellblockError::sys(format!("mount {}", mount.destination.display()), e);
    nix::mount::mount(
        Some(mount.source.as_path()),
        &target,
        mount.fstype.as_deref(),
        mount.flags,
        mount.data.as_deref(),
    )
    .map_err(sys_err)?;
    if needs_remount(mount.flags) {
        nix::mount::mount(
            Some(mount.source.as_path()),
            &target,
            None::<&str>,
            mount.flags | MsFlags::MS_REMOUNT,
            mount.data.as_deref(),
        )
        .map_err(|e| {
            let _ = nix::mount::umount2(&target, MntFlags::MNT_DETACH);
            sys_err(e)
        })?;
    }
    Ok(())
}

/// Forks the program off a minimal PID 1 that reaps everything and exits
/// with the program's status. Returns in the program's process only.
fn become_init(error_fd: RawFd) -> Result<()> {
    // SAFETY: the child is single-threaded at this point; the forked
    // process only continues with async-signal-safe setup before exec.
    let program = match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Child) => return Ok(()),
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => return Err(CellblockError::sys("fork init", e)),
    };
    let _ = nix::unistd::close(error_fd);

    let mut status = 0;
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(pid, code)) if pid == program => status = code,
            Ok(WaitStatus::Signaled(pid, signal, _)) if pid == program => {
                status = 128 + signal as i32;
            }
            Err(Errno::ECHILD) => break,
            Ok(_) | Err(_) => {}
        }
    }
    // SAFETY: `_exit` ends the init without running the launcher's exit
    // handlers in this copy of its address space.
    unsafe { libc::_exit(status) }
}

fn execv(exec: &ExecArgs) -> std::result::Result<Infallible, CellblockError> {
    nix::unistd::execv(&exec.path, &exec.argv)
        .map_err(|e| CellblockError::sys(format!("execv {}", exec.path.to_string_lossy()), e))
}

fn errno_of(err: &CellblockError) -> i32 {
    err.errno().unwrap_or(Errno::EINVAL) as i32
}

fn report(error_fd: RawFd, errno: i32) {
    let bytes = errno.to_ne_bytes();
    // SAFETY: `error_fd` is the child's end of the error pipe and `bytes`
    // outlives the call.
    let _ = unsafe { libc::write(error_fd, bytes.as_ptr().cast(), bytes.len()) };
}
