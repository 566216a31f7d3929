//! Sandbox entry: namespaces, ID maps, and the sandboxed child.
//!
//! [`NamespaceJail`] clones the child straight into fresh namespaces. The
//! child blocks on a pipe until the parent has written its UID/GID maps and
//! cgroup membership, then sets itself up (see [`crate::process`]) and
//! execs the program. A second, close-on-exec pipe carries the errno of a
//! failed setup step back to the parent; EOF on it means the exec
//! succeeded.

use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cellblock_common::error::{CellblockError, Result};
use cellblock_core::capability::CapabilityPolicy;
use cellblock_core::namespace::NamespaceConfig;
use cellblock_core::namespace::user::{IdMap, write_id_maps};
use cellblock_core::rlimit::Rlimit;
use cellblock_core::selinux;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::config::{Config, PreExecHook};
use crate::mounts::NsMount;
use crate::process::{self, ChildFds, ExecArgs};

const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Everything the sandbox needs to start the program.
#[derive(Clone)]
pub struct JailPlan {
    /// Host path of the directory to pivot into.
    pub root: PathBuf,
    /// Argv of the program; `program[0]` is its path inside the root.
    pub program: Vec<String>,
    /// Namespaces to create.
    pub namespaces: NamespaceConfig,
    /// UID map of the user namespace.
    pub uid_map: IdMap,
    /// GID map of the user namespace.
    pub gid_map: IdMap,
    /// Deny `setgroups` before writing the GID map.
    pub deny_setgroups: bool,
    /// UID to switch to inside the container; 0 keeps root.
    pub uid: u32,
    /// GID to switch to inside the container; 0 keeps root.
    pub gid: u32,
    /// Mounts performed inside the new mount namespace, in order.
    pub mounts: Vec<NsMount>,
    /// Cgroup `tasks` files the child is added to.
    pub cgroup_tasks: Vec<PathBuf>,
    /// Alternate syscall table.
    pub alt_syscall_table: Option<String>,
    /// Resource limits.
    pub rlimits: Vec<Rlimit>,
    /// Capability restriction, if any.
    pub capabilities: Option<CapabilityPolicy>,
    /// Leave the launcher's descriptors open.
    pub keep_fds_open: bool,
    /// Descriptors preserved across exec.
    pub inherited_fds: Vec<RawFd>,
    /// Actions run right before exec, in order.
    pub pre_exec: Vec<PreExecHook>,
    /// The program is PID 1 itself rather than a child of a minimal init.
    pub run_as_init: bool,
}

impl fmt::Debug for JailPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JailPlan")
            .field("root", &self.root)
            .field("program", &self.program)
            .field("namespaces", &self.namespaces)
            .field("uid_map", &self.uid_map.to_string())
            .field("gid_map", &self.gid_map.to_string())
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("mounts", &self.mounts)
            .field("cgroup_tasks", &self.cgroup_tasks)
            .field("capabilities", &self.capabilities)
            .field("pre_exec", &self.pre_exec.len())
            .field("run_as_init", &self.run_as_init)
            .finish_non_exhaustive()
    }
}

impl JailPlan {
    /// Builds the plan for `config` pivoting into `root`.
    ///
    /// The SELinux exec context, when set, becomes the first pre-exec
    /// action and the caller's hook the second. `privileged` launchers may
    /// keep `setgroups`; others must deny it before writing a GID map.
    pub fn from_config(
        config: &Config,
        root: &Path,
        mounts: Vec<NsMount>,
        cgroup_tasks: Vec<PathBuf>,
        privileged: bool,
    ) -> Self {
        let mut pre_exec: Vec<PreExecHook> = Vec::new();
        if let Some(context) = config.selinux_context() {
            let context = context.to_string();
            pre_exec.push(Arc::new(move || {
                selinux::set_exec_context(&context)
                    .map_err(|e| std::io::Error::from_raw_os_error(-e.code()))
            }));
        }
        if let Some(hook) = config.pre_execve_hook() {
            pre_exec.push(Arc::clone(hook));
        }

        Self {
            root: root.to_path_buf(),
            program: config.program().to_vec(),
            namespaces: NamespaceConfig::for_container(config.shares_host_netns()),
            uid_map: config.uid_map().clone(),
            gid_map: config.gid_map().clone(),
            deny_setgroups: !privileged,
            uid: config.uid(),
            gid: config.gid(),
            mounts,
            cgroup_tasks,
            alt_syscall_table: config.alt_syscall_table().map(str::to_string),
            rlimits: config.rlimits().to_vec(),
            capabilities: config.capmask().map(|cap| CapabilityPolicy {
                mask: cap.mask,
                ambient: cap.ambient,
                securebits_skip_mask: config.securebits_skip_mask(),
            }),
            keep_fds_open: config.keeps_fds_open(),
            inherited_fds: config.inherited_fds().to_vec(),
            pre_exec,
            run_as_init: config.run_as_init(),
        }
    }
}

/// How the sandboxed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    /// Exited normally with this status.
    Exited(i32),
    /// Killed by this signal.
    Signaled(Signal),
    /// Reaped elsewhere before it could be waited for.
    AlreadyReaped,
}

impl ExitState {
    /// Shell-style exit code: the status, or 128 plus the signal number.
    pub const fn code(self) -> i32 {
        match self {
            Self::Exited(status) => status,
            Self::Signaled(signal) => 128 + signal as i32,
            Self::AlreadyReaped => 0,
        }
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(status) => write!(f, "exited with status {status}"),
            Self::Signaled(signal) => write!(f, "killed by {signal}"),
            Self::AlreadyReaped => f.write_str("already reaped"),
        }
    }
}

/// Runs a program in an isolated child process.
pub trait Sandbox: fmt::Debug + Send {
    /// Starts the program described by `plan` and returns its pid once it
    /// has been exec'd.
    ///
    /// # Errors
    ///
    /// Returns an error if the child cannot be created or any setup step
    /// in the child fails; the child is reaped before returning.
    fn run(&mut self, plan: &JailPlan) -> Result<Pid>;

    /// Blocks until the program exits.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing was started or `waitpid` fails for a
    /// reason other than the child being gone.
    fn wait(&mut self) -> Result<ExitState>;

    /// Sends `signal` to the program. A process that no longer exists is
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns the `kill(2)` error.
    fn signal(&self, signal: Signal) -> Result<()>;
}

/// [`Sandbox`] that clones the child into new namespaces.
#[derive(Debug, Default)]
pub struct NamespaceJail {
    child: Option<Pid>,
}

impl NamespaceJail {
    /// Creates a jail with no child.
    pub const fn new() -> Self {
        Self { child: None }
    }

    fn spawn(plan: &JailPlan, exec: &ExecArgs) -> Result<Pid> {
        let (ready_read, ready_write) = pipe()?;
        let (err_read, err_write) = pipe()?;
        let fds = ChildFds {
            ready: ready_read.as_raw_fd(),
            ready_peer: ready_write.as_raw_fd(),
            error: err_write.as_raw_fd(),
            error_peer: err_read.as_raw_fd(),
        };

        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        let callback = Box::new(|| process::child_main(plan, exec, fds));
        // SAFETY: the child does not share memory with the parent (no
        // CLONE_VM); it only reads `plan` and `exec` from its copy of the
        // address space and leaves through exec or `_exit`.
        let pid = unsafe {
            nix::sched::clone(
                callback,
                &mut stack,
                plan.namespaces.clone_flags(),
                Some(Signal::SIGCHLD as libc::c_int),
            )
        }
        .map_err(|e| CellblockError::sys("clone", e))?;
        drop(ready_read);
        drop(err_write);
        tracing::debug!(%pid, "sandbox child cloned");

        let mut ready = File::from(ready_write);
        if let Err(e) = Self::admit(plan, pid).and_then(|()| release(&mut ready)) {
            drop(ready);
            kill_and_reap(pid);
            return Err(e);
        }
        drop(ready);

        let mut errors = File::from(err_read);
        match read_child_errno(&mut errors) {
            Ok(None) => Ok(pid),
            Ok(Some(errno)) => {
                reap(pid);
                Err(CellblockError::sys("sandbox setup", errno))
            }
            Err(e) => {
                kill_and_reap(pid);
                Err(e)
            }
        }
    }

    /// Maps IDs and places the child in its cgroups.
    fn admit(plan: &JailPlan, pid: Pid) -> Result<()> {
        if plan.namespaces.user {
            write_id_maps(pid, &plan.uid_map, &plan.gid_map, plan.deny_setgroups)?;
        }
        for tasks in &plan.cgroup_tasks {
            std::fs::write(tasks, pid.to_string()).map_err(|e| CellblockError::Io {
                path: tasks.clone(),
                source: e,
            })?;
        }
        Ok(())
    }
}

impl Sandbox for NamespaceJail {
    fn run(&mut self, plan: &JailPlan) -> Result<Pid> {
        if let Some(pid) = self.child {
            return Err(CellblockError::config(format!(
                "sandbox already runs pid {pid}"
            )));
        }
        let exec = ExecArgs::new(&plan.program)?;
        let pid = Self::spawn(plan, &exec)?;
        self.child = Some(pid);
        tracing::info!(%pid, program = %plan.program[0], "program started");
        Ok(pid)
    }

    fn wait(&mut self) -> Result<ExitState> {
        let pid = self.child.ok_or_else(|| CellblockError::NotFound {
            kind: "sandbox process",
            id: "none started".into(),
        })?;
        let state = loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, status)) => break ExitState::Exited(status),
                Ok(WaitStatus::Signaled(_, signal, _)) => break ExitState::Signaled(signal),
                Ok(_) | Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => break ExitState::AlreadyReaped,
                Err(e) => return Err(CellblockError::sys(format!("waitpid {pid}"), e)),
            }
        };
        tracing::info!(%pid, %state, "program finished");
        Ok(state)
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        let Some(pid) = self.child else {
            return Ok(());
        };
        match nix::sys::signal::kill(pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(CellblockError::sys(format!("kill {pid}"), e)),
        }
    }
}

fn pipe() -> Result<(std::os::fd::OwnedFd, std::os::fd::OwnedFd)> {
    nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| CellblockError::sys("pipe2", e))
}

fn release(ready: &mut File) -> Result<()> {
    ready.write_all(&[1]).map_err(|e| CellblockError::Io {
        path: PathBuf::from("sandbox sync pipe"),
        source: e,
    })
}

/// Reads the errno the child reports; `None` means the pipe closed on exec.
fn read_child_errno(pipe: &mut File) -> Result<Option<Errno>> {
    let mut buf = [0u8; 4];
    loop {
        match pipe.read_exact(&mut buf) {
            Ok(()) => return Ok(Some(Errno::from_raw(i32::from_ne_bytes(buf)))),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                return Err(CellblockError::Io {
                    path: PathBuf::from("sandbox error pipe"),
                    source: e,
                });
            }
        }
    }
}

fn reap(pid: Pid) {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => {}
            Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

fn kill_and_reap(pid: Pid) {
    if let Err(e) = nix::sys::signal::kill(pid, Signal::SIGKILL) {
        tracing::warn!(%pid, error = %e, "failed to kill sandbox child");
    }
    reap(pid);
}
