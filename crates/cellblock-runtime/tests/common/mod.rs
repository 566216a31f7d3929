//! Fake host backends shared by the lifecycle tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cellblock_common::error::{CellblockError, Result};
use cellblock_common::types::DeviceType;
use cellblock_core::cgroup::V1Factory;
use cellblock_core::filesystem::devmapper::NoopMapper;
use cellblock_core::syscall::Syscall;
use cellblock_runtime::container::Backends;
use cellblock_runtime::jail::{ExitState, JailPlan, Sandbox};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tempfile::TempDir;

/// Pid every fake sandbox hands out.
pub const FAKE_PID: i32 = 4242;

/// One host-side call seen by [`RecordingSyscall`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Mount {
        target: PathBuf,
        fstype: Option<String>,
        flags: MsFlags,
    },
    Umount(PathBuf),
    Mknod {
        path: PathBuf,
        kind: DeviceType,
        major: u32,
        minor: u32,
    },
    AttachLoop(PathBuf),
    DetachLoop(PathBuf),
}

/// Records mount-related calls instead of performing them.
#[derive(Debug, Default)]
pub struct RecordingSyscall {
    pub calls: Mutex<Vec<Call>>,
    pub privileged: bool,
    /// Mounts onto a target ending in this path fail with `EINVAL`.
    pub fail_mount_on: Option<PathBuf>,
    /// Every `MS_REMOUNT` call fails with `EPERM`.
    pub fail_remount: bool,
}

impl RecordingSyscall {
    pub fn privileged() -> Self {
        Self {
            privileged: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mounted_targets(&self) -> Vec<PathBuf> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Mount { target, flags, .. } if !flags.contains(MsFlags::MS_REMOUNT) => {
                    Some(target)
                }
                _ => None,
            })
            .collect()
    }

    pub fn unmounted_targets(&self) -> Vec<PathBuf> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Umount(target) => Some(target),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Syscall for RecordingSyscall {
    fn mount(
        &self,
        _source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        _data: Option<&str>,
    ) -> Result<()> {
        if self
            .fail_mount_on
            .as_deref()
            .is_some_and(|fail| target.ends_with(fail))
        {
            return Err(CellblockError::sys("mount", Errno::EINVAL));
        }
        if self.fail_remount && flags.contains(MsFlags::MS_REMOUNT) {
            return Err(CellblockError::sys("mount", Errno::EPERM));
        }
        self.record(Call::Mount {
            target: target.to_path_buf(),
            fstype: fstype.map(str::to_string),
            flags,
        });
        Ok(())
    }

    fn umount(&self, target: &Path, _flags: MntFlags) -> Result<()> {
        self.record(Call::Umount(target.to_path_buf()));
        Ok(())
    }

    fn mknod(&self, path: &Path, kind: DeviceType, _mode: u32, major: u32, minor: u32) -> Result<()> {
        self.record(Call::Mknod {
            path: path.to_path_buf(),
            kind,
            major,
            minor,
        });
        Ok(())
    }

    fn chown(&self, _path: &Path, _uid: u32, _gid: u32) -> Result<()> {
        Ok(())
    }

    fn chmod(&self, _path: &Path, _mode: u32) -> Result<()> {
        Ok(())
    }

    fn attach_loop(&self, backing: &Path) -> Result<PathBuf> {
        self.record(Call::AttachLoop(backing.to_path_buf()));
        Ok(PathBuf::from("/dev/loop7"))
    }

    fn detach_loop(&self, device: &Path) -> Result<()> {
        self.record(Call::DetachLoop(device.to_path_buf()));
        Ok(())
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }
}

/// What the fake sandbox saw, shared with the test after the container
/// takes ownership of the sandbox.
#[derive(Debug, Default)]
pub struct SandboxLog {
    pub plans: Vec<JailPlan>,
    pub signals: Vec<Signal>,
    pub waits: usize,
}

/// Sandbox that never clones; `wait` reports a fixed exit.
#[derive(Debug)]
pub struct FakeSandbox {
    pub exit: ExitState,
    pub fail_run: Option<Errno>,
    pub log: Arc<Mutex<SandboxLog>>,
}

impl FakeSandbox {
    pub fn exiting(exit: ExitState) -> (Self, Arc<Mutex<SandboxLog>>) {
        let log = Arc::new(Mutex::new(SandboxLog::default()));
        let sandbox = Self {
            exit,
            fail_run: None,
            log: Arc::clone(&log),
        };
        (sandbox, log)
    }
}

impl Sandbox for FakeSandbox {
    fn run(&mut self, plan: &JailPlan) -> Result<Pid> {
        if let Some(errno) = self.fail_run {
            return Err(CellblockError::sys("clone", errno));
        }
        self.log.lock().unwrap().plans.push(plan.clone());
        Ok(Pid::from_raw(FAKE_PID))
    }

    fn wait(&mut self) -> Result<ExitState> {
        self.log.lock().unwrap().waits += 1;
        Ok(self.exit)
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        self.log.lock().unwrap().signals.push(signal);
        Ok(())
    }
}

/// Temporary directories a test container lives in.
#[derive(Debug)]
pub struct Harness {
    pub run_dir: TempDir,
    pub rootfs: TempDir,
    pub cgroup_root: TempDir,
}

impl Harness {
    /// Creates the directories, with `cpu` and `devices` controllers.
    pub fn new() -> Self {
        Self::with_controllers(&["cpu", "devices"])
    }

    /// Creates the directories with only the given controllers mounted.
    pub fn with_controllers(controllers: &[&str]) -> Self {
        let cgroup_root = tempfile::tempdir().unwrap();
        for controller in controllers {
            std::fs::create_dir_all(cgroup_root.path().join(controller)).unwrap();
        }
        Self {
            run_dir: tempfile::tempdir().unwrap(),
            rootfs: tempfile::tempdir().unwrap(),
            cgroup_root,
        }
    }

    pub fn backends(&self, syscall: Arc<RecordingSyscall>, sandbox: FakeSandbox) -> Backends {
        Backends {
            syscall,
            cgroups: Arc::new(V1Factory),
            mapper: Arc::new(NoopMapper),
            sandbox: Box::new(sandbox),
            cgroup_root: self.cgroup_root.path().to_path_buf(),
        }
    }

    /// Directory of `controller` for the container `name`.
    pub fn cgroup_dir(&self, controller: &str, name: &str) -> PathBuf {
        self.cgroup_root.path().join(controller).join(name)
    }

    /// Entries left in the run directory.
    pub fn run_dir_entries(&self) -> usize {
        std::fs::read_dir(self.run_dir.path()).unwrap().count()
    }
}
