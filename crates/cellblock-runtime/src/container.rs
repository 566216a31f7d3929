//! Container lifecycle: start, wait, kill, and teardown.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cellblock_common::constants::{CGROUP_ROOT, PID_FILE_NAME, ROOT_DIR_NAME};
use cellblock_common::error::{CellblockError, Result};
use cellblock_common::types::ContainerState;
use cellblock_core::cgroup::{Cgroup, CgroupFactory, V1Factory};
use cellblock_core::filesystem::devmapper::{DeviceMapper, default_mapper};
use cellblock_core::filesystem::mount::{bind_rootfs, make_dir};
use cellblock_core::syscall::{LinuxSyscall, Syscall};
use nix::mount::MntFlags;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::config::{Config, CpuParams};
use crate::devices;
use crate::jail::{ExitState, JailPlan, NamespaceJail, Sandbox};
use crate::mounts::{self, Ledger};
use crate::setfiles;

/// The host-facing implementations a container drives.
#[derive(Debug)]
pub struct Backends {
    /// Mounts, device nodes, ownership, and loop devices.
    pub syscall: Arc<dyn Syscall>,
    /// Cgroup creation.
    pub cgroups: Arc<dyn CgroupFactory>,
    /// dm-verity targets.
    pub mapper: Arc<dyn DeviceMapper>,
    /// Process isolation.
    pub sandbox: Box<dyn Sandbox>,
    /// Root under which each cgroup controller is mounted.
    pub cgroup_root: PathBuf,
}

impl Backends {
    /// Backends that act on the running kernel.
    pub fn linux() -> Self {
        Self {
            syscall: Arc::new(LinuxSyscall),
            cgroups: Arc::new(V1Factory),
            mapper: default_mapper(),
            sandbox: Box::new(NamespaceJail::new()),
            cgroup_root: PathBuf::from(CGROUP_ROOT),
        }
    }

    /// Uses `root` as the cgroup controller root.
    #[must_use]
    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }
}

#[derive(Debug)]
struct RunDir {
    path: PathBuf,
    root: PathBuf,
    root_created: bool,
    root_mounted: bool,
}

/// One container instance. Single use: it can be started once.
pub struct Container {
    name: String,
    run_dir: PathBuf,
    state: ContainerState,
    syscall: Arc<dyn Syscall>,
    cgroups: Arc<dyn CgroupFactory>,
    sandbox: Box<dyn Sandbox>,
    cgroup_root: PathBuf,
    ledger: Ledger,
    cgroup: Option<Box<dyn Cgroup>>,
    run: Option<RunDir>,
    root: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    pid: Option<Pid>,
    exit: Option<ExitState>,
    torn_down: bool,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("root", &self.root)
            .field("pid", &self.pid)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Creates a container called `name` whose run directory will be
    /// created under `run_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is empty or contains `/`.
    pub fn new(name: &str, run_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_backends(name, run_dir, Backends::linux())
    }

    /// Like [`Container::new`] with explicit backends.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is empty or contains `/`.
    pub fn with_backends(name: &str, run_dir: impl Into<PathBuf>, backends: Backends) -> Result<Self> {
        if name.is_empty() || name.contains('/') {
            return Err(CellblockError::config(format!(
                "invalid container name \"{name}\""
            )));
        }
        let Backends {
            syscall,
            cgroups,
            mapper,
            sandbox,
            cgroup_root,
        } = backends;
        Ok(Self {
            name: name.to_string(),
            run_dir: run_dir.into(),
            state: ContainerState::Created,
            ledger: Ledger::new(Arc::clone(&syscall), mapper),
            syscall,
            cgroups,
            sandbox,
            cgroup_root,
            cgroup: None,
            run: None,
            root: None,
            pid_file: None,
            pid: None,
            exit: None,
            torn_down: false,
        })
    }

    /// Name of the container.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> ContainerState {
        self.state
    }

    /// Pid of the program, once started.
    pub const fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Host path of the directory the program was pivoted into.
    pub fn root_path(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Run directory created for the container; `None` for a premounted
    /// root.
    pub fn run_path(&self) -> Option<&Path> {
        self.run.as_ref().map(|run| run.path.as_path())
    }

    /// Pid file written at start.
    pub fn pid_file(&self) -> Option<&Path> {
        self.pid_file.as_deref()
    }

    /// Resources the container currently holds.
    pub const fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// How the program ended, once waited for.
    pub const fn exit_state(&self) -> Option<ExitState> {
        self.exit
    }

    /// Builds the container described by `config` and starts its program.
    ///
    /// Any failure releases everything acquired so far before returning
    /// and leaves the container [`ContainerState::Failed`].
    ///
    /// # Errors
    ///
    /// Returns [`CellblockError::InvalidState`] unless the container is
    /// freshly created, or the first failing setup step.
    pub fn start(&mut self, config: &Config) -> Result<()> {
        if self.state != ContainerState::Created {
            return Err(self.invalid_state("start"));
        }
        match self.try_start(config) {
            Ok(pid) => {
                self.state = ContainerState::Running;
                tracing::info!(
                    name = %self.name,
                    %pid,
                    root = ?self.root,
                    "container started"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(name = %self.name, error = %e, "container start failed");
                if self.pid.is_some() {
                    if let Err(kill) = self.sandbox.signal(Signal::SIGKILL) {
                        tracing::warn!(error = %kill, "failed to kill program");
                    }
                    if let Err(wait) = self.sandbox.wait() {
                        tracing::warn!(error = %wait, "failed to reap program");
                    }
                }
                if let Err(cleanup) = self.teardown() {
                    tracing::warn!(name = %self.name, error = %cleanup, "teardown incomplete");
                }
                self.state = ContainerState::Failed;
                Err(e)
            }
        }
    }

    fn try_start(&mut self, config: &Config) -> Result<Pid> {
        config.validate()?;
        let uid = config.uid_map().outside_id(config.uid())?;
        let gid = config.gid_map().outside_id(config.gid())?;

        let root = match config.premounted_runfs() {
            Some(premounted) => premounted.to_path_buf(),
            None => self.create_run_dir(config, uid, gid)?,
        };
        self.root = Some(root.clone());

        let (owner_uid, owner_gid) = config.cgroup_owner();
        let cgroup = self.cgroups.create(
            &self.name,
            &self.cgroup_root,
            config.cgroup_parent(),
            config.uid_map().outside_id(owner_uid)?,
            config.gid_map().outside_id(owner_gid)?,
        )?;
        let cgroup: &dyn Cgroup = &**self.cgroup.insert(cgroup);
        apply_cpu_params(cgroup, config.cpu())?;

        let ns_mounts = mounts::mount_all(config, &root, &mut self.ledger)?;

        let privileged = self.syscall.is_privileged();
        if privileged {
            devices::setup(
                self.syscall.as_ref(),
                cgroup,
                config,
                &root,
                self.ledger.loop_devices(),
            )?;
        } else {
            tracing::debug!(name = %self.name, "unprivileged, skipping device setup");
        }

        if let Some(command) = config.run_setfiles() {
            let destinations = setfiles::destinations(config, &root);
            if !destinations.is_empty() {
                setfiles::run(command, &root, &destinations)?;
            }
        }

        let plan = JailPlan::from_config(config, &root, ns_mounts, cgroup.tasks_paths(), privileged);
        let pid = self.sandbox.run(&plan)?;
        self.pid = Some(pid);

        let pid_file = config
            .pid_file()
            .map(Path::to_path_buf)
            .or_else(|| self.run.as_ref().map(|run| run.path.join(PID_FILE_NAME)));
        if let Some(path) = pid_file {
            std::fs::write(&path, format!("{pid}\n")).map_err(|e| CellblockError::Io {
                path: path.clone(),
                source: e,
            })?;
            self.pid_file = Some(path);
        }
        Ok(pid)
    }

    /// Creates `<run_dir>/<name>_XXXXXX/root` and binds the rootfs onto it.
    fn create_run_dir(&mut self, config: &Config, uid: u32, gid: u32) -> Result<PathBuf> {
        let path = tempfile::Builder::new()
            .prefix(&format!("{}_", self.name))
            .rand_bytes(6)
            .tempdir_in(&self.run_dir)
            .map_err(|e| CellblockError::Io {
                path: self.run_dir.clone(),
                source: e,
            })?
            .keep();
        let run = self.run.insert(RunDir {
            root: path.join(ROOT_DIR_NAME),
            path,
            root_created: false,
            root_mounted: false,
        });

        self.syscall.chmod(&run.path, 0o700)?;
        self.syscall.chown(&run.path, uid, gid)?;

        make_dir(&run.root, 0o700)?;
        run.root_created = true;
        self.syscall.chmod(&run.root, 0o660)?;

        bind_rootfs(
            self.syscall.as_ref(),
            config.rootfs(),
            &run.root,
            config.rootfs_mount_flags(),
        )?;
        run.root_mounted = true;
        tracing::debug!(name = %self.name, run_dir = %run.path.display(), "run directory ready");
        Ok(run.root.clone())
    }

    /// Blocks until the program exits, then tears the container down.
    ///
    /// A program that was already reaped elsewhere still gets torn down.
    /// Waiting again after that returns the recorded exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the container never started, waiting fails, or
    /// teardown could not release everything.
    pub fn wait(&mut self) -> Result<ExitState> {
        match self.state {
            ContainerState::Running => {}
            ContainerState::Stopped => {
                return self.exit.ok_or_else(|| self.invalid_state("wait"));
            }
            ContainerState::Created | ContainerState::Failed => {
                return Err(self.invalid_state("wait"));
            }
        }
        let exit = self.sandbox.wait()?;
        self.exit = Some(exit);
        self.state = ContainerState::Stopped;
        tracing::info!(name = %self.name, %exit, "container exited");
        self.teardown()?;
        Ok(exit)
    }

    /// Kills the program with `SIGKILL` and waits for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be sent or [`Container::wait`]
    /// fails.
    pub fn kill(&mut self) -> Result<ExitState> {
        if self.state == ContainerState::Running {
            self.sandbox.signal(Signal::SIGKILL)?;
        }
        self.wait()
    }

    /// Freezes every process of the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container has no cgroup or the freezer
    /// write fails.
    pub fn freeze(&self) -> Result<()> {
        self.running_cgroup("freeze")?.freeze()
    }

    /// Thaws a frozen container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container has no cgroup or the freezer
    /// write fails.
    pub fn thaw(&self) -> Result<()> {
        self.running_cgroup("thaw")?.thaw()
    }

    fn running_cgroup(&self, op: &'static str) -> Result<&dyn Cgroup> {
        match (&self.cgroup, self.state) {
            (Some(cgroup), ContainerState::Running) => Ok(cgroup.as_ref()),
            _ => Err(self.invalid_state(op)),
        }
    }

    fn invalid_state(&self, op: &'static str) -> CellblockError {
        CellblockError::InvalidState {
            name: self.name.clone(),
            state: self.state,
            op,
        }
    }

    /// Releases everything the container holds in reverse order of
    /// acquisition: pid file, mounts, cgroup, root, run directory. Runs
    /// once; later calls do nothing.
    fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        let mut first_error: Option<CellblockError> = None;
        let mut note = |result: Result<()>, what: &str| {
            if let Err(e) = result {
                tracing::warn!(error = %e, "teardown: {what} failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        };

        if let Some(pid_file) = &self.pid_file {
            let removed = std::fs::remove_file(pid_file).map_err(|e| CellblockError::Io {
                path: pid_file.clone(),
                source: e,
            });
            note(removed, "removing pid file");
        }
        note(self.ledger.drain(), "releasing mounts");
        self.cgroup = None;

        if let Some(run) = &mut self.run {
            if run.root_mounted {
                note(
                    self.syscall.umount(&run.root, MntFlags::MNT_DETACH),
                    "unmounting root",
                );
                run.root_mounted = false;
            }
            if run.root_created {
                note(remove_dir(&run.root), "removing root");
                run.root_created = false;
            }
            note(remove_dir(&run.path), "removing run directory");
        }

        tracing::debug!(name = %self.name, "container torn down");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if self.state == ContainerState::Running {
            tracing::warn!(name = %self.name, "container dropped while running, killing");
            let _ = self.sandbox.signal(Signal::SIGKILL);
            let _ = self.sandbox.wait();
        }
        let _ = self.teardown();
    }
}

fn apply_cpu_params(cgroup: &dyn Cgroup, cpu: &CpuParams) -> Result<()> {
    if let Some(shares) = cpu.shares {
        cgroup.set_cpu_shares(shares)?;
    }
    if let Some(cfs) = cpu.cfs {
        cgroup.set_cpu_quota(cfs.quota_us)?;
        cgroup.set_cpu_period(cfs.period_us)?;
    }
    if let Some(rt) = cpu.rt {
        cgroup.set_cpu_rt_runtime(rt.runtime_us)?;
        cgroup.set_cpu_rt_period(rt.period_us)?;
    }
    Ok(())
}

fn remove_dir(path: &Path) -> Result<()> {
    std::fs::remove_dir(path).map_err(|e| CellblockError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}
