//! Cgroups v1 resource management.
//!
//! Each controller is mounted separately under a common root
//! (`/sys/fs/cgroup/<controller>`). A container gets one directory per
//! available controller at `<root>/<controller>/<parent>/<name>`; the
//! sandbox joins it by writing its pid to every `tasks` file.

pub mod cpu;
pub mod cpuset;
pub mod devices;
pub mod freezer;

use std::fmt;
use std::path::{Component, Path, PathBuf};

use cellblock_common::error::{CellblockError, Result};
use nix::unistd::{Gid, Uid};

pub use devices::CgroupDeviceRule;

/// Cgroup v1 controllers the launcher manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Controller {
    /// CPU bandwidth and shares.
    Cpu,
    /// CPU accounting.
    Cpuacct,
    /// CPU and memory-node placement.
    Cpuset,
    /// Device access lists.
    Devices,
    /// Task freezing.
    Freezer,
    /// Scheduler boost hints.
    Schedtune,
}

impl Controller {
    /// All managed controllers, in creation order.
    pub const ALL: [Self; 6] = [
        Self::Cpu,
        Self::Cpuacct,
        Self::Cpuset,
        Self::Devices,
        Self::Freezer,
        Self::Schedtune,
    ];

    /// Directory name of the controller under the cgroup root.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cpuacct => "cpuacct",
            Self::Cpuset => "cpuset",
            Self::Devices => "devices",
            Self::Freezer => "freezer",
            Self::Schedtune => "schedtune",
        }
    }
}

impl fmt::Display for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Operations on a container's cgroup.
///
/// Setters only write control files; they never read back or retry. A
/// device or cpu setting for a controller the host does not mount is
/// ignored.
pub trait Cgroup: fmt::Debug + Send {
    /// Name of the cgroup (the leaf directory under every controller).
    fn name(&self) -> &str;

    /// Freezes every task in the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the freezer controller is missing or the write fails.
    fn freeze(&self) -> Result<()>;

    /// Thaws every task in the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the freezer controller is missing or the write fails.
    fn thaw(&self) -> Result<()>;

    /// Denies access to all devices.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn deny_all_devices(&self) -> Result<()>;

    /// Adds one allow or deny rule to the device access list.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule grants no permission or the write fails.
    fn add_device(&self, rule: &CgroupDeviceRule) -> Result<()>;

    /// Writes `cpu.shares`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn set_cpu_shares(&self, shares: u64) -> Result<()>;

    /// Writes `cpu.cfs_quota_us`; `-1` removes the limit.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn set_cpu_quota(&self, quota_us: i64) -> Result<()>;

    /// Writes `cpu.cfs_period_us`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn set_cpu_period(&self, period_us: u64) -> Result<()>;

    /// Writes `cpu.rt_runtime_us`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn set_cpu_rt_runtime(&self, runtime_us: u64) -> Result<()>;

    /// Writes `cpu.rt_period_us`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn set_cpu_rt_period(&self, period_us: u64) -> Result<()>;

    /// `tasks` files a process must be written to in order to join.
    fn tasks_paths(&self) -> Vec<PathBuf>;
}

/// Creates cgroups for containers.
pub trait CgroupFactory: fmt::Debug + Send + Sync {
    /// Creates the cgroup `name` under `root`, optionally below `parent`.
    ///
    /// Directories are created as `owner_uid`/`owner_gid` so that an
    /// unprivileged container can later manage its own hierarchy.
    ///
    /// # Errors
    ///
    /// Returns an error if a controller directory cannot be created.
    fn create(
        &self,
        name: &str,
        root: &Path,
        parent: Option<&Path>,
        owner_uid: u32,
        owner_gid: u32,
    ) -> Result<Box<dyn Cgroup>>;
}

/// [`CgroupFactory`] that builds [`CgroupManager`]s on a cgroup v1 tree.
#[derive(Debug, Default, Clone, Copy)]
pub struct V1Factory;

impl CgroupFactory for V1Factory {
    fn create(
        &self,
        name: &str,
        root: &Path,
        parent: Option<&Path>,
        owner_uid: u32,
        owner_gid: u32,
    ) -> Result<Box<dyn Cgroup>> {
        let manager = CgroupManager::create(name, root, parent, owner_uid, owner_gid)?;
        Ok(Box::new(manager))
    }
}

/// Handle to a container's cgroup v1 directories.
///
/// Dropping the manager removes every directory it created, leaves first.
/// Directories that already existed are left alone.
#[derive(Debug)]
pub struct CgroupManager {
    name: String,
    dirs: Vec<(Controller, PathBuf)>,
    created: Vec<PathBuf>,
}

impl CgroupManager {
    /// Creates the per-controller directories for `name`.
    ///
    /// Controllers whose root directory is absent are skipped. Missing
    /// levels of `parent` are created along the way. Every new cpuset
    /// directory inherits `cpus` and `mems` from the level above, since the
    /// kernel leaves them empty and an empty cpuset cannot run tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if switching effective IDs, creating a directory,
    /// or copying cpuset values fails. Directories created before the
    /// failure are removed.
    pub fn create(
        name: &str,
        root: &Path,
        parent: Option<&Path>,
        owner_uid: u32,
        owner_gid: u32,
    ) -> Result<Self> {
        let _ids = EffectiveIdGuard::switch_to(owner_uid, owner_gid)?;
        let mut manager = Self {
            name: name.to_string(),
            dirs: Vec::new(),
            created: Vec::new(),
        };

        for controller in Controller::ALL {
            let controller_root = root.join(controller.name());
            if !controller_root.is_dir() {
                tracing::debug!(%controller, "controller not mounted, skipping");
                continue;
            }
            let mut level = controller_root;
            let parent_levels = parent
                .into_iter()
                .flat_map(Path::components)
                .filter(|c| matches!(c, Component::Normal(_)));
            for component in parent_levels {
                let next = level.join(component);
                manager.make_level(controller, &level, &next)?;
                level = next;
            }
            let dir = level.join(name);
            manager.make_level(controller, &level, &dir)?;
            manager.dirs.push((controller, dir));
        }

        tracing::info!(
            name,
            controllers = manager.dirs.len(),
            created = manager.created.len(),
            "cgroup created"
        );
        Ok(manager)
    }

    fn make_level(&mut self, controller: Controller, parent: &Path, dir: &Path) -> Result<()> {
        if !make_cgroup_dir(dir)? {
            return Ok(());
        }
        self.created.push(dir.to_path_buf());
        if controller == Controller::Cpuset {
            cpuset::inherit_from_parent(parent, dir)?;
        }
        Ok(())
    }

    /// Directory of `controller`, if it was created.
    pub fn controller_dir(&self, controller: Controller) -> Option<&Path> {
        self.dirs
            .iter()
            .find(|(c, _)| *c == controller)
            .map(|(_, dir)| dir.as_path())
    }

    fn require(&self, controller: Controller) -> Result<&Path> {
        self.controller_dir(controller)
            .ok_or_else(|| CellblockError::NotFound {
                kind: "cgroup controller",
                id: controller.name().to_string(),
            })
    }

    fn with_controller(
        &self,
        controller: Controller,
        write: impl FnOnce(&Path) -> Result<()>,
    ) -> Result<()> {
        match self.controller_dir(controller) {
            Some(dir) => write(dir),
            None => {
                tracing::debug!(%controller, "controller not mounted, setting ignored");
                Ok(())
            }
        }
    }
}

impl Cgroup for CgroupManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn freeze(&self) -> Result<()> {
        freezer::set_state(self.require(Controller::Freezer)?, freezer::FreezerState::Frozen)
    }

    fn thaw(&self) -> Result<()> {
        freezer::set_state(self.require(Controller::Freezer)?, freezer::FreezerState::Thawed)
    }

    fn deny_all_devices(&self) -> Result<()> {
        self.with_controller(Controller::Devices, devices::deny_all)
    }

    fn add_device(&self, rule: &CgroupDeviceRule) -> Result<()> {
        self.with_controller(Controller::Devices, |dir| devices::add_rule(dir, rule))
    }

    fn set_cpu_shares(&self, shares: u64) -> Result<()> {
        self.with_controller(Controller::Cpu, |dir| cpu::set_shares(dir, shares))
    }

    fn set_cpu_quota(&self, quota_us: i64) -> Result<()> {
        self.with_controller(Controller::Cpu, |dir| cpu::set_quota(dir, quota_us))
    }

    fn set_cpu_period(&self, period_us: u64) -> Result<()> {
        self.with_controller(Controller::Cpu, |dir| cpu::set_period(dir, period_us))
    }

    fn set_cpu_rt_runtime(&self, runtime_us: u64) -> Result<()> {
        self.with_controller(Controller::Cpu, |dir| cpu::set_rt_runtime(dir, runtime_us))
    }

    fn set_cpu_rt_period(&self, period_us: u64) -> Result<()> {
        self.with_controller(Controller::Cpu, |dir| cpu::set_rt_period(dir, period_us))
    }

    fn tasks_paths(&self) -> Vec<PathBuf> {
        self.dirs.iter().map(|(_, dir)| dir.join("tasks")).collect()
    }
}

impl Drop for CgroupManager {
    fn drop(&mut self) {
        for dir in self.created.iter().rev() {
            if let Err(e) = std::fs::remove_dir(dir) {
                tracing::warn!(
                    path = %dir.display(),
                    error = %e,
                    "failed to remove cgroup directory"
                );
            }
        }
        tracing::debug!(name = %self.name, "cgroup destroyed");
    }
}

/// Writes `value` to the control file `file` inside `dir`.
pub(crate) fn write_control(dir: &Path, file: &str, value: &str) -> Result<()> {
    let path = dir.join(file);
    std::fs::write(&path, value).map_err(|e| CellblockError::Io { path, source: e })
}

/// Creates `dir`; returns whether it did not exist before.
fn make_cgroup_dir(dir: &Path) -> Result<bool> {
    match std::fs::create_dir(dir) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            tracing::debug!(path = %dir.display(), "cgroup directory already exists");
            Ok(false)
        }
        Err(e) => Err(CellblockError::Io {
            path: dir.to_path_buf(),
            source: e,
        }),
    }
}

/// Temporarily runs with the given effective IDs; restores root on drop.
///
/// Only switches when the caller is root and the owner is not, so the
/// guard is a no-op for unprivileged launches and for root-owned cgroups.
#[derive(Debug)]
struct EffectiveIdGuard {
    saved: Option<(Uid, Gid)>,
}

impl EffectiveIdGuard {
    fn switch_to(uid: u32, gid: u32) -> Result<Self> {
        let euid = Uid::effective();
        let egid = Gid::effective();
        if !euid.is_root() || (uid == 0 && gid == 0) {
            return Ok(Self { saved: None });
        }
        nix::unistd::setegid(Gid::from_raw(gid))
            .map_err(|e| CellblockError::sys("setegid", e))?;
        if let Err(e) = nix::unistd::seteuid(Uid::from_raw(uid)) {
            let _ = nix::unistd::setegid(egid);
            return Err(CellblockError::sys("seteuid", e));
        }
        Ok(Self {
            saved: Some((euid, egid)),
        })
    }
}

impl Drop for EffectiveIdGuard {
    fn drop(&mut self) {
        if let Some((uid, gid)) = self.saved.take() {
            if let Err(e) = nix::unistd::seteuid(uid) {
                tracing::error!(error = %e, "failed to restore effective uid");
            }
            if let Err(e) = nix::unistd::setegid(gid) {
                tracing::error!(error = %e, "failed to restore effective gid");
            }
        }
    }
}
