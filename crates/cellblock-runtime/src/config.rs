//! In-memory description of a container.
//!
//! A [`Config`] is populated through validating setters and then handed to
//! [`crate::container::Container::start`]. Each setter checks its own
//! argument; [`Config::validate`] re-checks cross-field invariants when the
//! container starts.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cellblock_common::constants::MAX_RLIMITS;
use cellblock_common::error::{CellblockError, Result};
use cellblock_common::types::DeviceType;
use cellblock_core::cgroup::CgroupDeviceRule;
use cellblock_core::namespace::user::IdMap;
use cellblock_core::rlimit::Rlimit;
use nix::mount::MsFlags;

/// Action run in the sandboxed child immediately before `execve(2)`.
pub type PreExecHook = Arc<dyn Fn() -> io::Result<()> + Send + Sync>;

/// One filesystem to mount for the container.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Label used in logs.
    pub name: String,
    /// Source path or pseudo-filesystem name.
    pub source: PathBuf,
    /// Mount point inside the container.
    pub destination: PathBuf,
    /// Filesystem type; empty for bind mounts.
    pub fstype: String,
    /// Filesystem-specific mount data.
    pub data: Option<String>,
    /// dm-verity table line; `@DEV@` stands for the backing device.
    pub verity: Option<String>,
    /// `mount(2)` flags.
    pub flags: MsFlags,
    /// Owner of a created destination, inside the container.
    pub uid: u32,
    /// Group of a created destination, inside the container.
    pub gid: u32,
    /// Mode of a created destination.
    pub mode: u32,
    /// Mount inside the new mount namespace instead of from the host.
    pub mount_in_ns: bool,
    /// Create the destination if it does not exist.
    pub create_if_missing: bool,
    /// Attach the source file to a loop device and mount that.
    pub loopback: bool,
}

impl Default for MountSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            source: PathBuf::new(),
            destination: PathBuf::new(),
            fstype: String::new(),
            data: None,
            verity: None,
            flags: MsFlags::empty(),
            uid: 0,
            gid: 0,
            mode: 0o755,
            mount_in_ns: false,
            create_if_missing: false,
            loopback: false,
        }
    }
}

/// One device node to create inside the container.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    /// Block or character device.
    pub device_type: DeviceType,
    /// Node path inside the container; also the host node a minor is
    /// copied from.
    pub path: PathBuf,
    /// Permission bits of the node.
    pub mode: u32,
    /// Major number.
    pub major: u32,
    /// Minor number; `None` matches every minor in the derived cgroup rule.
    pub minor: Option<u32>,
    /// Take the minor number from the host node at `path`.
    pub copy_minor_from_host: bool,
    /// Owner inside the container.
    pub uid: u32,
    /// Group inside the container.
    pub gid: u32,
    /// Allow reading the device.
    pub read: bool,
    /// Allow writing the device.
    pub write: bool,
    /// Allow `mknod` of the device.
    pub modify: bool,
}

impl DeviceSpec {
    /// The allow rule this device implies, if it grants any access.
    pub const fn cgroup_rule(&self) -> Option<CgroupDeviceRule> {
        if !self.read && !self.write && !self.modify {
            return None;
        }
        Some(CgroupDeviceRule {
            allow: true,
            device_type: self.device_type,
            major: Some(self.major),
            minor: self.minor,
            read: self.read,
            write: self.write,
            modify: self.modify,
        })
    }
}

/// CFS bandwidth: `quota_us` of CPU time per `period_us`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfsBandwidth {
    /// Quota in microseconds, or `-1` for unlimited.
    pub quota_us: i64,
    /// Period in microseconds.
    pub period_us: u64,
}

/// Real-time bandwidth: `runtime_us` of RT time per `period_us`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtBandwidth {
    /// Runtime in microseconds.
    pub runtime_us: u64,
    /// Period in microseconds.
    pub period_us: u64,
}

/// CPU controller parameters; unset values are left at the kernel default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuParams {
    /// `cpu.shares`.
    pub shares: Option<u64>,
    /// `cpu.cfs_quota_us` and `cpu.cfs_period_us`.
    pub cfs: Option<CfsBandwidth>,
    /// `cpu.rt_runtime_us` and `cpu.rt_period_us`.
    pub rt: Option<RtBandwidth>,
}

impl CpuParams {
    fn check_shares(shares: u64) -> Result<()> {
        if shares < 2 {
            return Err(CellblockError::config(format!(
                "cpu shares must be at least 2, got {shares}"
            )));
        }
        Ok(())
    }

    fn check_cfs(cfs: CfsBandwidth) -> Result<()> {
        if cfs.quota_us <= 0 && cfs.quota_us != -1 {
            return Err(CellblockError::config(format!(
                "cpu quota must be positive or -1, got {}",
                cfs.quota_us
            )));
        }
        if cfs.period_us == 0 {
            return Err(CellblockError::config("cpu period must be positive"));
        }
        Ok(())
    }

    fn check_rt(rt: RtBandwidth) -> Result<()> {
        if rt.runtime_us >= rt.period_us {
            return Err(CellblockError::config(format!(
                "cpu rt runtime {} must be below rt period {}",
                rt.runtime_us, rt.period_us
            )));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if let Some(shares) = self.shares {
            Self::check_shares(shares)?;
        }
        if let Some(cfs) = self.cfs {
            Self::check_cfs(cfs)?;
        }
        if let Some(rt) = self.rt {
            Self::check_rt(rt)?;
        }
        Ok(())
    }
}

/// Capability mask and how it is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capmask {
    /// Bit `n` keeps capability `n`.
    pub mask: u64,
    /// Raise the kept capabilities into the ambient set.
    pub ambient: bool,
}

/// Description of a container.
#[derive(Clone)]
pub struct Config {
    rootfs: PathBuf,
    rootfs_mount_flags: MsFlags,
    program: Vec<String>,
    uid: u32,
    gid: u32,
    uid_map: IdMap,
    gid_map: IdMap,
    mounts: Vec<MountSpec>,
    devices: Vec<DeviceSpec>,
    cgroup_devices: Vec<CgroupDeviceRule>,
    cpu: CpuParams,
    cgroup_parent: Option<PathBuf>,
    cgroup_owner_uid: u32,
    cgroup_owner_gid: u32,
    share_host_netns: bool,
    keep_fds_open: bool,
    rlimits: Vec<Rlimit>,
    alt_syscall_table: Option<String>,
    capmask: Option<Capmask>,
    securebits_skip_mask: u64,
    run_as_init: bool,
    selinux_context: Option<String>,
    pre_execve_hook: Option<PreExecHook>,
    inherited_fds: Option<Vec<RawFd>>,
    config_root: Option<PathBuf>,
    premounted_runfs: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    run_setfiles: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("rootfs", &self.rootfs)
            .field("rootfs_mount_flags", &self.rootfs_mount_flags)
            .field("program", &self.program)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("uid_map", &self.uid_map.to_string())
            .field("gid_map", &self.gid_map.to_string())
            .field("mounts", &self.mounts)
            .field("devices", &self.devices)
            .field("cgroup_devices", &self.cgroup_devices)
            .field("cpu", &self.cpu)
            .field("cgroup_parent", &self.cgroup_parent)
            .field("share_host_netns", &self.share_host_netns)
            .field("keep_fds_open", &self.keep_fds_open)
            .field("rlimits", &self.rlimits)
            .field("alt_syscall_table", &self.alt_syscall_table)
            .field("capmask", &self.capmask)
            .field("securebits_skip_mask", &self.securebits_skip_mask)
            .field("run_as_init", &self.run_as_init)
            .field("selinux_context", &self.selinux_context)
            .field("pre_execve_hook", &self.pre_execve_hook.is_some())
            .field("inherited_fds", &self.inherited_fds)
            .field("premounted_runfs", &self.premounted_runfs)
            .field("pid_file", &self.pid_file)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Creates an empty description. The program runs as PID 1 of its
    /// namespace unless [`Config::set_run_as_init`] says otherwise.
    pub fn new() -> Self {
        Self {
            rootfs: PathBuf::new(),
            rootfs_mount_flags: MsFlags::empty(),
            program: Vec::new(),
            uid: 0,
            gid: 0,
            uid_map: IdMap::default(),
            gid_map: IdMap::default(),
            mounts: Vec::new(),
            devices: Vec::new(),
            cgroup_devices: Vec::new(),
            cpu: CpuParams::default(),
            cgroup_parent: None,
            cgroup_owner_uid: 0,
            cgroup_owner_gid: 0,
            share_host_netns: false,
            keep_fds_open: false,
            rlimits: Vec::new(),
            alt_syscall_table: None,
            capmask: None,
            securebits_skip_mask: 0,
            run_as_init: true,
            selinux_context: None,
            pre_execve_hook: None,
            inherited_fds: None,
            config_root: None,
            premounted_runfs: None,
            pid_file: None,
            run_setfiles: None,
        }
    }

    /// Sets the directory bind-mounted as the container root.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is empty.
    pub fn set_rootfs(&mut self, rootfs: impl Into<PathBuf>) -> Result<()> {
        let rootfs = rootfs.into();
        if rootfs.as_os_str().is_empty() {
            return Err(CellblockError::config("rootfs path is empty"));
        }
        self.rootfs = rootfs;
        Ok(())
    }

    /// Sets flags the rootfs bind mount is remounted with.
    ///
    /// `MS_BIND | MS_REMOUNT` is always added so the remount never
    /// touches the original filesystem.
    pub fn set_rootfs_mount_flags(&mut self, flags: MsFlags) {
        self.rootfs_mount_flags = flags | MsFlags::MS_BIND | MsFlags::MS_REMOUNT;
    }

    /// Sets the argv of the program to run; `program[0]` is the path.
    ///
    /// # Errors
    ///
    /// Returns an error if `program` is empty.
    pub fn set_program<I, S>(&mut self, program: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let program: Vec<String> = program.into_iter().map(Into::into).collect();
        if program.is_empty() || program[0].is_empty() {
            return Err(CellblockError::config("program must not be empty"));
        }
        self.program = program;
        Ok(())
    }

    /// Sets the UID the program runs as inside the container.
    pub const fn set_uid(&mut self, uid: u32) {
        self.uid = uid;
    }

    /// Sets the GID the program runs as inside the container.
    pub const fn set_gid(&mut self, gid: u32) {
        self.gid = gid;
    }

    /// Sets the user-namespace UID map from its textual form.
    ///
    /// # Errors
    ///
    /// Returns an error if the map does not parse.
    pub fn set_uid_map(&mut self, map: &str) -> Result<()> {
        self.uid_map = IdMap::parse(map)?;
        Ok(())
    }

    /// Sets the user-namespace GID map from its textual form.
    ///
    /// # Errors
    ///
    /// Returns an error if the map does not parse.
    pub fn set_gid_map(&mut self, map: &str) -> Result<()> {
        self.gid_map = IdMap::parse(map)?;
        Ok(())
    }

    /// Appends a mount. Mounts are performed in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination is empty, or a mount performed
    /// inside the namespace has a relative destination.
    pub fn add_mount(&mut self, mount: MountSpec) -> Result<()> {
        if mount.destination.as_os_str().is_empty() {
            return Err(CellblockError::config(format!(
                "mount \"{}\" has no destination",
                mount.name
            )));
        }
        if mount.mount_in_ns && !mount.destination.is_absolute() {
            return Err(CellblockError::config(format!(
                "mount \"{}\" destination {} must be absolute",
                mount.name,
                mount.destination.display()
            )));
        }
        self.mounts.push(mount);
        Ok(())
    }

    /// Appends a device node. A device that grants any access also
    /// appends the matching allow rule to the cgroup device list.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is empty, the type is not block or
    /// character, or a copied minor is combined with an explicit one.
    pub fn add_device(&mut self, device: DeviceSpec) -> Result<()> {
        if device.path.as_os_str().is_empty() {
            return Err(CellblockError::config("device path is empty"));
        }
        if device.device_type == DeviceType::All {
            return Err(CellblockError::config(format!(
                "device {} must be a block or character device",
                device.path.display()
            )));
        }
        if device.copy_minor_from_host && device.minor.is_some() {
            return Err(CellblockError::config(format!(
                "device {} copies its minor from the host and cannot set one",
                device.path.display()
            )));
        }
        if let Some(rule) = device.cgroup_rule() {
            self.cgroup_devices.push(rule);
        }
        self.devices.push(device);
        Ok(())
    }

    /// Appends an explicit cgroup device rule.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule grants or denies nothing.
    pub fn add_cgroup_device(&mut self, rule: CgroupDeviceRule) -> Result<()> {
        let _line = rule.to_line()?;
        self.cgroup_devices.push(rule);
        Ok(())
    }

    /// Sets `cpu.shares`.
    ///
    /// # Errors
    ///
    /// Returns an error if `shares` is below 2.
    pub fn set_cpu_shares(&mut self, shares: u64) -> Result<()> {
        CpuParams::check_shares(shares)?;
        self.cpu.shares = Some(shares);
        Ok(())
    }

    /// Sets the CFS quota and period.
    ///
    /// # Errors
    ///
    /// Returns an error unless `quota_us` is positive or `-1` and
    /// `period_us` is positive.
    pub fn set_cpu_cfs_params(&mut self, quota_us: i64, period_us: u64) -> Result<()> {
        let cfs = CfsBandwidth {
            quota_us,
            period_us,
        };
        CpuParams::check_cfs(cfs)?;
        self.cpu.cfs = Some(cfs);
        Ok(())
    }

    /// Sets the real-time runtime and period.
    ///
    /// # Errors
    ///
    /// Returns an error unless `runtime_us < period_us`.
    pub fn set_cpu_rt_params(&mut self, runtime_us: u64, period_us: u64) -> Result<()> {
        let rt = RtBandwidth {
            runtime_us,
            period_us,
        };
        CpuParams::check_rt(rt)?;
        self.cpu.rt = Some(rt);
        Ok(())
    }

    /// Places the container's cgroup below `parent`, owned by `uid`/`gid`
    /// inside the container.
    pub fn set_cgroup_parent(&mut self, parent: impl Into<PathBuf>, uid: u32, gid: u32) {
        self.cgroup_parent = Some(parent.into());
        self.cgroup_owner_uid = uid;
        self.cgroup_owner_gid = gid;
    }

    /// Runs the container in the host's network namespace.
    pub const fn share_host_netns(&mut self) {
        self.share_host_netns = true;
    }

    /// Leaves the launcher's open descriptors open in the container.
    pub const fn keep_fds_open(&mut self) {
        self.keep_fds_open = true;
    }

    /// Appends a resource limit.
    ///
    /// # Errors
    ///
    /// Returns an error once the limit count is reached or if `soft`
    /// exceeds `hard`.
    pub fn add_rlimit(&mut self, rlimit: Rlimit) -> Result<()> {
        if self.rlimits.len() >= MAX_RLIMITS {
            return Err(CellblockError::config(format!(
                "at most {MAX_RLIMITS} rlimits may be set"
            )));
        }
        if rlimit.soft > rlimit.hard {
            return Err(CellblockError::config(format!(
                "rlimit {rlimit} has a soft limit above its hard limit"
            )));
        }
        self.rlimits.push(rlimit);
        Ok(())
    }

    /// Switches the program to the named alternate syscall table.
    pub fn set_alt_syscall_table(&mut self, table: impl Into<String>) {
        self.alt_syscall_table = Some(table.into());
    }

    /// Restricts the program to the capabilities in `mask`, optionally
    /// raising them into the ambient set.
    pub const fn set_capmask(&mut self, mask: u64, ambient: bool) {
        self.capmask = Some(Capmask { mask, ambient });
    }

    /// Securebits that must not be locked when a capmask is applied.
    pub const fn set_securebits_skip_mask(&mut self, mask: u64) {
        self.securebits_skip_mask = mask;
    }

    /// `true` runs the program as PID 1 of its namespace; `false` puts a
    /// minimal init in front of it.
    pub const fn set_run_as_init(&mut self, run_as_init: bool) {
        self.run_as_init = run_as_init;
    }

    /// Sets the SELinux context the program is executed in.
    pub fn set_selinux_context(&mut self, context: impl Into<String>) {
        self.selinux_context = Some(context.into());
    }

    /// Sets an action run in the child right before `execve(2)`, after the
    /// SELinux context is applied.
    pub fn set_pre_execve_hook<F>(&mut self, hook: F)
    where
        F: Fn() -> io::Result<()> + Send + Sync + 'static,
    {
        self.pre_execve_hook = Some(Arc::new(hook));
    }

    /// Passes `fds` through to the program. May only be called once.
    ///
    /// # Errors
    ///
    /// Returns an error if inherited descriptors were already set or a
    /// descriptor is negative.
    pub fn inherit_fds(&mut self, fds: &[RawFd]) -> Result<()> {
        if self.inherited_fds.is_some() {
            return Err(CellblockError::config("inherited fds may only be set once"));
        }
        if let Some(fd) = fds.iter().find(|fd| **fd < 0) {
            return Err(CellblockError::config(format!("invalid inherited fd {fd}")));
        }
        self.inherited_fds = Some(fds.to_vec());
        Ok(())
    }

    /// Directory relative loopback sources are resolved against.
    pub fn set_config_root(&mut self, root: impl Into<PathBuf>) {
        self.config_root = Some(root.into());
    }

    /// Uses an already-mounted root instead of creating a run directory.
    pub fn set_premounted_runfs(&mut self, runfs: impl Into<PathBuf>) {
        self.premounted_runfs = Some(runfs.into());
    }

    /// Writes the container pid to `path` instead of the run directory.
    pub fn set_pid_file(&mut self, path: impl Into<PathBuf>) {
        self.pid_file = Some(path.into());
    }

    /// Relabels writable host-side mounts with this `setfiles` binary.
    pub fn set_run_setfiles(&mut self, command: impl Into<PathBuf>) {
        self.run_setfiles = Some(command.into());
    }

    /// Re-checks invariants that span several fields.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        if self.program.is_empty() {
            return Err(CellblockError::config("program must not be empty"));
        }
        if self.premounted_runfs.is_none() && self.rootfs.as_os_str().is_empty() {
            return Err(CellblockError::config("rootfs is not set"));
        }
        if self.rlimits.len() > MAX_RLIMITS {
            return Err(CellblockError::config(format!(
                "at most {MAX_RLIMITS} rlimits may be set"
            )));
        }
        self.cpu.validate()?;
        if let Some(device) = self
            .devices
            .iter()
            .find(|d| d.copy_minor_from_host && d.minor.is_some())
        {
            return Err(CellblockError::config(format!(
                "device {} copies its minor from the host and cannot set one",
                device.path.display()
            )));
        }
        let _uid = self.uid_map.outside_id(self.uid)?;
        let _gid = self.gid_map.outside_id(self.gid)?;
        Ok(())
    }

    /// Directory bind-mounted as the container root.
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Remount flags of the rootfs bind mount; empty when never set.
    pub const fn rootfs_mount_flags(&self) -> MsFlags {
        self.rootfs_mount_flags
    }

    /// Argv of the program.
    pub fn program(&self) -> &[String] {
        &self.program
    }

    /// UID inside the container.
    pub const fn uid(&self) -> u32 {
        self.uid
    }

    /// GID inside the container.
    pub const fn gid(&self) -> u32 {
        self.gid
    }

    /// User-namespace UID map.
    pub const fn uid_map(&self) -> &IdMap {
        &self.uid_map
    }

    /// User-namespace GID map.
    pub const fn gid_map(&self) -> &IdMap {
        &self.gid_map
    }

    /// Mounts in mount order.
    pub fn mounts(&self) -> &[MountSpec] {
        &self.mounts
    }

    /// Device nodes in creation order.
    pub fn devices(&self) -> &[DeviceSpec] {
        &self.devices
    }

    /// Cgroup device rules, explicit and derived, in insertion order.
    pub fn cgroup_devices(&self) -> &[CgroupDeviceRule] {
        &self.cgroup_devices
    }

    /// CPU controller parameters.
    pub const fn cpu(&self) -> &CpuParams {
        &self.cpu
    }

    /// Parent cgroup, relative to each controller root.
    pub fn cgroup_parent(&self) -> Option<&Path> {
        self.cgroup_parent.as_deref()
    }

    /// Owner of the cgroup directories, inside the container.
    pub const fn cgroup_owner(&self) -> (u32, u32) {
        (self.cgroup_owner_uid, self.cgroup_owner_gid)
    }

    /// Whether the container shares the host's network namespace.
    pub const fn shares_host_netns(&self) -> bool {
        self.share_host_netns
    }

    /// Whether the launcher's descriptors stay open in the container.
    pub const fn keeps_fds_open(&self) -> bool {
        self.keep_fds_open
    }

    /// Resource limits.
    pub fn rlimits(&self) -> &[Rlimit] {
        &self.rlimits
    }

    /// Alternate syscall table.
    pub fn alt_syscall_table(&self) -> Option<&str> {
        self.alt_syscall_table.as_deref()
    }

    /// Capability mask.
    pub const fn capmask(&self) -> Option<Capmask> {
        self.capmask
    }

    /// Securebits left unlocked.
    pub const fn securebits_skip_mask(&self) -> u64 {
        self.securebits_skip_mask
    }

    /// Whether the program is PID 1 of its namespace.
    pub const fn run_as_init(&self) -> bool {
        self.run_as_init
    }

    /// SELinux exec context.
    pub fn selinux_context(&self) -> Option<&str> {
        self.selinux_context.as_deref()
    }

    /// Caller-supplied pre-exec action.
    pub const fn pre_execve_hook(&self) -> Option<&PreExecHook> {
        self.pre_execve_hook.as_ref()
    }

    /// Descriptors passed through to the program.
    pub fn inherited_fds(&self) -> &[RawFd] {
        self.inherited_fds.as_deref().unwrap_or_default()
    }

    /// Base of relative loopback sources.
    pub fn config_root(&self) -> Option<&Path> {
        self.config_root.as_deref()
    }

    /// Already-mounted root used instead of a run directory.
    pub fn premounted_runfs(&self) -> Option<&Path> {
        self.premounted_runfs.as_deref()
    }

    /// Explicit pid file path.
    pub fn pid_file(&self) -> Option<&Path> {
        self.pid_file.as_deref()
    }

    /// `setfiles` binary used to relabel host-side mounts.
    pub fn run_setfiles(&self) -> Option<&Path> {
        self.run_setfiles.as_deref()
    }
}
