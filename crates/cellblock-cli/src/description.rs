//! JSON container descriptions and their conversion into a runtime
//! [`Config`].
//!
//! A description looks like:
//!
//! ```json
//! {
//!   "rootfs": "/opt/android/rootfs",
//!   "program": ["/init"],
//!   "uid_map": "0 655360 5000",
//!   "mounts": [
//!     { "source": "tmpfs", "destination": "/tmp", "type": "tmpfs",
//!       "options": ["nosuid", "nodev", "noexec", "mode=1777"] }
//!   ],
//!   "rlimits": [{ "type": "RLIMIT_NOFILE", "soft": 1024, "hard": 4096 }]
//! }
//! ```
//!
//! Every value goes through the validating setters of [`Config`], so a
//! description that converts cleanly is one the launcher accepts.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use cellblock_common::types::DeviceType;
use cellblock_core::cgroup::CgroupDeviceRule;
use cellblock_core::rlimit::{Rlimit, resource_from_name};
use cellblock_runtime::config::{Config, DeviceSpec, MountSpec};
use nix::mount::MsFlags;
use serde::Deserialize;

/// Top-level container description.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerDescription {
    /// Directory bind-mounted as the container root.
    pub rootfs: Option<PathBuf>,
    /// Mount options applied to the rootfs bind, e.g. `["ro"]`.
    pub rootfs_options: Vec<String>,
    /// Use this already-mounted directory as the root instead.
    pub premounted_runfs: Option<PathBuf>,
    /// Argv of the program.
    pub program: Vec<String>,
    /// UID the program runs as.
    pub uid: u32,
    /// GID the program runs as.
    pub gid: u32,
    /// `"inside outside length"` ranges, comma separated.
    pub uid_map: Option<String>,
    /// `"inside outside length"` ranges, comma separated.
    pub gid_map: Option<String>,
    /// Mounts, in order.
    pub mounts: Vec<MountEntry>,
    /// Device nodes.
    pub devices: Vec<DeviceEntry>,
    /// Cgroup placement and limits.
    pub cgroup: CgroupEntry,
    /// Resource limits.
    pub rlimits: Vec<RlimitEntry>,
    /// Stay in the host network namespace.
    pub share_host_netns: bool,
    /// Do not close the launcher's descriptors in the child.
    pub keep_fds_open: bool,
    /// Alternate syscall table name.
    pub alt_syscall_table: Option<String>,
    /// Capability bounding mask.
    pub capmask: Option<u64>,
    /// Also raise the masked capabilities as ambient.
    pub ambient_caps: bool,
    /// Securebits left unlocked.
    pub securebits_skip_mask: u64,
    /// Run the program as PID 1; `false` puts a minimal init above it.
    pub run_as_init: Option<bool>,
    /// SELinux context the program is executed in.
    pub selinux_context: Option<String>,
    /// Base directory for relative loopback sources.
    pub config_root: Option<PathBuf>,
    /// Where to write the container pid.
    pub pid_file: Option<PathBuf>,
    /// `setfiles` binary used to relabel external mounts.
    pub setfiles: Option<PathBuf>,
}

/// One mount.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountEntry {
    /// Label used in logs; defaults to the destination.
    pub name: Option<String>,
    /// Source path or pseudo-filesystem name.
    pub source: PathBuf,
    /// Mount point inside the container.
    pub destination: PathBuf,
    /// Filesystem type; empty for bind mounts.
    #[serde(rename = "type")]
    pub fstype: String,
    /// Flag names and launcher options; anything else becomes mount data.
    pub options: Vec<String>,
    /// dm-verity table; `@DEV@` stands for the backing device.
    pub verity: Option<String>,
    /// Owner of a created mount point.
    pub uid: u32,
    /// Group of a created mount point.
    pub gid: u32,
    /// Mode of a created mount point; `0o755` when absent.
    pub mode: Option<u32>,
}

/// One device node.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceEntry {
    /// `"char"` or `"block"`.
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    /// Node path inside the container.
    pub path: PathBuf,
    /// Permission bits.
    #[serde(default = "default_device_mode")]
    pub mode: u32,
    /// Major number.
    pub major: u32,
    /// Minor number.
    #[serde(default)]
    pub minor: Option<u32>,
    /// Copy the minor number from the host node at `path`.
    #[serde(default)]
    pub copy_minor: bool,
    /// Owner inside the container.
    #[serde(default)]
    pub uid: u32,
    /// Group inside the container.
    #[serde(default)]
    pub gid: u32,
    /// Cgroup access, any of `r`, `w`, `m`.
    #[serde(default)]
    pub access: String,
}

/// Cgroup settings.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CgroupEntry {
    /// Parent cgroup below each controller root.
    pub parent: Option<PathBuf>,
    /// Owner of the cgroup directories, inside the container.
    pub owner_uid: u32,
    /// Group of the cgroup directories, inside the container.
    pub owner_gid: u32,
    /// `cpu.shares`.
    pub cpu_shares: Option<u64>,
    /// `cpu.cfs_quota_us`; needs `cpu_period_us`.
    pub cpu_quota_us: Option<i64>,
    /// `cpu.cfs_period_us`.
    pub cpu_period_us: Option<u64>,
    /// `cpu.rt_runtime_us`; needs `cpu_rt_period_us`.
    pub cpu_rt_runtime_us: Option<u64>,
    /// `cpu.rt_period_us`.
    pub cpu_rt_period_us: Option<u64>,
    /// Extra device access rules.
    pub devices: Vec<CgroupDeviceEntry>,
}

/// One explicit cgroup device rule.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CgroupDeviceEntry {
    /// Allow rather than deny.
    pub allow: bool,
    /// `"all"`, `"char"`, or `"block"`.
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    /// Major number; absent matches all.
    #[serde(default)]
    pub major: Option<u32>,
    /// Minor number; absent matches all.
    #[serde(default)]
    pub minor: Option<u32>,
    /// Any of `r`, `w`, `m`.
    pub access: String,
}

/// One resource limit.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RlimitEntry {
    /// Resource name, e.g. `RLIMIT_NOFILE` or `nofile`.
    #[serde(rename = "type")]
    pub resource: String,
    /// Soft limit.
    pub soft: u64,
    /// Hard limit.
    pub hard: u64,
}

const fn default_device_mode() -> u32 {
    0o666
}

/// Parsed mount options.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MountOptions {
    flags: MsFlags,
    data: Option<String>,
    mount_in_ns: bool,
    create_if_missing: bool,
    loopback: bool,
}

/// Splits `options` into `mount(2)` flags, launcher switches, and
/// filesystem data.
///
/// Mounts happen inside the container's namespace and create their mount
/// point unless `mount_outside` or `nocreate` say otherwise.
fn parse_mount_options(options: &[String]) -> MountOptions {
    let mut parsed = MountOptions {
        flags: MsFlags::empty(),
        data: None,
        mount_in_ns: true,
        create_if_missing: true,
        loopback: false,
    };
    let mut data = Vec::new();
    for option in options {
        let flag = match option.as_str() {
            "nodev" => MsFlags::MS_NODEV,
            "noexec" => MsFlags::MS_NOEXEC,
            "nosuid" => MsFlags::MS_NOSUID,
            "bind" => MsFlags::MS_BIND,
            "ro" => MsFlags::MS_RDONLY,
            "private" => MsFlags::MS_PRIVATE,
            "recursive" => MsFlags::MS_REC,
            "slave" => MsFlags::MS_SLAVE,
            "remount" => MsFlags::MS_REMOUNT,
            "rw" => MsFlags::empty(),
            "mount_outside" => {
                parsed.mount_in_ns = false;
                continue;
            }
            "nocreate" => {
                parsed.create_if_missing = false;
                continue;
            }
            "loop" => {
                parsed.loopback = true;
                continue;
            }
            other => {
                data.push(other);
                continue;
            }
        };
        parsed.flags |= flag;
    }
    if !data.is_empty() {
        parsed.data = Some(data.join(","));
    }
    parsed
}

fn parse_access(access: &str) -> anyhow::Result<(bool, bool, bool)> {
    let mut rwm = (false, false, false);
    for c in access.chars() {
        match c {
            'r' => rwm.0 = true,
            'w' => rwm.1 = true,
            'm' => rwm.2 = true,
            other => bail!("unknown device access '{other}' in \"{access}\""),
        }
    }
    Ok(rwm)
}

impl ContainerDescription {
    /// Reads a description from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid
    /// description.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("invalid container description {}", path.display()))
    }

    /// Builds the runtime configuration.
    ///
    /// `default_cgroup_parent` applies when the description names no
    /// parent cgroup.
    ///
    /// # Errors
    ///
    /// Returns the first value a [`Config`] setter rejects, or an error if
    /// the finished configuration does not validate.
    pub fn to_config(&self, default_cgroup_parent: Option<&Path>) -> anyhow::Result<Config> {
        let mut config = Config::new();

        if let Some(rootfs) = &self.rootfs {
            config.set_rootfs(rootfs)?;
        }
        if !self.rootfs_options.is_empty() {
            config.set_rootfs_mount_flags(parse_mount_options(&self.rootfs_options).flags);
        }
        if let Some(runfs) = &self.premounted_runfs {
            config.set_premounted_runfs(runfs);
        }
        config.set_program(self.program.iter().cloned())?;
        config.set_uid(self.uid);
        config.set_gid(self.gid);
        if let Some(map) = &self.uid_map {
            config.set_uid_map(map)?;
        }
        if let Some(map) = &self.gid_map {
            config.set_gid_map(map)?;
        }

        for mount in &self.mounts {
            let options = parse_mount_options(&mount.options);
            config
                .add_mount(MountSpec {
                    name: mount
                        .name
                        .clone()
                        .unwrap_or_else(|| mount.destination.display().to_string()),
                    source: mount.source.clone(),
                    destination: mount.destination.clone(),
                    fstype: mount.fstype.clone(),
                    data: options.data,
                    verity: mount.verity.clone(),
                    flags: options.flags,
                    uid: mount.uid,
                    gid: mount.gid,
                    mode: mount.mode.unwrap_or(0o755),
                    mount_in_ns: options.mount_in_ns,
                    create_if_missing: options.create_if_missing,
                    loopback: options.loopback,
                })
                .with_context(|| format!("mount {}", mount.destination.display()))?;
        }

        for device in &self.devices {
            let (read, write, modify) = parse_access(&device.access)?;
            config
                .add_device(DeviceSpec {
                    device_type: device.device_type,
                    path: device.path.clone(),
                    mode: device.mode,
                    major: device.major,
                    minor: device.minor,
                    copy_minor_from_host: device.copy_minor,
                    uid: device.uid,
                    gid: device.gid,
                    read,
                    write,
                    modify,
                })
                .with_context(|| format!("device {}", device.path.display()))?;
        }

        self.apply_cgroup(&mut config, default_cgroup_parent)?;

        for limit in &self.rlimits {
            config.add_rlimit(Rlimit {
                resource: resource_from_name(&limit.resource)?,
                soft: limit.soft,
                hard: limit.hard,
            })?;
        }

        if self.share_host_netns {
            config.share_host_netns();
        }
        if self.keep_fds_open {
            config.keep_fds_open();
        }
        if let Some(table) = &self.alt_syscall_table {
            config.set_alt_syscall_table(table);
        }
        if let Some(mask) = self.capmask {
            config.set_capmask(mask, self.ambient_caps);
        }
        config.set_securebits_skip_mask(self.securebits_skip_mask);
        if let Some(run_as_init) = self.run_as_init {
            config.set_run_as_init(run_as_init);
        }
        if let Some(context) = &self.selinux_context {
            config.set_selinux_context(context);
        }
        if let Some(root) = &self.config_root {
            config.set_config_root(root);
        }
        if let Some(path) = &self.pid_file {
            config.set_pid_file(path);
        }
        if let Some(setfiles) = &self.setfiles {
            config.set_run_setfiles(setfiles);
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_cgroup(&self, config: &mut Config, default_parent: Option<&Path>) -> anyhow::Result<()> {
        let cgroup = &self.cgroup;
        if let Some(parent) = cgroup.parent.as_deref().or(default_parent) {
            config.set_cgroup_parent(parent, cgroup.owner_uid, cgroup.owner_gid);
        }
        if let Some(shares) = cgroup.cpu_shares {
            config.set_cpu_shares(shares)?;
        }
        match (cgroup.cpu_quota_us, cgroup.cpu_period_us) {
            (Some(quota), Some(period)) => config.set_cpu_cfs_params(quota, period)?,
            (None, None) => {}
            _ => bail!("cpu_quota_us and cpu_period_us must be set together"),
        }
        match (cgroup.cpu_rt_runtime_us, cgroup.cpu_rt_period_us) {
            (Some(runtime), Some(period)) => config.set_cpu_rt_params(runtime, period)?,
            (None, None) => {}
            _ => bail!("cpu_rt_runtime_us and cpu_rt_period_us must be set together"),
        }
        for rule in &cgroup.devices {
            let (read, write, modify) = parse_access(&rule.access)?;
            config.add_cgroup_device(CgroupDeviceRule {
                allow: rule.allow,
                device_type: rule.device_type,
                major: rule.major,
                minor: rule.minor,
                read,
                write,
                modify,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn parse(json: &str) -> ContainerDescription {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn flag_names_map_to_mount_flags() {
        let parsed = parse_mount_options(&options(&["bind", "recursive", "ro", "nosuid"]));
        assert_eq!(
            parsed.flags,
            MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_RDONLY | MsFlags::MS_NOSUID
        );
        assert!(parsed.data.is_none());
        assert!(parsed.mount_in_ns);
        assert!(parsed.create_if_missing);
    }

    #[test]
    fn unknown_options_become_mount_data() {
        let parsed = parse_mount_options(&options(&["nodev", "mode=0755", "uid=1000"]));
        assert_eq!(parsed.flags, MsFlags::MS_NODEV);
        assert_eq!(parsed.data.as_deref(), Some("mode=0755,uid=1000"));
    }

    #[test]
    fn launcher_options_are_not_flags() {
        let parsed = parse_mount_options(&options(&["mount_outside", "nocreate", "loop", "rw"]));
        assert!(parsed.flags.is_empty());
        assert!(!parsed.mount_in_ns);
        assert!(!parsed.create_if_missing);
        assert!(parsed.loopback);
        assert!(parsed.data.is_none());
    }

    #[test]
    fn full_description_converts() {
        let description = parse(
            r#"{
                "rootfs": "/opt/rootfs",
                "rootfs_options": ["ro"],
                "program": ["/init", "--verbose"],
                "uid": 1000,
                "uid_map": "0 655360 5000",
                "gid_map": "0 655360 5000",
                "mounts": [
                    { "source": "tmpfs", "destination": "/tmp", "type": "tmpfs",
                      "options": ["mount_outside", "nosuid", "mode=1777"] },
                    { "source": "proc", "destination": "/proc", "type": "proc" }
                ],
                "devices": [
                    { "type": "char", "path": "/dev/null", "major": 1, "minor": 3,
                      "access": "rw" }
                ],
                "cgroup": { "parent": "android", "cpu_shares": 512,
                            "cpu_quota_us": 50000, "cpu_period_us": 100000 },
                "rlimits": [{ "type": "RLIMIT_NOFILE", "soft": 1024, "hard": 4096 }],
                "capmask": 255,
                "run_as_init": false
            }"#,
        );
        let config = description.to_config(None).unwrap();

        assert_eq!(config.rootfs(), Path::new("/opt/rootfs"));
        assert!(config.rootfs_mount_flags().contains(MsFlags::MS_RDONLY | MsFlags::MS_BIND));
        assert_eq!(config.program(), ["/init", "--verbose"]);
        assert_eq!(config.uid_map().outside_id(1000).unwrap(), 656_360);

        let mounts = config.mounts();
        assert_eq!(mounts.len(), 2);
        assert!(!mounts[0].mount_in_ns);
        assert_eq!(mounts[0].data.as_deref(), Some("mode=1777"));
        assert_eq!(mounts[0].name, "/tmp");
        assert!(mounts[1].mount_in_ns);

        assert_eq!(config.devices().len(), 1);
        assert_eq!(config.cgroup_devices().len(), 1);
        assert_eq!(config.cgroup_parent(), Some(Path::new("android")));
        assert_eq!(config.cpu().shares, Some(512));
        assert_eq!(config.rlimits().len(), 1);
        assert_eq!(config.capmask().map(|c| c.mask), Some(255));
        assert!(!config.run_as_init());
    }

    #[test]
    fn default_parent_applies_only_when_unset() {
        let description = parse(r#"{ "rootfs": "/r", "program": ["/init"] }"#);
        let config = description.to_config(Some(Path::new("containers"))).unwrap();
        assert_eq!(config.cgroup_parent(), Some(Path::new("containers")));

        let description =
            parse(r#"{ "rootfs": "/r", "program": ["/init"], "cgroup": { "parent": "own" } }"#);
        let config = description.to_config(Some(Path::new("containers"))).unwrap();
        assert_eq!(config.cgroup_parent(), Some(Path::new("own")));
    }

    #[test]
    fn half_specified_bandwidth_is_rejected() {
        let description = parse(
            r#"{ "rootfs": "/r", "program": ["/init"], "cgroup": { "cpu_quota_us": 1000 } }"#,
        );
        assert!(description.to_config(None).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad_access = parse(
            r#"{ "rootfs": "/r", "program": ["/init"],
                 "devices": [{ "type": "char", "path": "/dev/x", "major": 1, "access": "rx" }] }"#,
        );
        assert!(bad_access.to_config(None).is_err());

        let bad_rlimit = parse(
            r#"{ "rootfs": "/r", "program": ["/init"],
                 "rlimits": [{ "type": "RLIMIT_BOGUS", "soft": 1, "hard": 1 }] }"#,
        );
        assert!(bad_rlimit.to_config(None).is_err());

        let no_program = parse(r#"{ "rootfs": "/r" }"#);
        assert!(no_program.to_config(None).is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<ContainerDescription>(r#"{ "rotfs": "/r" }"#).is_err());
    }

    #[test]
    fn load_reads_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        std::fs::write(&path, r#"{ "rootfs": "/r", "program": ["/init"] }"#).unwrap();
        let description = ContainerDescription::load(&path).unwrap();
        assert_eq!(description.program, ["/init"]);
        assert!(ContainerDescription::load(&dir.path().join("missing.json")).is_err());
    }
}
