//! Device cgroup rules and device nodes for a container.

use std::path::{Path, PathBuf};

use cellblock_common::error::Result;
use cellblock_common::types::DeviceType;
use cellblock_core::cgroup::{Cgroup, CgroupDeviceRule};
use cellblock_core::device::{DeviceNode, create_node, host_device_numbers, host_minor};
use cellblock_core::filesystem::mount::resolve_in_root;
use cellblock_core::syscall::Syscall;

use crate::config::{Config, DeviceSpec};

/// Applies the device access list and creates the device nodes of
/// `config` under `root`.
///
/// Everything is denied first so the configured rules are a strict
/// allow-list. `loop_devices` are the loop devices backing the container's
/// mounts; each gets a read-only block rule.
///
/// # Errors
///
/// Returns the first failing cgroup write, `mknod`, or ownership change,
/// or an error if a loop device cannot be stat'ed.
pub fn setup(
    sys: &dyn Syscall,
    cgroup: &dyn Cgroup,
    config: &Config,
    root: &Path,
    loop_devices: &[PathBuf],
) -> Result<()> {
    cgroup.deny_all_devices()?;
    for rule in config.cgroup_devices() {
        cgroup.add_device(rule)?;
    }

    let mut created = 0usize;
    for device in config.devices() {
        let Some(minor) = resolve_minor(device) else {
            tracing::debug!(
                path = %device.path.display(),
                "host device absent, skipping"
            );
            continue;
        };
        let node = DeviceNode {
            path: resolve_in_root(root, &device.path),
            kind: device.device_type,
            mode: device.mode,
            major: device.major,
            minor,
            uid: config.uid_map().outside_id(device.uid)?,
            gid: config.gid_map().outside_id(device.gid)?,
        };
        create_node(sys, &node)?;
        created += 1;
    }

    for loop_device in loop_devices {
        let (major, minor) = host_device_numbers(loop_device)?;
        cgroup.add_device(&CgroupDeviceRule {
            allow: true,
            device_type: DeviceType::Block,
            major: Some(major),
            minor: Some(minor),
            read: true,
            write: false,
            modify: false,
        })?;
    }

    tracing::info!(
        rules = config.cgroup_devices().len(),
        nodes = created,
        loop_devices = loop_devices.len(),
        "devices configured"
    );
    Ok(())
}

/// Minor number to create `device` with; `None` skips the node.
fn resolve_minor(device: &DeviceSpec) -> Option<u32> {
    if device.copy_minor_from_host {
        host_minor(&device.path)
    } else {
        device.minor
    }
}
