//! Device access lists via the cgroup v1 `devices` controller.
//!
//! Rules are written one per line as `<type> <major>:<minor> <access>`,
//! e.g. `c 1:3 rwm`, to `devices.allow` or `devices.deny`.

use std::path::Path;

use cellblock_common::error::{CellblockError, Result};
use cellblock_common::types::DeviceType;

use super::write_control;

/// One entry of a device access list.
///
/// `None` for `major` or `minor` is the `*` wildcard.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CgroupDeviceRule {
    /// `true` writes to `devices.allow`, `false` to `devices.deny`.
    pub allow: bool,
    /// Device type the rule matches.
    pub device_type: DeviceType,
    /// Major number, or every major.
    pub major: Option<u32>,
    /// Minor number, or every minor.
    pub minor: Option<u32>,
    /// Grants or denies `read`.
    pub read: bool,
    /// Grants or denies `write`.
    pub write: bool,
    /// Grants or denies `mknod`.
    pub modify: bool,
}

impl CgroupDeviceRule {
    /// Renders the rule in the kernel's access-list syntax.
    ///
    /// # Errors
    ///
    /// Returns an error if none of read, write, or modify is set.
    pub fn to_line(&self) -> Result<String> {
        let mut access = String::with_capacity(3);
        if self.read {
            access.push('r');
        }
        if self.write {
            access.push('w');
        }
        if self.modify {
            access.push('m');
        }
        if access.is_empty() {
            return Err(CellblockError::config(format!(
                "device rule {}:{} grants no access",
                number_or_wildcard(self.major),
                number_or_wildcard(self.minor)
            )));
        }
        Ok(format!(
            "{} {}:{} {access}",
            self.device_type,
            number_or_wildcard(self.major),
            number_or_wildcard(self.minor)
        ))
    }

    const fn control_file(&self) -> &'static str {
        if self.allow {
            "devices.allow"
        } else {
            "devices.deny"
        }
    }
}

fn number_or_wildcard(n: Option<u32>) -> String {
    n.map_or_else(|| "*".to_string(), |n| n.to_string())
}

/// Removes every device from the access list.
///
/// # Errors
///
/// Returns an error if writing to `devices.deny` fails.
pub fn deny_all(dir: &Path) -> Result<()> {
    write_control(dir, "devices.deny", "a")?;
    tracing::debug!(path = %dir.display(), "all devices denied");
    Ok(())
}

/// Appends `rule` to the access list.
///
/// # Errors
///
/// Returns an error if the rule is empty or the write fails.
pub fn add_rule(dir: &Path, rule: &CgroupDeviceRule) -> Result<()> {
    let line = rule.to_line()?;
    write_control(dir, rule.control_file(), &line)?;
    tracing::debug!(rule = %line, allow = rule.allow, "device rule added");
    Ok(())
}
