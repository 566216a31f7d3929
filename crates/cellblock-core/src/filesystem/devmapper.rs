//! dm-verity targets for integrity-checked image mounts.
//!
//! A verity mount carries a one-line device-mapper table whose `@DEV@`
//! placeholder is replaced by the (loop) device backing the image. The
//! resulting read-only target appears at `/dev/mapper/<name>` and is
//! mounted instead of the raw device.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cellblock_common::constants::{DM_NAME_PREFIX, VERITY_DEVICE_PLACEHOLDER};
use cellblock_common::error::{CellblockError, Result};

/// Kernel limit on a device-mapper name, including the NUL.
pub const DM_NAME_LEN: usize = 128;

/// A device-mapper target created for a mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedDevice {
    /// Device-mapper name; used to remove the target.
    pub name: String,
    /// Node to mount in place of the backing device.
    pub path: PathBuf,
}

/// Creates and removes dm-verity targets.
pub trait DeviceMapper: fmt::Debug + Send + Sync {
    /// Sets up a read-only verity target over `device`.
    ///
    /// `source` is the mount source the target is named after. Returns
    /// `None` when this mapper does not create targets, in which case the
    /// caller mounts `device` directly.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is malformed or the kernel rejects it.
    fn setup_verity(&self, source: &Path, device: &Path, table: &str)
    -> Result<Option<MappedDevice>>;

    /// Removes the target called `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses to remove the target.
    fn remove(&self, name: &str) -> Result<()>;
}

/// A single-target table line, `start length type params...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityTable {
    /// First sector covered by the target.
    pub start: u64,
    /// Number of sectors covered.
    pub length: u64,
    /// Target type, normally `verity`.
    pub target_type: String,
    /// Target parameters with the device placeholder substituted.
    pub params: String,
}

impl VerityTable {
    /// Parses `line`, substituting every `@DEV@` with `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if the line has fewer than four fields or the
    /// sector numbers are not integers.
    pub fn parse(line: &str, device: &Path) -> Result<Self> {
        let line = line.replace(VERITY_DEVICE_PLACEHOLDER, &device.to_string_lossy());
        let mut fields = line.split_whitespace();
        let (Some(start), Some(length), Some(target_type)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(CellblockError::config(format!(
                "verity table \"{line}\" needs start, length, and type"
            )));
        };
        let params = fields.collect::<Vec<_>>().join(" ");
        if params.is_empty() {
            return Err(CellblockError::config(format!(
                "verity table \"{line}\" has no target parameters"
            )));
        }
        let sector = |field: &str| {
            field.parse::<u64>().map_err(|e| {
                CellblockError::config(format!("invalid sector \"{field}\" in verity table: {e}"))
            })
        };
        Ok(Self {
            start: sector(start)?,
            length: sector(length)?,
            target_type: target_type.to_string(),
            params,
        })
    }
}

/// Device-mapper name for a mount source: `cellblock-` followed by the
/// source path with `/` replaced by `_`.
///
/// # Errors
///
/// Returns an error if the name would exceed the kernel's limit.
pub fn mapper_name(source: &Path) -> Result<String> {
    let name = format!(
        "{DM_NAME_PREFIX}-{}",
        source.to_string_lossy().replace('/', "_")
    );
    if name.len() >= DM_NAME_LEN {
        return Err(CellblockError::config(format!(
            "device-mapper name for {} is too long",
            source.display()
        )));
    }
    Ok(name)
}

/// Mapper that never creates targets; verity mounts use the raw device.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMapper;

impl DeviceMapper for NoopMapper {
    fn setup_verity(
        &self,
        source: &Path,
        _device: &Path,
        _table: &str,
    ) -> Result<Option<MappedDevice>> {
        tracing::warn!(
            source = %source.display(),
            "device-mapper support not built, mounting without verity"
        );
        Ok(None)
    }

    fn remove(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// The mapper selected at build time.
pub fn default_mapper() -> Arc<dyn DeviceMapper> {
    #[cfg(feature = "device-mapper")]
    {
        Arc::new(super::dm_ioctl::KernelMapper::default())
    }
    #[cfg(not(feature = "device-mapper"))]
    {
        Arc::new(NoopMapper)
    }
}
