//! Kernel device-mapper backend.
//!
//! Talks to `/dev/mapper/control` with the raw `DM_*` ioctls: create the
//! device, load a single read-only target, then resume it to make the
//! table live. The node under `/dev/mapper` is created if udev has not
//! done so yet.

use std::fs::{File, OpenOptions};
use std::mem::size_of;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use cellblock_common::constants::{DEV_MAPPER_CONTROL, DEV_MAPPER_DIR};
use cellblock_common::error::{CellblockError, Result};
use nix::errno::Errno;
use nix::sys::stat::{Mode, SFlag};

use super::devmapper::{DM_NAME_LEN, DeviceMapper, MappedDevice, VerityTable, mapper_name};

const DM_VERSION: [u32; 3] = [4, 0, 0];
const DM_UUID_LEN: usize = 129;
const DM_MAX_TYPE_NAME: usize = 16;
const DM_READONLY_FLAG: u32 = 1;
const PARAMS_CAPACITY: usize = 4096;

/// `struct dm_ioctl` from `<linux/dm-ioctl.h>`.
#[repr(C)]
#[derive(Debug)]
struct DmIoctl {
    version: [u32; 3],
    data_size: u32,
    data_start: u32,
    target_count: u32,
    open_count: i32,
    flags: u32,
    event_nr: u32,
    padding: u32,
    dev: u64,
    name: [u8; DM_NAME_LEN],
    uuid: [u8; DM_UUID_LEN],
    data: [u8; 7],
}

/// `struct dm_target_spec` from `<linux/dm-ioctl.h>`.
#[repr(C)]
#[derive(Debug)]
struct DmTargetSpec {
    sector_start: u64,
    length: u64,
    status: i32,
    next: u32,
    target_type: [u8; DM_MAX_TYPE_NAME],
}

/// Header, one target, and its NUL-terminated parameters, laid out the
/// way `DM_TABLE_LOAD` reads them.
#[repr(C)]
#[derive(Debug)]
struct DmTableLoad {
    header: DmIoctl,
    target: DmTargetSpec,
    params: [u8; PARAMS_CAPACITY],
}

const _: () = assert!(size_of::<DmIoctl>() == 312);
const _: () = assert!(size_of::<DmTargetSpec>() == 40);

mod sys {
    use super::DmIoctl;

    const DM_IOCTL: u8 = 0xfd;

    nix::ioctl_readwrite!(dm_dev_create, DM_IOCTL, 3, DmIoctl);
    nix::ioctl_readwrite!(dm_dev_remove, DM_IOCTL, 4, DmIoctl);
    nix::ioctl_readwrite!(dm_dev_suspend, DM_IOCTL, 6, DmIoctl);
    nix::ioctl_readwrite!(dm_table_load, DM_IOCTL, 9, DmIoctl);
}

#[allow(clippy::cast_possible_truncation)]
const HEADER_SIZE: u32 = size_of::<DmIoctl>() as u32;
#[allow(clippy::cast_possible_truncation)]
const TABLE_LOAD_SIZE: u32 = size_of::<DmTableLoad>() as u32;
#[allow(clippy::cast_possible_truncation)]
const TARGET_STRIDE: u32 = (size_of::<DmTargetSpec>() + PARAMS_CAPACITY) as u32;

impl DmIoctl {
    fn new(name: &str, flags: u32) -> Result<Self> {
        let mut header = Self {
            version: DM_VERSION,
            data_size: HEADER_SIZE,
            data_start: HEADER_SIZE,
            target_count: 0,
            open_count: 0,
            flags,
            event_nr: 0,
            padding: 0,
            dev: 0,
            name: [0; DM_NAME_LEN],
            uuid: [0; DM_UUID_LEN],
            data: [0; 7],
        };
        copy_nul_terminated(&mut header.name, name, "device-mapper name")?;
        Ok(header)
    }
}

fn copy_nul_terminated(dst: &mut [u8], src: &str, what: &str) -> Result<()> {
    let bytes = src.as_bytes();
    if bytes.len() >= dst.len() {
        return Err(CellblockError::config(format!(
            "{what} \"{src}\" exceeds {} bytes",
            dst.len() - 1
        )));
    }
    dst[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// [`DeviceMapper`] backed by the running kernel.
#[derive(Debug, Clone)]
pub struct KernelMapper {
    control: PathBuf,
    mapper_dir: PathBuf,
}

impl Default for KernelMapper {
    fn default() -> Self {
        Self {
            control: PathBuf::from(DEV_MAPPER_CONTROL),
            mapper_dir: PathBuf::from(DEV_MAPPER_DIR),
        }
    }
}

impl KernelMapper {
    fn open_control(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.control)
            .map_err(|e| CellblockError::Io {
                path: self.control.clone(),
                source: e,
            })
    }

    fn load_table(control: &File, name: &str, table: &VerityTable) -> Result<()> {
        let mut load = Box::new(DmTableLoad {
            header: DmIoctl::new(name, DM_READONLY_FLAG)?,
            target: DmTargetSpec {
                sector_start: table.start,
                length: table.length,
                status: 0,
                next: TARGET_STRIDE,
                target_type: [0; DM_MAX_TYPE_NAME],
            },
            params: [0; PARAMS_CAPACITY],
        });
        load.header.data_size = TABLE_LOAD_SIZE;
        load.header.target_count = 1;
        copy_nul_terminated(&mut load.target.target_type, &table.target_type, "target type")?;
        copy_nul_terminated(&mut load.params, &table.params, "verity parameters")?;

        let ptr: *mut DmTableLoad = &raw mut *load;
        // SAFETY: `ptr` points to a live, fully initialised `DmTableLoad`
        // whose first field is the `DmIoctl` header; `data_size` covers the
        // whole allocation.
        let _ = unsafe { sys::dm_table_load(control.as_raw_fd(), ptr.cast::<DmIoctl>()) }
            .map_err(|e| CellblockError::sys(format!("DM_TABLE_LOAD {name}"), e))?;
        Ok(())
    }

    fn resume(control: &File, name: &str) -> Result<u64> {
        let mut header = DmIoctl::new(name, 0)?;
        // SAFETY: `header` is a valid, initialised `dm_ioctl` for the call.
        let _ = unsafe { sys::dm_dev_suspend(control.as_raw_fd(), &raw mut header) }
            .map_err(|e| CellblockError::sys(format!("DM_DEV_SUSPEND {name}"), e))?;
        Ok(header.dev)
    }

    fn remove_device(control: &File, name: &str) -> Result<()> {
        let mut header = DmIoctl::new(name, 0)?;
        // SAFETY: `header` is a valid, initialised `dm_ioctl` for the call.
        let _ = unsafe { sys::dm_dev_remove(control.as_raw_fd(), &raw mut header) }
            .map_err(|e| CellblockError::sys(format!("DM_DEV_REMOVE {name}"), e))?;
        Ok(())
    }

    fn ensure_node(path: &Path, dev: u64) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        match nix::sys::stat::mknod(path, SFlag::S_IFBLK, Mode::from_bits_truncate(0o600), dev) {
            Ok(()) | Err(Errno::EEXIST) => Ok(()),
            Err(e) => Err(CellblockError::sys(format!("mknod {}", path.display()), e)),
        }
    }
}

impl DeviceMapper for KernelMapper {
    fn setup_verity(
        &self,
        source: &Path,
        device: &Path,
        table: &str,
    ) -> Result<Option<MappedDevice>> {
        let name = mapper_name(source)?;
        let table = VerityTable::parse(table, device)?;
        let control = self.open_control()?;

        let mut header = DmIoctl::new(&name, 0)?;
        // SAFETY: `header` is a valid, initialised `dm_ioctl` for the call.
        let _ = unsafe { sys::dm_dev_create(control.as_raw_fd(), &raw mut header) }
            .map_err(|e| CellblockError::sys(format!("DM_DEV_CREATE {name}"), e))?;

        let path = self.mapper_dir.join(&name);
        let activated = Self::load_table(&control, &name, &table)
            .and_then(|()| Self::resume(&control, &name))
            .and_then(|dev| Self::ensure_node(&path, dev));
        if let Err(e) = activated {
            if let Err(cleanup) = Self::remove_device(&control, &name) {
                tracing::warn!(%name, error = %cleanup, "failed to remove half-built target");
            }
            return Err(e);
        }

        tracing::info!(
            %name,
            device = %device.display(),
            path = %path.display(),
            "verity target created"
        );
        Ok(Some(MappedDevice { name, path }))
    }

    fn remove(&self, name: &str) -> Result<()> {
        let control = self.open_control()?;
        Self::remove_device(&control, name)?;
        let node = self.mapper_dir.join(name);
        match std::fs::remove_file(&node) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CellblockError::Io {
                    path: node,
                    source: e,
                });
            }
        }
        tracing::info!(name, "verity target removed");
        Ok(())
    }
}
