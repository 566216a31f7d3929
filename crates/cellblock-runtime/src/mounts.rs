//! Mount orchestration and the resource ledger.
//!
//! Every kernel resource acquired for a mount (an external mount, a loop
//! device, a device-mapper target) is wrapped in a [`ResourceGuard`] the
//! moment it exists. A guard releases its resource when dropped unless it
//! has been committed to the container's [`Ledger`], which in turn releases
//! everything it holds in reverse order at teardown.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cellblock_common::error::Result;
use cellblock_core::filesystem::devmapper::DeviceMapper;
use cellblock_core::filesystem::mount::{create_destination, mount_with_remount, resolve_in_root};
use cellblock_core::syscall::Syscall;
use nix::mount::{MntFlags, MsFlags};

use crate::config::{Config, MountSpec};

/// A kernel resource the container must release at teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Mount point on the host, under the container root.
    Mount(PathBuf),
    /// Attached loop device node.
    LoopDevice(PathBuf),
    /// Device-mapper target name.
    Mapper(String),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mount(path) => write!(f, "mount {}", path.display()),
            Self::LoopDevice(path) => write!(f, "loop device {}", path.display()),
            Self::Mapper(name) => write!(f, "device-mapper target {name}"),
        }
    }
}

#[derive(Debug, Clone)]
struct Releaser {
    sys: Arc<dyn Syscall>,
    mapper: Arc<dyn DeviceMapper>,
}

impl Releaser {
    fn release(&self, resource: &Resource) -> Result<()> {
        match resource {
            Resource::Mount(path) => self.sys.umount(path, MntFlags::empty()),
            Resource::LoopDevice(path) => self.sys.detach_loop(path),
            Resource::Mapper(name) => self.mapper.remove(name),
        }?;
        tracing::debug!(%resource, "released");
        Ok(())
    }
}

/// Releases one resource on drop unless committed to a [`Ledger`].
#[must_use = "dropping a guard releases its resource immediately"]
#[derive(Debug)]
pub struct ResourceGuard {
    resource: Option<Resource>,
    releaser: Releaser,
}

impl ResourceGuard {
    /// The guarded resource.
    pub const fn resource(&self) -> Option<&Resource> {
        self.resource.as_ref()
    }

    fn into_resource(mut self) -> Option<Resource> {
        self.resource.take()
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            if let Err(e) = self.releaser.release(&resource) {
                tracing::warn!(%resource, error = %e, "failed to release resource");
            }
        }
    }
}

/// Resources a container holds, in acquisition order per kind.
///
/// An entry exists exactly as long as its resource is attached.
#[derive(Debug)]
pub struct Ledger {
    mounts: Vec<PathBuf>,
    loop_devices: Vec<PathBuf>,
    mappers: Vec<String>,
    releaser: Releaser,
}

impl Ledger {
    /// Creates an empty ledger that releases through `sys` and `mapper`.
    pub fn new(sys: Arc<dyn Syscall>, mapper: Arc<dyn DeviceMapper>) -> Self {
        Self {
            mounts: Vec::new(),
            loop_devices: Vec::new(),
            mappers: Vec::new(),
            releaser: Releaser { sys, mapper },
        }
    }

    /// Wraps a freshly acquired resource in a guard.
    pub fn guard(&self, resource: Resource) -> ResourceGuard {
        ResourceGuard {
            resource: Some(resource),
            releaser: self.releaser.clone(),
        }
    }

    /// Transfers ownership of a guarded resource to the ledger.
    pub fn commit(&mut self, guard: ResourceGuard) {
        match guard.into_resource() {
            Some(Resource::Mount(path)) => self.mounts.push(path),
            Some(Resource::LoopDevice(path)) => self.loop_devices.push(path),
            Some(Resource::Mapper(name)) => self.mappers.push(name),
            None => {}
        }
    }

    /// External mount points, in mount order.
    pub fn mounts(&self) -> &[PathBuf] {
        &self.mounts
    }

    /// Attached loop devices, in attach order.
    pub fn loop_devices(&self) -> &[PathBuf] {
        &self.loop_devices
    }

    /// Device-mapper targets, in creation order.
    pub fn mappers(&self) -> &[String] {
        &self.mappers
    }

    /// Whether the ledger holds nothing.
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty() && self.loop_devices.is_empty() && self.mappers.is_empty()
    }

    /// Syscall backend the ledger releases through.
    pub fn syscall(&self) -> &dyn Syscall {
        self.releaser.sys.as_ref()
    }

    /// Device mapper the ledger releases through.
    pub fn mapper(&self) -> &dyn DeviceMapper {
        self.releaser.mapper.as_ref()
    }

    /// Releases everything: mounts, then mapper targets, then loop devices,
    /// each newest first.
    ///
    /// Every entry is attempted and removed even when a release fails.
    ///
    /// # Errors
    ///
    /// Returns the first release error.
    pub fn drain(&mut self) -> Result<()> {
        let resources: Vec<Resource> = self
            .mounts
            .drain(..)
            .rev()
            .map(Resource::Mount)
            .chain(self.mappers.drain(..).rev().map(Resource::Mapper))
            .chain(self.loop_devices.drain(..).rev().map(Resource::LoopDevice))
            .collect();

        let mut first_error = None;
        for resource in resources {
            if let Err(e) = self.releaser.release(&resource) {
                tracing::warn!(%resource, error = %e, "failed to release resource");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Ledger {
    fn drop(&mut self) {
        if !self.is_empty() {
            let _ = self.drain();
        }
    }
}

/// A mount the sandbox performs inside the new mount namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsMount {
    /// Source after loop and verity substitution.
    pub source: PathBuf,
    /// Destination inside the container.
    pub destination: PathBuf,
    /// Filesystem type, if any.
    pub fstype: Option<String>,
    /// `mount(2)` flags.
    pub flags: MsFlags,
    /// Filesystem-specific data.
    pub data: Option<String>,
}

/// Host path a mount's source resolves to.
///
/// Relative bind sources live in the container root; relative loopback
/// sources are taken from the config root when one is set.
pub fn resolve_source(spec: &MountSpec, root: &Path, config_root: Option<&Path>) -> PathBuf {
    if spec.source.is_absolute() {
        return spec.source.clone();
    }
    if spec.flags.contains(MsFlags::MS_BIND) {
        return resolve_in_root(root, &spec.source);
    }
    match config_root {
        Some(base) if spec.loopback => resolve_in_root(base, &spec.source),
        _ => spec.source.clone(),
    }
}

/// Prepares and performs every mount of `config` against the container
/// root at `root`.
///
/// External mounts and their backing devices end up in `ledger`. Mounts
/// that belong inside the new namespace are returned for the sandbox.
/// On failure the ledger is drained before the error is returned.
///
/// # Errors
///
/// Returns the first failing step.
pub fn mount_all(config: &Config, root: &Path, ledger: &mut Ledger) -> Result<Vec<NsMount>> {
    let mut ns_mounts = Vec::new();
    for spec in config.mounts() {
        match mount_one(config, spec, root, ledger) {
            Ok(Some(ns_mount)) => ns_mounts.push(ns_mount),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(mount = %spec.name, error = %e, "mount failed, unwinding");
                if let Err(cleanup) = ledger.drain() {
                    tracing::warn!(error = %cleanup, "unwind incomplete");
                }
                return Err(e);
            }
        }
    }
    tracing::info!(
        external = ledger.mounts().len(),
        in_namespace = ns_mounts.len(),
        "mounts prepared"
    );
    Ok(ns_mounts)
}

fn mount_one(
    config: &Config,
    spec: &MountSpec,
    root: &Path,
    ledger: &mut Ledger,
) -> Result<Option<NsMount>> {
    let mut guards = Vec::new();
    match prepare_mount(config, spec, root, ledger, &mut guards) {
        Ok(ns_mount) => {
            for guard in guards {
                ledger.commit(guard);
            }
            Ok(ns_mount)
        }
        Err(e) => {
            // Newest first: a mapper target sits on top of its loop device.
            while let Some(guard) = guards.pop() {
                drop(guard);
            }
            Err(e)
        }
    }
}

fn prepare_mount(
    config: &Config,
    spec: &MountSpec,
    root: &Path,
    ledger: &Ledger,
    guards: &mut Vec<ResourceGuard>,
) -> Result<Option<NsMount>> {
    let sys = ledger.syscall();
    let destination = resolve_in_root(root, &spec.destination);
    let mut source = resolve_source(spec, root, config.config_root());

    if spec.create_if_missing && !spec.mount_in_ns {
        let uid = config.uid_map().outside_id(spec.uid)?;
        let gid = config.gid_map().outside_id(spec.gid)?;
        create_destination(sys, &destination, Some(&source), uid, gid, spec.mode)?;
    }

    if spec.loopback {
        let device = sys.attach_loop(&source)?;
        tracing::debug!(
            mount = %spec.name,
            backing = %source.display(),
            device = %device.display(),
            "loop device attached"
        );
        guards.push(ledger.guard(Resource::LoopDevice(device.clone())));
        source = device;
    }
    if let Some(table) = spec.verity.as_deref().filter(|t| !t.is_empty()) {
        if let Some(mapped) = ledger.mapper().setup_verity(&source, &source, table)? {
            guards.push(ledger.guard(Resource::Mapper(mapped.name)));
            source = mapped.path;
        }
    }

    let fstype = (!spec.fstype.is_empty()).then(|| spec.fstype.clone());
    if spec.mount_in_ns {
        return Ok(Some(NsMount {
            source,
            destination: spec.destination.clone(),
            fstype,
            flags: spec.flags,
            data: spec.data.clone(),
        }));
    }

    mount_with_remount(
        sys,
        Some(&source),
        &destination,
        fstype.as_deref(),
        spec.flags,
        spec.data.as_deref(),
    )?;
    tracing::debug!(
        mount = %spec.name,
        source = %source.display(),
        destination = %destination.display(),
        "external mount done"
    );
    guards.push(ledger.guard(Resource::Mount(destination)));
    Ok(None)
}
