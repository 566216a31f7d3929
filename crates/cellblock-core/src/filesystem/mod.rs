//! Filesystem management for container isolation.
//!
//! Provides mount helpers, loop and device-mapper block devices for
//! image-backed mounts, and `pivot_root` for switching into the
//! container's root.

pub mod devmapper;
#[cfg(feature = "device-mapper")]
pub mod dm_ioctl;
pub mod loopdev;
pub mod mount;
pub mod pivot_root;
