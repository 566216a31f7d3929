//! # cellblock-core
//!
//! Low-level Linux isolation primitives for the cellblock launcher.
//!
//! This crate provides safe abstractions over:
//! - **Cgroups v1**: per-controller directories, CPU bandwidth, device
//!   allow/deny lists, freezer, and cpuset inheritance.
//! - **Namespaces**: clone flags and user-namespace UID/GID maps.
//! - **Filesystem**: mounts, loop devices, dm-verity targets, and `pivot_root`.
//! - **Devices**: device node creation inside a container root.
//! - **Privileges**: capability masks, securebits, rlimits, alternate syscall
//!   tables, and SELinux exec contexts.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod alt_syscall;
pub mod capability;
pub mod cgroup;
pub mod device;
pub mod fd;
pub mod filesystem;
pub mod namespace;
pub mod rlimit;
pub mod selinux;
pub mod syscall;
