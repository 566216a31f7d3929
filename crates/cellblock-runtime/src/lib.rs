//! Container lifecycle management for the cellblock launcher.
//!
//! A [`config::Config`] describes the container; a [`container::Container`]
//! turns it into a run directory, a cgroup, mounts, device nodes, and a
//! sandboxed child process, and tears all of that down again when the
//! child exits.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod container;
pub mod devices;
pub mod jail;
pub mod mounts;
pub mod process;
pub mod setfiles;
