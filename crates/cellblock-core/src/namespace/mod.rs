//! Linux namespace configuration for container isolation.
//!
//! The sandbox creates every namespace in a single `clone(2)`; this module
//! decides which flags that call carries and how IDs map into the new user
//! namespace.

pub mod user;

use nix::sched::CloneFlags;

/// Which namespaces a new container gets.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Isolate PID namespace.
    pub pid: bool,
    /// Isolate mount namespace.
    pub mount: bool,
    /// Isolate network namespace.
    pub network: bool,
    /// Isolate user namespace.
    pub user: bool,
    /// Isolate IPC namespace.
    pub ipc: bool,
    /// Isolate cgroup namespace.
    pub cgroup: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            pid: true,
            mount: true,
            network: true,
            user: true,
            ipc: true,
            cgroup: true,
        }
    }
}

impl NamespaceConfig {
    /// Namespaces for a container; the network namespace is dropped when
    /// the container shares the host's.
    pub fn for_container(share_host_netns: bool) -> Self {
        Self {
            network: !share_host_netns,
            ..Self::default()
        }
    }

    /// Flags to pass to `clone(2)`.
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        flags.set(CloneFlags::CLONE_NEWPID, self.pid);
        flags.set(CloneFlags::CLONE_NEWNS, self.mount);
        flags.set(CloneFlags::CLONE_NEWNET, self.network);
        flags.set(CloneFlags::CLONE_NEWUSER, self.user);
        flags.set(CloneFlags::CLONE_NEWIPC, self.ipc);
        flags.set(CloneFlags::CLONE_NEWCGROUP, self.cgroup);
        flags
    }
}
