//! Resource limits for the container's init process.

use std::fmt;

use cellblock_common::error::{CellblockError, Result};
pub use nix::sys::resource::Resource;

/// One soft/hard limit pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    /// Limited resource.
    pub resource: Resource,
    /// Soft limit.
    pub soft: u64,
    /// Hard limit.
    pub hard: u64,
}

impl fmt::Display for Rlimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}={}/{}", self.resource, self.soft, self.hard)
    }
}

/// Parses a resource name such as `RLIMIT_NOFILE` or `nofile`.
///
/// # Errors
///
/// Returns an error for names the kernel does not know.
pub fn resource_from_name(name: &str) -> Result<Resource> {
    let upper = name.to_ascii_uppercase();
    let short = upper.strip_prefix("RLIMIT_").unwrap_or(&upper);
    let resource = match short {
        "AS" => Resource::RLIMIT_AS,
        "CORE" => Resource::RLIMIT_CORE,
        "CPU" => Resource::RLIMIT_CPU,
        "DATA" => Resource::RLIMIT_DATA,
        "FSIZE" => Resource::RLIMIT_FSIZE,
        "LOCKS" => Resource::RLIMIT_LOCKS,
        "MEMLOCK" => Resource::RLIMIT_MEMLOCK,
        "MSGQUEUE" => Resource::RLIMIT_MSGQUEUE,
        "NICE" => Resource::RLIMIT_NICE,
        "NOFILE" => Resource::RLIMIT_NOFILE,
        "NPROC" => Resource::RLIMIT_NPROC,
        "RSS" => Resource::RLIMIT_RSS,
        "RTPRIO" => Resource::RLIMIT_RTPRIO,
        "RTTIME" => Resource::RLIMIT_RTTIME,
        "SIGPENDING" => Resource::RLIMIT_SIGPENDING,
        "STACK" => Resource::RLIMIT_STACK,
        _ => {
            return Err(CellblockError::config(format!(
                "unknown rlimit \"{name}\""
            )));
        }
    };
    Ok(resource)
}

/// Applies every limit to the calling process.
///
/// Runs in the sandboxed child before `execve(2)`.
///
/// # Errors
///
/// Returns the error of the first failing `setrlimit`.
pub fn apply(limits: &[Rlimit]) -> Result<()> {
    for limit in limits {
        nix::sys::resource::setrlimit(limit.resource, limit.soft, limit.hard)
            .map_err(|e| CellblockError::sys(format!("setrlimit {limit}"), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_with_or_without_prefix() {
        assert_eq!(
            resource_from_name("RLIMIT_NOFILE").unwrap(),
            Resource::RLIMIT_NOFILE
        );
        assert_eq!(resource_from_name("nproc").unwrap(), Resource::RLIMIT_NPROC);
        assert!(resource_from_name("RLIMIT_BOGUS").is_err());
    }

    #[test]
    fn applying_current_limits_succeeds() {
        let (soft, hard) = nix::sys::resource::getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        let limit = Rlimit {
            resource: Resource::RLIMIT_NOFILE,
            soft,
            hard,
        };
        apply(&[limit]).unwrap();
    }
}
