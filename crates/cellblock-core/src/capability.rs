//! Linux capability management for least-privilege execution.
//!
//! Reduces the capability sets of the calling process to a bitmask and
//! locks the result with securebits. These functions run in the sandboxed
//! child between `clone(2)` and `execve(2)`, so they do not log.

use cellblock_common::error::{CellblockError, Result};
use nix::errno::Errno;

// Securebits constants (from <linux/securebits.h>)
/// Root has no special capability handling on exec.
pub const SECBIT_NOROOT: u64 = 1 << 0;
/// Locks [`SECBIT_NOROOT`].
pub const SECBIT_NOROOT_LOCKED: u64 = 1 << 1;
/// UID transitions do not adjust capability sets.
pub const SECBIT_NO_SETUID_FIXUP: u64 = 1 << 2;
/// Locks [`SECBIT_NO_SETUID_FIXUP`].
pub const SECBIT_NO_SETUID_FIXUP_LOCKED: u64 = 1 << 3;
/// Locks the keep-caps flag.
pub const SECBIT_KEEP_CAPS_LOCKED: u64 = 1 << 5;
/// Forbids raising ambient capabilities.
pub const SECBIT_NO_CAP_AMBIENT_RAISE: u64 = 1 << 6;
/// Locks [`SECBIT_NO_CAP_AMBIENT_RAISE`].
pub const SECBIT_NO_CAP_AMBIENT_RAISE_LOCKED: u64 = 1 << 7;

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;
const CAP_LAST_CAP_PATH: &str = "/proc/sys/kernel/cap_last_cap";
const FALLBACK_LAST_CAP: u32 = 40;

/// Capabilities to keep, as a bitmask indexed by capability number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityPolicy {
    /// Bit `n` set keeps capability `n`.
    pub mask: u64,
    /// Also raise every kept capability into the ambient set, so it
    /// survives `execve` of a non-privileged binary.
    pub ambient: bool,
    /// Securebits the process must not lock.
    pub securebits_skip_mask: u64,
}

/// Securebits to lock for a process with the given ambient policy.
pub const fn securebits(ambient: bool, skip_mask: u64) -> u64 {
    let mut bits = SECBIT_NOROOT
        | SECBIT_NOROOT_LOCKED
        | SECBIT_NO_SETUID_FIXUP
        | SECBIT_NO_SETUID_FIXUP_LOCKED
        | SECBIT_KEEP_CAPS_LOCKED;
    if !ambient {
        bits |= SECBIT_NO_CAP_AMBIENT_RAISE | SECBIT_NO_CAP_AMBIENT_RAISE_LOCKED;
    }
    bits & !skip_mask
}

/// Highest capability number the running kernel knows.
pub fn last_cap() -> u32 {
    std::fs::read_to_string(CAP_LAST_CAP_PATH)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(FALLBACK_LAST_CAP)
}

/// Whether `cap` is kept by `mask`.
pub const fn is_kept(mask: u64, cap: u32) -> bool {
    cap < 64 && mask & (1 << cap) != 0
}

/// Keeps permitted capabilities across the upcoming UID change.
///
/// # Errors
///
/// Returns the `prctl(PR_SET_KEEPCAPS)` error.
pub fn set_keep_caps() -> Result<()> {
    prctl(libc::PR_SET_KEEPCAPS, 1, "PR_SET_KEEPCAPS")
}

/// Locks securebits, shrinks the bounding set, and sets the effective,
/// permitted, and inheritable sets to `policy.mask`.
///
/// # Errors
///
/// Returns the error of the first failing `prctl` or `capset`.
pub fn apply(policy: &CapabilityPolicy) -> Result<()> {
    let last = last_cap();
    let valid = if last >= 63 {
        u64::MAX
    } else {
        (1u64 << (last + 1)) - 1
    };
    let mask = policy.mask & valid;

    prctl(
        libc::PR_SET_SECUREBITS,
        securebits(policy.ambient, policy.securebits_skip_mask),
        "PR_SET_SECUREBITS",
    )?;

    for cap in 0..=last {
        if !is_kept(mask, cap) {
            prctl(libc::PR_CAPBSET_DROP, u64::from(cap), "PR_CAPBSET_DROP")?;
        }
    }

    capset(mask)?;

    if policy.ambient {
        for cap in (0..=last).filter(|&cap| is_kept(mask, cap)) {
            prctl_ambient_raise(cap)?;
        }
    }
    Ok(())
}

fn prctl(option: libc::c_int, arg: u64, op: &'static str) -> Result<()> {
    // SAFETY: the options used here take a single integer argument; the
    // remaining arguments must be zero.
    let ret = unsafe { libc::prctl(option, arg as libc::c_ulong, 0, 0, 0) };
    if ret == 0 {
        Ok(())
    } else {
        Err(CellblockError::sys(op, Errno::last()))
    }
}

#[allow(clippy::cast_sign_loss)]
fn prctl_ambient_raise(cap: u32) -> Result<()> {
    // SAFETY: PR_CAP_AMBIENT_RAISE takes the capability number as its
    // third argument; the rest must be zero.
    let ret = unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_RAISE as libc::c_ulong,
            libc::c_ulong::from(cap),
            0,
            0,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(CellblockError::sys("PR_CAP_AMBIENT_RAISE", Errno::last()))
    }
}

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

#[allow(clippy::cast_possible_truncation)]
fn capset(mask: u64) -> Result<()> {
    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let low = mask as u32;
    let high = (mask >> 32) as u32;
    let data = [
        CapUserData {
            effective: low,
            permitted: low,
            inheritable: low,
        },
        CapUserData {
            effective: high,
            permitted: high,
            inheritable: high,
        },
    ];
    // SAFETY: `header` and `data` match the kernel's v3 layout, which
    // reads exactly two data structs.
    let ret = unsafe { libc::syscall(libc::SYS_capset, &raw const header, data.as_ptr()) };
    if ret == 0 {
        Ok(())
    } else {
        Err(CellblockError::sys("capset", Errno::last()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambient_leaves_raise_unlocked() {
        let bits = securebits(true, 0);
        assert_eq!(bits & SECBIT_NO_CAP_AMBIENT_RAISE, 0);
        assert_ne!(bits & SECBIT_KEEP_CAPS_LOCKED, 0);
    }

    #[test]
    fn no_ambient_locks_raise() {
        let bits = securebits(false, 0);
        assert_ne!(bits & SECBIT_NO_CAP_AMBIENT_RAISE_LOCKED, 0);
    }

    #[test]
    fn skip_mask_clears_bits() {
        let bits = securebits(false, SECBIT_NOROOT | SECBIT_NOROOT_LOCKED);
        assert_eq!(bits & (SECBIT_NOROOT | SECBIT_NOROOT_LOCKED), 0);
        assert_ne!(bits & SECBIT_NO_SETUID_FIXUP, 0);
    }

    #[test]
    fn mask_bits_select_capabilities() {
        // CAP_NET_ADMIN and CAP_SYS_ADMIN
        let mask = (1 << 12) | (1 << 21);
        assert!(is_kept(mask, 12));
        assert!(is_kept(mask, 21));
        assert!(!is_kept(mask, 0));
        assert!(!is_kept(mask, 64));
    }

    #[test]
    fn last_cap_is_plausible() {
        assert!(last_cap() >= 30);
    }
}
