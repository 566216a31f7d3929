//! CPU bandwidth control via the cgroup v1 `cpu` controller.
//!
//! Manages `cpu.shares`, the CFS quota/period pair, and the real-time
//! runtime/period pair.

use std::path::Path;

use cellblock_common::error::Result;

use super::write_control;

/// Sets the relative CPU weight of the cgroup.
///
/// # Errors
///
/// Returns an error if writing to `cpu.shares` fails.
pub fn set_shares(dir: &Path, shares: u64) -> Result<()> {
    write_control(dir, "cpu.shares", &shares.to_string())?;
    tracing::debug!(shares, "CPU shares set");
    Ok(())
}

/// Sets the CFS quota in microseconds per period; `-1` means unlimited.
///
/// # Errors
///
/// Returns an error if writing to `cpu.cfs_quota_us` fails.
pub fn set_quota(dir: &Path, quota_us: i64) -> Result<()> {
    write_control(dir, "cpu.cfs_quota_us", &quota_us.to_string())?;
    tracing::debug!(quota_us, "CPU quota set");
    Ok(())
}

/// Sets the CFS accounting period in microseconds.
///
/// # Errors
///
/// Returns an error if writing to `cpu.cfs_period_us` fails.
pub fn set_period(dir: &Path, period_us: u64) -> Result<()> {
    write_control(dir, "cpu.cfs_period_us", &period_us.to_string())?;
    tracing::debug!(period_us, "CPU period set");
    Ok(())
}

/// Sets the real-time runtime budget in microseconds per RT period.
///
/// # Errors
///
/// Returns an error if writing to `cpu.rt_runtime_us` fails.
pub fn set_rt_runtime(dir: &Path, runtime_us: u64) -> Result<()> {
    write_control(dir, "cpu.rt_runtime_us", &runtime_us.to_string())?;
    tracing::debug!(runtime_us, "CPU RT runtime set");
    Ok(())
}

/// Sets the real-time accounting period in microseconds.
///
/// # Errors
///
/// Returns an error if writing to `cpu.rt_period_us` fails.
pub fn set_rt_period(dir: &Path, period_us: u64) -> Result<()> {
    write_control(dir, "cpu.rt_period_us", &period_us.to_string())?;
    tracing::debug!(period_us, "CPU RT period set");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rt_values_land_in_their_own_files() {
        let dir = tempfile::tempdir().unwrap();
        set_rt_runtime(dir.path(), 950_000).unwrap();
        set_rt_period(dir.path(), 1_000_000).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("cpu.rt_runtime_us")).unwrap(),
            "950000"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("cpu.rt_period_us")).unwrap(),
            "1000000"
        );
    }

    #[test]
    fn missing_directory_is_io_error() {
        let err = set_period(Path::new("/nonexistent/cgroup"), 100_000).unwrap_err();
        assert!(matches!(
            err,
            cellblock_common::error::CellblockError::Io { .. }
        ));
    }
}
