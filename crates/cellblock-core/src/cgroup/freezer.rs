//! Task freezing via the cgroup v1 `freezer` controller.

use std::fmt;
use std::path::Path;

use cellblock_common::error::Result;

use super::write_control;

/// Target state written to `freezer.state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezerState {
    /// All tasks stopped.
    Frozen,
    /// All tasks runnable.
    Thawed,
}

impl fmt::Display for FreezerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frozen => f.write_str("FROZEN"),
            Self::Thawed => f.write_str("THAWED"),
        }
    }
}

/// Requests `state` for every task in the cgroup.
///
/// # Errors
///
/// Returns an error if writing to `freezer.state` fails.
pub fn set_state(dir: &Path, state: FreezerState) -> Result<()> {
    write_control(dir, "freezer.state", &state.to_string())?;
    tracing::info!(%state, path = %dir.display(), "freezer state set");
    Ok(())
}
