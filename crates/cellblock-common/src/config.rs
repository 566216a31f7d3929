//! Launcher-wide settings.
//!
//! These are host-level defaults (where run directories and cgroups live),
//! not the per-container description, which is built by the runtime crate.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CellblockError, Result};

/// Root settings for the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherSettings {
    /// Directory under which `<name>_XXXXXX` run directories are created.
    pub run_dir: PathBuf,
    /// Mount root of the cgroup v1 controllers.
    pub cgroup_root: PathBuf,
    /// Parent cgroup used when a container description does not name one.
    pub cgroup_parent: Option<PathBuf>,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from(crate::constants::DEFAULT_RUN_DIR),
            cgroup_root: PathBuf::from(crate::constants::CGROUP_ROOT),
            cgroup_parent: None,
        }
    }
}

impl LauncherSettings {
    /// Loads settings from a JSON file. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CellblockError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}
