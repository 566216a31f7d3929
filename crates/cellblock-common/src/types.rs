//! Domain primitive types used across the cellblock workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CellblockError, Result};

/// Kind of device a node or a cgroup device rule refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Every device type (`a`). Only meaningful in cgroup rules.
    All,
    /// Block device (`b`).
    Block,
    /// Character device (`c`).
    Char,
}

impl DeviceType {
    /// Parses the single-letter form used by the devices cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error for anything other than `a`, `b`, or `c`.
    pub fn from_char(c: char) -> Result<Self> {
        match c {
            'a' => Ok(Self::All),
            'b' => Ok(Self::Block),
            'c' => Ok(Self::Char),
            other => Err(CellblockError::config(format!(
                "unknown device type '{other}'"
            ))),
        }
    }

    /// Returns the single-letter form used by the devices cgroup.
    pub const fn as_char(self) -> char {
        match self {
            Self::All => 'a',
            Self::Block => 'b',
            Self::Char => 'c',
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerState {
    /// Container has been created but not yet started.
    Created,
    /// Container is actively running.
    Running,
    /// Container has exited and been torn down.
    Stopped,
    /// Container failed to start and was unwound.
    Failed,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
