//! Cpuset inheritance.
//!
//! A fresh v1 cpuset directory has empty `cpus` and `mems`, and the kernel
//! refuses to attach tasks to it until both are populated.

use std::path::Path;

use cellblock_common::error::{CellblockError, Result};

use super::write_control;

/// Copies `cpus` and `mems` from `parent` into `child`.
///
/// Handles both the prefixed (`cpuset.cpus`) and the `noprefix` mount
/// layouts, picking whichever the parent directory exposes.
///
/// # Errors
///
/// Returns an error if the parent value cannot be read or the child
/// value cannot be written.
pub fn inherit_from_parent(parent: &Path, child: &Path) -> Result<()> {
    for base in ["cpus", "mems"] {
        let prefixed = format!("cpuset.{base}");
        let file = if parent.join(&prefixed).exists() {
            prefixed
        } else {
            base.to_string()
        };
        let source = parent.join(&file);
        let value = std::fs::read_to_string(&source).map_err(|e| CellblockError::Io {
            path: source,
            source: e,
        })?;
        write_control(child, &file, &value)?;
        tracing::debug!(file = %file, value = value.trim(), "cpuset value inherited");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_layout_is_preferred() {
        let parent = tempfile::tempdir().unwrap();
        let child = parent.path().join("c1");
        std::fs::create_dir(&child).unwrap();
        std::fs::write(parent.path().join("cpuset.cpus"), "2-5\n").unwrap();
        std::fs::write(parent.path().join("cpuset.mems"), "0\n").unwrap();

        inherit_from_parent(parent.path(), &child).unwrap();
        assert_eq!(
            std::fs::read_to_string(child.join("cpuset.cpus")).unwrap(),
            "2-5\n"
        );
        assert!(!child.join("cpus").exists());
    }

    #[test]
    fn missing_parent_value_fails() {
        let parent = tempfile::tempdir().unwrap();
        let child = parent.path().join("c1");
        std::fs::create_dir(&child).unwrap();
        assert!(inherit_from_parent(parent.path(), &child).is_err());
    }
}
