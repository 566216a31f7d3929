//! User namespace ID mapping.
//!
//! Maps container UIDs/GIDs to host IDs. A map is written in the textual
//! form `"inside outside length"`, with several ranges separated by commas,
//! e.g. `"0 655360 5000,5000 600 50"`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use cellblock_common::error::{CellblockError, Result};
use nix::unistd::Pid;

/// What the kernel reads back for the identity map of the initial namespace.
const IDENTITY_PROC_MAP: &str = "0 0 4294967295\n";

/// One contiguous range of an ID map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    /// First ID inside the namespace.
    pub inside: u32,
    /// First ID on the host.
    pub outside: u32,
    /// Number of consecutive IDs mapped.
    pub length: u32,
}

impl IdRange {
    fn contains(&self, id: u32) -> bool {
        let id = u64::from(id);
        let start = u64::from(self.inside);
        id >= start && id < start + u64::from(self.length)
    }
}

/// A UID or GID map. An empty map is the identity mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMap {
    ranges: Vec<IdRange>,
}

impl IdMap {
    /// Parses a comma-separated list of `inside outside length` triples.
    ///
    /// # Errors
    ///
    /// Returns an error if a range does not have exactly three unsigned
    /// fields or has zero length.
    pub fn parse(map: &str) -> Result<Self> {
        if map.trim().is_empty() {
            return Ok(Self::default());
        }
        let ranges = map
            .split(',')
            .map(parse_range)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { ranges })
    }

    /// Whether this is the identity mapping.
    pub fn is_identity(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Ranges of the map, in the order they were written.
    pub fn ranges(&self) -> &[IdRange] {
        &self.ranges
    }

    /// Translates an ID inside the namespace to the host ID it maps to.
    ///
    /// # Errors
    ///
    /// Returns an error unless `id` falls within exactly one range.
    pub fn outside_id(&self, id: u32) -> Result<u32> {
        if self.is_identity() {
            return Ok(id);
        }
        let mut matching = self.ranges.iter().filter(|r| r.contains(id));
        match (matching.next(), matching.next()) {
            (Some(range), None) => range
                .outside
                .checked_add(id - range.inside)
                .ok_or_else(|| CellblockError::config(format!("id {id} maps past u32::MAX"))),
            (None, _) => Err(CellblockError::config(format!(
                "id {id} is not mapped by \"{self}\""
            ))),
            (Some(_), Some(_)) => Err(CellblockError::config(format!(
                "id {id} is mapped more than once by \"{self}\""
            ))),
        }
    }

    /// Renders the map in the one-range-per-line form `/proc/<pid>/uid_map`
    /// expects. The identity map covers the whole 32-bit ID space.
    pub fn to_proc_format(&self) -> String {
        if self.is_identity() {
            return IDENTITY_PROC_MAP.to_string();
        }
        self.ranges
            .iter()
            .map(|r| format!("{} {} {}\n", r.inside, r.outside, r.length))
            .collect()
    }
}

impl FromStr for IdMap {
    type Err = CellblockError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for IdMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{} {} {}", r.inside, r.outside, r.length)?;
        }
        Ok(())
    }
}

fn parse_range(text: &str) -> Result<IdRange> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    let [inside, outside, length] = fields.as_slice() else {
        return Err(CellblockError::config(format!(
            "id map range \"{}\" must be \"inside outside length\"",
            text.trim()
        )));
    };
    let number = |field: &str| {
        field.parse::<u32>().map_err(|e| {
            CellblockError::config(format!("invalid id \"{field}\" in id map: {e}"))
        })
    };
    let range = IdRange {
        inside: number(inside)?,
        outside: number(outside)?,
        length: number(length)?,
    };
    if range.length == 0 {
        return Err(CellblockError::config(format!(
            "id map range \"{}\" has zero length",
            text.trim()
        )));
    }
    Ok(range)
}

/// Installs UID and GID maps for the user namespace of `pid`.
///
/// Unprivileged callers must deny `setgroups` before the kernel accepts a
/// GID map. An identity map is written as a single range over every ID.
///
/// # Errors
///
/// Returns an error if writing to `/proc/<pid>/setgroups`,
/// `/proc/<pid>/uid_map`, or `/proc/<pid>/gid_map` fails.
pub fn write_id_maps(pid: Pid, uid_map: &IdMap, gid_map: &IdMap, deny_setgroups: bool) -> Result<()> {
    let proc_dir = PathBuf::from(format!("/proc/{pid}"));
    write_id_maps_in(&proc_dir, uid_map, gid_map, deny_setgroups)?;
    tracing::debug!(%pid, uid_map = %uid_map, gid_map = %gid_map, "wrote UID/GID map");
    Ok(())
}

fn write_id_maps_in(
    proc_dir: &Path,
    uid_map: &IdMap,
    gid_map: &IdMap,
    deny_setgroups: bool,
) -> Result<()> {
    let write = |file: &str, content: &str| {
        let path = proc_dir.join(file);
        std::fs::write(&path, content).map_err(|e| CellblockError::Io { path, source: e })
    };

    if deny_setgroups {
        write("setgroups", "deny")?;
    }
    write("uid_map", &uid_map.to_proc_format())?;
    write("gid_map", &gid_map.to_proc_format())
}
