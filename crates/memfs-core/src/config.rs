//! Configuration types for MemFS Core

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::FsResult;

/// Granularity of page accounting.
pub const PAGE_SIZE: u64 = 4096;

/// Pages of system memory the filesystem never eats into.
pub const PAGES_MIN_RESERVED: u64 = 4 * 1024 * 1024 / PAGE_SIZE;

/// Default ceiling for extended attribute bytes.
pub const EXTATTR_MEMORY_RESERVED: u64 = 16 * 1024 * 1024;

/// Resource ceilings fixed at mount time
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountLimits {
    /// Maximum number of live nodes, the root included.
    pub max_nodes: u64,
    /// Maximum bytes of file content; `None` leaves only system memory as the bound.
    pub max_size_bytes: Option<u64>,
    pub max_extattr_bytes: u64,
    pub max_file_size: u64,
}

impl Default for MountLimits {
    fn default() -> Self {
        Self {
            max_nodes: 1 << 20,
            max_size_bytes: None,
            max_extattr_bytes: EXTATTR_MEMORY_RESERVED,
            max_file_size: u64::MAX,
        }
    }
}

impl MountLimits {
    /// Page budget derived from the byte size limit.
    pub fn pages_max(&self) -> u64 {
        match self.max_size_bytes {
            Some(bytes) => bytes.div_ceil(PAGE_SIZE),
            None => u64::MAX,
        }
    }
}

/// Mode flags. Immutable after mount, so readers never synchronize on them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountFlags {
    pub read_only: bool,
    /// Do not let the host cache name lookups.
    pub no_name_cache: bool,
    /// Do not update mtime on writes through mapped pages.
    pub no_mtime: bool,
    /// Serve reads from the page cache directly.
    pub page_read: bool,
}

/// Main mount configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub limits: MountLimits,
    pub flags: MountFlags,
}

impl MountConfig {
    pub fn from_json_bytes(bytes: &[u8]) -> FsResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn from_json_file(path: &Path) -> FsResult<Self> {
        let content = std::fs::read(path)?;
        Self::from_json_bytes(&content)
    }
}
