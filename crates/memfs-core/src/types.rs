//! Core type definitions for MemFS

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::name::Name;

/// Node identifier, unique for the lifetime of a mount
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Device number of a block or character special node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

/// Opaque identifier of a backing-store object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContentId(pub u64);

impl ContentId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Node types. Fixed when the node is allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Directory,
    Regular,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl NodeType {
    pub fn is_dir(self) -> bool {
        self == NodeType::Directory
    }
}

/// File timestamps, in nanoseconds since the Unix epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileTimes {
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub birthtime: i64,
}

impl FileTimes {
    /// All four timestamps set to the current time.
    pub fn now() -> Self {
        let now = current_timestamp();
        Self {
            atime: now,
            mtime: now,
            ctime: now,
            birthtime: now,
        }
    }
}

pub(crate) fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Attribute snapshot of a node
#[derive(Clone, Debug)]
pub struct Attributes {
    pub id: NodeId,
    pub node_type: NodeType,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub flags: u64,
    pub links: u32,
    pub size: u64,
    pub times: FileTimes,
    pub generation: u64,
    pub rdev: Option<DeviceId>,
}

/// Directory entry as reported by enumeration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: Name,
    pub cookie: u32,
    pub node: Option<NodeId>,
    /// `None` marks a whiteout.
    pub node_type: Option<NodeType>,
}

/// One batch of directory enumeration
#[derive(Clone, Debug, Default)]
pub struct ReadDir {
    pub entries: Vec<DirEntry>,
    /// Cookie to resume from; the end-of-directory cookie once exhausted.
    pub next_cookie: u32,
}

impl ReadDir {
    pub fn is_eof(&self) -> bool {
        self.next_cookie == crate::dirent::COOKIE_EOF
    }
}

/// Budget usage of a mount
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountStats {
    pub nodes_used: u64,
    pub nodes_max: u64,
    pub pages_used: u64,
    pub pages_max: u64,
    pub extattr_bytes_used: u64,
    pub extattr_bytes_max: u64,
}
