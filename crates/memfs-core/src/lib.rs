//! MemFS Core: node and directory-entry management for an in-memory filesystem
//!
//! The crate owns node lifecycle and reference counting, the hashed directory entry tree
//! with its stable enumeration cookies, mount-wide resource budgets and the binding of
//! host handles to nodes. Byte-level file I/O and host adapters live outside.

pub mod config;
pub mod dirent;
pub mod error;
pub mod mount;
pub mod name;
pub mod node;
pub mod storage;
pub mod types;
pub mod vfs;

// Re-export key types for convenience
pub use config::{MountConfig, MountFlags, MountLimits, PAGE_SIZE};
pub use dirent::{DirCursor, DirTree, Dirent, COOKIE_DOT, COOKIE_DOTDOT, COOKIE_EOF};
pub use error::{FsError, FsResult};
pub use mount::{Mount, NodeOwner};
pub use name::Name;
pub use node::{BindState, ExternalHandle, Node, NodeStatus};
pub use storage::{FixedMemory, InMemoryBackend, MemoryProbe, StorageBackend, SystemMemory};
pub use types::*;
pub use vfs::Entry;
