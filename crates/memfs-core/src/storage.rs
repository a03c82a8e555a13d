//! Backing stores for regular-file contents and the system memory probe

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::config::PAGE_SIZE;
use crate::error::FsResult;
use crate::{ContentId, FsError};

/// Page-addressable object store holding regular-file contents.
///
/// The node layer only creates objects, resizes them and drops them; byte-level I/O
/// happens elsewhere.
pub trait StorageBackend: Send + Sync {
    fn allocate(&self) -> FsResult<ContentId>;
    fn truncate(&self, id: ContentId, new_len: u64) -> FsResult<()>;
    fn release(&self, id: ContentId);
}

/// In-memory storage backend implementation
pub struct InMemoryBackend {
    next_id: Mutex<u64>,
    data: Mutex<HashMap<ContentId, Vec<u8>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(1),
            data: Mutex::new(HashMap::new()),
        }
    }

    fn get_next_id(&self) -> ContentId {
        let mut next_id = self.next_id.lock();
        let id = ContentId::new(*next_id);
        *next_id += 1;
        id
    }

    /// Number of objects currently held.
    pub fn object_count(&self) -> usize {
        self.data.lock().len()
    }

    /// Current length of object `id`.
    pub fn len(&self, id: ContentId) -> FsResult<u64> {
        let data = self.data.lock();
        let content = data.get(&id).ok_or(FsError::NotFound)?;
        Ok(content.len() as u64)
    }
}

impl StorageBackend for InMemoryBackend {
    fn allocate(&self) -> FsResult<ContentId> {
        let id = self.get_next_id();
        self.data.lock().insert(id, Vec::new());
        Ok(id)
    }

    fn truncate(&self, id: ContentId, new_len: u64) -> FsResult<()> {
        let new_len = usize::try_from(new_len).map_err(|_| FsError::FileTooLarge)?;
        let mut data = self.data.lock();
        let content = data.get_mut(&id).ok_or(FsError::NotFound)?;
        content.resize(new_len, 0);
        if new_len < content.capacity() / 2 {
            content.shrink_to_fit();
        }
        Ok(())
    }

    fn release(&self, id: ContentId) {
        if self.data.lock().remove(&id).is_some() {
            trace!(?id, "released backing object");
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Source of the system-wide free memory figure, so the filesystem can yield to
/// global memory pressure before its own ceilings are reached.
#[cfg_attr(test, mockall::automock)]
pub trait MemoryProbe: Send + Sync {
    /// Free system memory, in units of `PAGE_SIZE`.
    fn available_pages(&self) -> u64;
}

/// Probe backed by `sysconf(3)`.
pub struct SystemMemory;

impl MemoryProbe for SystemMemory {
    #[cfg(target_os = "linux")]
    fn available_pages(&self) -> u64 {
        // SAFETY: sysconf has no memory-safety preconditions.
        let (pages, page_size) = unsafe {
            (
                libc::sysconf(libc::_SC_AVPHYS_PAGES),
                libc::sysconf(libc::_SC_PAGESIZE),
            )
        };
        if pages < 0 || page_size <= 0 {
            return u64::MAX;
        }
        (pages as u64).saturating_mul(page_size as u64) / PAGE_SIZE
    }

    #[cfg(not(target_os = "linux"))]
    fn available_pages(&self) -> u64 {
        u64::MAX
    }
}

/// Probe reporting a fixed amount of free memory.
pub struct FixedMemory(pub u64);

impl MemoryProbe for FixedMemory {
    fn available_pages(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_object_lifecycle() {
        let backend = InMemoryBackend::new();
        let a = backend.allocate().unwrap();
        let b = backend.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(backend.object_count(), 2);

        backend.truncate(a, 3 * PAGE_SIZE).unwrap();
        assert_eq!(backend.len(a).unwrap(), 3 * PAGE_SIZE);
        backend.truncate(a, 10).unwrap();
        assert_eq!(backend.len(a).unwrap(), 10);

        backend.release(a);
        assert!(matches!(backend.len(a), Err(FsError::NotFound)));
        assert!(matches!(backend.truncate(a, 1), Err(FsError::NotFound)));
        assert_eq!(backend.object_count(), 1);
    }

    #[test]
    fn test_system_memory_reports_something() {
        assert!(SystemMemory.available_pages() > 0);
    }
}
