//! Filesystem nodes
//!
//! Each node carries two locks. The entity lock (`RwLock<NodeData>`) guards attributes and
//! the type payload; the interlock (`Mutex<Interlock>`) guards the handle binding state,
//! status bits and the enumeration resume hint. The interlock is always taken after the
//! entity lock and after the mount lock, never before either.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::trace;

use crate::dirent::{DirCursor, DirTree};
use crate::error::{FsError, FsResult};
use crate::name::Name;
use crate::types::{current_timestamp, Attributes, ContentId, DeviceId, FileTimes, NodeId, NodeType};

/// Largest link count a node may reach.
pub const LINK_MAX: u32 = i32::MAX as u32;

/// Object bound to a node by the host (for example a kernel vnode or a FUSE inode entry).
pub trait ExternalHandle: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

bitflags! {
    /// Pending timestamp updates, applied lazily by [`Node::update_times`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct NodeStatus: u32 {
        const MODIFIED = 0x1;
        const CHANGED = 0x2;
    }
}

/// Handle binding state of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindState {
    Idle,
    Allocating,
    /// Allocating, with at least one waiter parked on the node.
    AllocatingWant,
    Bound,
    /// The node is being reclaimed; no new binding will ever succeed.
    Doomed,
}

#[derive(Clone, Copy, Debug)]
struct ResumeHint {
    epoch: u64,
    cookie: u32,
    cursor: DirCursor,
}

#[derive(Debug)]
pub(crate) struct Interlock {
    state: BindState,
    handle: Option<Arc<dyn ExternalHandle>>,
    status: NodeStatus,
    resume: Option<ResumeHint>,
}

#[derive(Debug)]
pub(crate) struct Directory {
    /// Root points at itself; a removed directory has no parent.
    pub(crate) parent: Option<Weak<Node>>,
    pub(crate) tree: DirTree<Arc<Node>>,
}

#[derive(Debug)]
pub(crate) enum Payload {
    Directory(Directory),
    Regular { content: ContentId, pages: u64 },
    Symlink { target: Name },
    Device { rdev: DeviceId },
    /// Fifos and sockets.
    Special,
    /// Payload already torn down.
    Reclaimed,
}

#[derive(Debug)]
pub(crate) struct NodeData {
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) mode: u32,
    pub(crate) flags: u64,
    pub(crate) links: u32,
    /// Set once the last link is gone; such a node can never be linked again.
    pub(crate) unlinked: bool,
    pub(crate) size: u64,
    pub(crate) times: FileTimes,
    pub(crate) extattr_bytes: u64,
    pub(crate) payload: Payload,
}

impl NodeData {
    pub(crate) fn new(uid: u32, gid: u32, mode: u32, payload: Payload) -> Self {
        Self {
            uid,
            gid,
            mode,
            flags: 0,
            links: 0,
            unlinked: false,
            size: 0,
            times: FileTimes::now(),
            extattr_bytes: 0,
            payload,
        }
    }

    pub(crate) fn dir(&self) -> FsResult<&Directory> {
        match &self.payload {
            Payload::Directory(dir) => Ok(dir),
            Payload::Reclaimed => Err(FsError::Stale),
            _ => Err(FsError::NotADirectory),
        }
    }

    pub(crate) fn dir_mut(&mut self) -> FsResult<&mut Directory> {
        match &mut self.payload {
            Payload::Directory(dir) => Ok(dir),
            Payload::Reclaimed => Err(FsError::Stale),
            _ => Err(FsError::NotADirectory),
        }
    }

    pub(crate) fn is_reclaimed(&self) -> bool {
        matches!(self.payload, Payload::Reclaimed)
    }

    pub(crate) fn take_payload(&mut self) -> Payload {
        std::mem::replace(&mut self.payload, Payload::Reclaimed)
    }
}

/// A filesystem object.
pub struct Node {
    id: NodeId,
    node_type: NodeType,
    generation: u64,
    pub(crate) entity: RwLock<NodeData>,
    interlock: Mutex<Interlock>,
    bound: Condvar,
    accessed: AtomicBool,
    refcount: AtomicU32,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("node_type", &self.node_type)
            .field("generation", &self.generation)
            .field("refcount", &self.refcount.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Node {
    /// New node holding the reference owned by the mount's used set.
    pub(crate) fn new(id: NodeId, node_type: NodeType, generation: u64, data: NodeData) -> Arc<Self> {
        Arc::new(Self {
            id,
            node_type,
            generation,
            entity: RwLock::new(data),
            interlock: Mutex::new(Interlock {
                state: BindState::Idle,
                handle: None,
                status: NodeStatus::empty(),
                resume: None,
            }),
            bound: Condvar::new(),
            accessed: AtomicBool::new(false),
            refcount: AtomicU32::new(1),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn is_dir(&self) -> bool {
        self.node_type.is_dir()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn links(&self) -> u32 {
        self.entity.read().links
    }

    pub fn size(&self) -> u64 {
        self.entity.read().size
    }

    /// Number of entries in a directory, whiteouts included.
    pub fn entry_count(&self) -> FsResult<usize> {
        Ok(self.entity.read().dir()?.tree.len())
    }

    /// Parent of a directory. `None` once the directory has been removed.
    pub fn parent(&self) -> FsResult<Option<Arc<Node>>> {
        let data = self.entity.read();
        Ok(data.dir()?.parent.as_ref().and_then(Weak::upgrade))
    }

    pub fn symlink_target(&self) -> Option<Name> {
        match &self.entity.read().payload {
            Payload::Symlink { target } => Some(target.clone()),
            _ => None,
        }
    }

    pub fn rdev(&self) -> Option<DeviceId> {
        match &self.entity.read().payload {
            Payload::Device { rdev } => Some(*rdev),
            _ => None,
        }
    }

    /// Pages charged for a regular file.
    pub fn pages(&self) -> u64 {
        match &self.entity.read().payload {
            Payload::Regular { pages, .. } => *pages,
            _ => 0,
        }
    }

    pub fn extattr_bytes(&self) -> u64 {
        self.entity.read().extattr_bytes
    }

    /// Take another reference. The caller must already hold one, or the mount lock.
    pub(crate) fn ref_node(&self) {
        let prev = self.refcount.fetch_add(1, Ordering::AcqRel);
        assert!(prev > 0, "reference taken on unreferenced node {}", self.id);
    }

    /// Take a reference unless the count already dropped to zero.
    pub(crate) fn try_ref(&self) -> bool {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > 0).then(|| n + 1))
            .is_ok()
    }

    /// Drop a reference, returning the remaining count.
    pub(crate) fn unref(&self) -> u32 {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "reference dropped on unreferenced node {}", self.id);
        prev - 1
    }

    pub fn bind_state(&self) -> BindState {
        self.interlock.lock().state
    }

    pub fn handle(&self) -> Option<Arc<dyn ExternalHandle>> {
        self.interlock.lock().handle.clone()
    }

    pub fn is_doomed(&self) -> bool {
        self.bind_state() == BindState::Doomed
    }

    /// Return the bound handle, constructing it first if nothing is bound.
    ///
    /// Only one caller constructs at a time and it does so without holding the interlock.
    /// Concurrent callers park until construction finishes and then re-examine the state:
    /// they pick up the new handle, or, if construction failed, one of them tries again.
    /// A successful binding holds one node reference.
    pub(crate) fn bind_handle<F>(self: &Arc<Self>, construct: F) -> FsResult<Arc<dyn ExternalHandle>>
    where
        F: FnOnce(&Arc<Node>) -> FsResult<Arc<dyn ExternalHandle>>,
    {
        let mut lock = self.interlock.lock();
        loop {
            match lock.state {
                BindState::Doomed => return Err(FsError::Stale),
                BindState::Bound => match &lock.handle {
                    Some(handle) => return Ok(Arc::clone(handle)),
                    None => unreachable!("node {} bound without a handle", self.id),
                },
                BindState::Allocating | BindState::AllocatingWant => {
                    lock.state = BindState::AllocatingWant;
                    trace!(node = %self.id, "waiting for handle construction");
                    self.bound.wait(&mut lock);
                }
                BindState::Idle => break,
            }
        }
        lock.state = BindState::Allocating;
        drop(lock);

        let result = construct(self);

        let mut lock = self.interlock.lock();
        let outcome = match result {
            Ok(handle) if lock.state != BindState::Doomed => {
                if self.try_ref() {
                    lock.state = BindState::Bound;
                    lock.handle = Some(Arc::clone(&handle));
                    Ok(handle)
                } else {
                    lock.state = BindState::Doomed;
                    Err(FsError::Stale)
                }
            }
            Ok(_) => Err(FsError::Stale),
            Err(err) => {
                if lock.state != BindState::Doomed {
                    lock.state = BindState::Idle;
                }
                trace!(node = %self.id, error = %err, "handle construction failed");
                Err(err)
            }
        };
        self.bound.notify_all();
        outcome
    }

    /// Detach the bound handle. The caller owes the node reference the binding held.
    pub(crate) fn take_handle(&self) -> Arc<dyn ExternalHandle> {
        let mut lock = self.interlock.lock();
        let Some(handle) = lock.handle.take() else {
            panic!("unbinding node {} which has no bound handle", self.id);
        };
        if lock.state == BindState::Bound {
            lock.state = BindState::Idle;
        }
        handle
    }

    pub(crate) fn doom(&self) {
        let mut lock = self.interlock.lock();
        lock.state = BindState::Doomed;
        lock.resume = None;
        self.bound.notify_all();
    }

    pub(crate) fn mark_accessed(&self) {
        self.accessed.store(true, Ordering::Relaxed);
    }

    pub fn status(&self) -> NodeStatus {
        self.interlock.lock().status
    }

    pub(crate) fn set_status(&self, status: NodeStatus) {
        self.interlock.lock().status |= status;
    }

    /// Fold pending access and status marks into the timestamps.
    pub fn update_times(&self) {
        let mut data = self.entity.write();
        self.apply_pending_times(&mut data);
    }

    pub(crate) fn apply_pending_times(&self, data: &mut NodeData) {
        let accessed = self.accessed.swap(false, Ordering::Relaxed);
        let status = std::mem::take(&mut self.interlock.lock().status);
        if !accessed && status.is_empty() {
            return;
        }

        let now = current_timestamp();
        if accessed {
            data.times.atime = now;
        }
        if status.contains(NodeStatus::MODIFIED) {
            data.times.mtime = now;
        }
        if !status.is_empty() {
            data.times.ctime = now;
        }
    }

    pub(crate) fn attributes(&self, data: &NodeData) -> Attributes {
        Attributes {
            id: self.id,
            node_type: self.node_type,
            uid: data.uid,
            gid: data.gid,
            mode: data.mode,
            flags: data.flags,
            links: data.links,
            size: data.size,
            times: data.times,
            generation: self.generation,
            rdev: match data.payload {
                Payload::Device { rdev } => Some(rdev),
                _ => None,
            },
        }
    }

    /// Cursor saved by the last enumeration, if it ended at `cookie` and the directory has
    /// not changed since.
    pub(crate) fn resume_hint(&self, epoch: u64, cookie: u32) -> Option<DirCursor> {
        let lock = self.interlock.lock();
        lock.resume
            .filter(|hint| hint.epoch == epoch && hint.cookie == cookie)
            .map(|hint| hint.cursor)
    }

    pub(crate) fn set_resume_hint(&self, epoch: u64, cookie: u32, cursor: Option<DirCursor>) {
        let mut lock = self.interlock.lock();
        lock.resume = cursor.map(|cursor| ResumeHint { epoch, cookie, cursor });
    }
}
