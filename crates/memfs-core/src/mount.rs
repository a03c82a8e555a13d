//! Mount-wide state: the used-node set, id and generation allocation, resource budgets
//! and node lifecycle

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{MountConfig, MountFlags, PAGE_SIZE, PAGES_MIN_RESERVED};
use crate::dirent::DirTree;
use crate::error::{FsError, FsResult};
use crate::name::{validate_symlink_target, Name};
use crate::node::{Directory, ExternalHandle, Node, NodeData, Payload};
use crate::storage::{InMemoryBackend, MemoryProbe, StorageBackend, SystemMemory};
use crate::types::{DeviceId, MountStats, NodeId, NodeType};

/// First id handed out; the root gets it.
const FIRST_NODE_ID: u64 = 2;

/// Ownership and permission bits of a new node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeOwner {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl NodeOwner {
    pub fn new(uid: u32, gid: u32, mode: u32) -> Self {
        Self { uid, gid, mode }
    }
}

struct MountState {
    nodes: HashMap<NodeId, Arc<Node>>,
    next_id: u64,
    next_generation: u64,
    nodes_inuse: u64,
    pages_used: u64,
    extattr_used: u64,
    unmounted: bool,
}

impl MountState {
    fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            next_id: FIRST_NODE_ID,
            next_generation: 1,
            nodes_inuse: 0,
            pages_used: 0,
            extattr_used: 0,
            unmounted: false,
        }
    }

    fn allocate_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    fn allocate_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1).max(1);
        generation
    }
}

/// One mounted in-memory filesystem.
///
/// Lock order is mount lock, then node entity locks (ascending id when several are
/// held), then node interlocks. The rename lock, when needed, is taken before all of them.
pub struct Mount {
    config: MountConfig,
    state: Mutex<MountState>,
    pub(crate) rename_lock: Mutex<()>,
    pub(crate) storage: Arc<dyn StorageBackend>,
    memory: Arc<dyn MemoryProbe>,
    root: Arc<Node>,
}

impl Mount {
    pub fn new(config: MountConfig) -> FsResult<Self> {
        Self::with_backends(config, Arc::new(InMemoryBackend::new()), Arc::new(SystemMemory))
    }

    pub fn with_backends(
        config: MountConfig,
        storage: Arc<dyn StorageBackend>,
        memory: Arc<dyn MemoryProbe>,
    ) -> FsResult<Self> {
        if config.limits.max_nodes == 0 {
            return Err(FsError::NoSpace);
        }

        let mut state = MountState::new();
        let id = state.allocate_id();
        let generation = state.allocate_generation();
        let mut data = NodeData::new(
            0,
            0,
            0o755,
            Payload::Directory(Directory {
                parent: None,
                tree: DirTree::new(),
            }),
        );
        data.links = 2;
        let root = Node::new(id, NodeType::Directory, generation, data);
        root.entity.write().dir_mut()?.parent = Some(Arc::downgrade(&root));
        state.nodes.insert(id, Arc::clone(&root));
        state.nodes_inuse = 1;

        info!(
            max_nodes = config.limits.max_nodes,
            max_size_bytes = ?config.limits.max_size_bytes,
            read_only = config.flags.read_only,
            "mounted memfs"
        );

        Ok(Self {
            config,
            state: Mutex::new(state),
            rename_lock: Mutex::new(()),
            storage,
            memory,
            root,
        })
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn flags(&self) -> MountFlags {
        self.config.flags
    }

    pub fn root(&self) -> Arc<Node> {
        Arc::clone(&self.root)
    }

    pub(crate) fn check_writable(&self) -> FsResult<()> {
        if self.config.flags.read_only {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Look a live node up by id.
    pub fn get_node(&self, id: NodeId) -> FsResult<Arc<Node>> {
        let state = self.state.lock();
        state.nodes.get(&id).cloned().ok_or(FsError::Stale)
    }

    /// Allocate a node and link it into the used set.
    ///
    /// The node starts with only the used-set reference and no directory entry; a
    /// directory counts its own "." link. `target` is required for symlinks and `rdev`
    /// for device nodes.
    pub fn allocate(
        &self,
        node_type: NodeType,
        owner: NodeOwner,
        parent: Option<&Arc<Node>>,
        target: Option<&[u8]>,
        rdev: Option<DeviceId>,
    ) -> FsResult<Arc<Node>> {
        self.check_writable()?;

        let payload = match node_type {
            NodeType::Directory => {
                if let Some(parent) = parent {
                    if !parent.is_dir() {
                        return Err(FsError::NotADirectory);
                    }
                }
                Payload::Directory(Directory {
                    parent: parent.map(Arc::downgrade),
                    tree: DirTree::new(),
                })
            }
            NodeType::Symlink => {
                let target = target.ok_or(FsError::InvalidArgument)?;
                validate_symlink_target(target)?;
                Payload::Symlink {
                    target: Name::new(target),
                }
            }
            NodeType::BlockDevice | NodeType::CharDevice => Payload::Device {
                rdev: rdev.ok_or(FsError::InvalidArgument)?,
            },
            NodeType::Fifo | NodeType::Socket => Payload::Special,
            NodeType::Regular => Payload::Regular {
                content: self.storage.allocate()?,
                pages: 0,
            },
        };

        let mut data = NodeData::new(owner.uid, owner.gid, owner.mode, payload);
        match &data.payload {
            Payload::Directory(_) => data.links = 1,
            Payload::Symlink { target } => data.size = target.len() as u64,
            _ => {}
        }

        let mut state = self.state.lock();
        if !self.try_reserve_node_slot(&mut state) {
            drop(state);
            if let Payload::Regular { content, .. } = data.payload {
                self.storage.release(content);
            }
            return Err(FsError::NoSpace);
        }
        let id = state.allocate_id();
        let generation = state.allocate_generation();
        let node = Node::new(id, node_type, generation, data);
        state.nodes.insert(id, Arc::clone(&node));
        drop(state);

        debug!(node = %id, ?node_type, generation, "allocated node");
        Ok(node)
    }

    /// Take another reference on `node`. The caller must already hold one.
    pub fn ref_node(&self, node: &Arc<Node>) {
        node.ref_node();
    }

    /// Drop a reference. The last one removes the node from the used set and frees its
    /// payload, returning every budget it was charged against.
    pub fn release(&self, node: &Arc<Node>) {
        {
            let mut state = self.state.lock();
            if node.unref() > 0 {
                return;
            }
            if state.nodes.remove(&node.id()).is_some() {
                state.nodes_inuse -= 1;
            }
            node.doom();
        }

        let (payload, extattr_bytes) = {
            let mut data = node.entity.write();
            let payload = data.take_payload();
            (payload, std::mem::take(&mut data.extattr_bytes))
        };
        match payload {
            Payload::Directory(dir) => {
                assert!(dir.tree.is_empty(), "reclaiming non-empty directory {}", node.id());
            }
            Payload::Regular { content, pages } => {
                self.release_pages(pages);
                self.storage.release(content);
            }
            _ => {}
        }
        if extattr_bytes > 0 {
            self.release_extattr_bytes(extattr_bytes);
        }
        debug!(node = %node.id(), node_type = ?node.node_type(), "reclaimed node");
    }

    fn memory_covers(&self, pages: u64) -> bool {
        self.memory.available_pages().saturating_sub(PAGES_MIN_RESERVED) >= pages
    }

    fn try_reserve_node_slot(&self, state: &mut MountState) -> bool {
        if state.unmounted {
            return false;
        }
        if state.nodes_inuse >= self.config.limits.max_nodes || !self.memory_covers(1) {
            warn!(nodes_inuse = state.nodes_inuse, "node budget exhausted");
            return false;
        }
        state.nodes_inuse += 1;
        true
    }

    pub fn reserve_node_slot(&self) -> bool {
        let mut state = self.state.lock();
        self.try_reserve_node_slot(&mut state)
    }

    pub fn release_node_slot(&self) {
        let mut state = self.state.lock();
        assert!(state.nodes_inuse > 0, "node slot released twice");
        state.nodes_inuse -= 1;
    }

    pub fn reserve_pages(&self, pages: u64) -> bool {
        if pages == 0 {
            return true;
        }
        let mut state = self.state.lock();
        if state.unmounted {
            return false;
        }
        let fits = state
            .pages_used
            .checked_add(pages)
            .is_some_and(|total| total <= self.config.limits.pages_max());
        if !fits || !self.memory_covers(pages) {
            debug!(pages, pages_used = state.pages_used, "page reservation refused");
            return false;
        }
        state.pages_used += pages;
        true
    }

    pub fn release_pages(&self, pages: u64) {
        if pages == 0 {
            return;
        }
        let mut state = self.state.lock();
        assert!(state.pages_used >= pages, "released more pages than reserved");
        state.pages_used -= pages;
    }

    pub fn reserve_extattr_bytes(&self, bytes: u64) -> bool {
        if bytes == 0 {
            return true;
        }
        let mut state = self.state.lock();
        if state.unmounted {
            return false;
        }
        let fits = state
            .extattr_used
            .checked_add(bytes)
            .is_some_and(|total| total <= self.config.limits.max_extattr_bytes);
        if !fits || !self.memory_covers(bytes.div_ceil(PAGE_SIZE)) {
            debug!(bytes, extattr_used = state.extattr_used, "extattr reservation refused");
            return false;
        }
        state.extattr_used += bytes;
        true
    }

    pub fn release_extattr_bytes(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut state = self.state.lock();
        assert!(state.extattr_used >= bytes, "released more extattr bytes than reserved");
        state.extattr_used -= bytes;
    }

    /// Bind an external handle to `node`, constructing it with `construct` if none is bound.
    pub fn bind_handle<F>(&self, node: &Arc<Node>, construct: F) -> FsResult<Arc<dyn ExternalHandle>>
    where
        F: FnOnce(&Arc<Node>) -> FsResult<Arc<dyn ExternalHandle>>,
    {
        node.bind_handle(construct)
    }

    /// Detach the bound handle and drop the reference it held, which may reclaim the node.
    ///
    /// # Panics
    ///
    /// Panics if no handle is bound.
    pub fn unbind_handle(&self, node: &Arc<Node>) -> Arc<dyn ExternalHandle> {
        let handle = node.take_handle();
        self.release(node);
        handle
    }

    pub fn stats(&self) -> MountStats {
        let state = self.state.lock();
        MountStats {
            nodes_used: state.nodes_inuse,
            nodes_max: self.config.limits.max_nodes,
            pages_used: state.pages_used,
            pages_max: self.config.limits.pages_max(),
            extattr_bytes_used: state.extattr_used,
            extattr_bytes_max: self.config.limits.max_extattr_bytes,
        }
    }

    /// Tear the whole tree down. Every node is doomed and returns what it was charged;
    /// handles still bound may be unbound afterwards without effect on the counters.
    ///
    /// Reservations taken before the unmount stay counted until their holder releases them,
    /// and no new reservation succeeds afterwards.
    pub fn unmount(&self) {
        let _rename = self.rename_lock.lock();
        let nodes: Vec<Arc<Node>> = {
            let mut state = self.state.lock();
            if state.unmounted {
                return;
            }
            state.unmounted = true;
            let nodes: Vec<Arc<Node>> = state.nodes.drain().map(|(_, node)| node).collect();
            state.nodes_inuse -= nodes.len() as u64;
            nodes
        };

        let count = nodes.len();
        for node in &nodes {
            node.doom();
            let (payload, extattr_bytes) = {
                let mut data = node.entity.write();
                let payload = data.take_payload();
                (payload, std::mem::take(&mut data.extattr_bytes))
            };
            match payload {
                Payload::Directory(mut dir) => {
                    dir.tree.drain();
                }
                Payload::Regular { content, pages } => {
                    self.release_pages(pages);
                    self.storage.release(content);
                }
                _ => {}
            }
            self.release_extattr_bytes(extattr_bytes);
        }

        info!(nodes = count, "unmounted memfs");
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        self.unmount();
    }
}
