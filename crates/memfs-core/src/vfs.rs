//! Namespace operations on a mount: entry lookup, insertion, removal and rename, node
//! creation, enumeration, whiteouts, resize and attribute snapshots

use std::sync::{Arc, Weak};

use parking_lot::RwLockWriteGuard;
use tracing::{debug, trace, warn};

use crate::config::PAGE_SIZE;
use crate::dirent::{DirCursor, Dirent, COOKIE_DOT, COOKIE_DOTDOT, COOKIE_EOF, COOKIE_MIN};
use crate::error::{FsError, FsResult};
use crate::mount::{Mount, NodeOwner};
use crate::name::{validate_name, Name};
use crate::node::{Node, NodeData, NodeStatus, Payload, LINK_MAX};
use crate::types::{Attributes, DeviceId, DirEntry, NodeId, NodeType, ReadDir};

/// Result of a name lookup. `node` is `None` when the name is a whiteout.
#[derive(Clone, Debug)]
pub struct Entry {
    pub name: Name,
    pub cookie: u32,
    pub node: Option<Arc<Node>>,
}

/// Entity write locks on several nodes, taken in ascending id order.
struct LockSet<'a> {
    guards: Vec<(NodeId, RwLockWriteGuard<'a, NodeData>)>,
}

impl<'a> LockSet<'a> {
    fn lock(nodes: &[&'a Arc<Node>]) -> Self {
        let mut ordered = nodes.to_vec();
        ordered.sort_by_key(|node| node.id());
        ordered.dedup_by_key(|node| node.id());
        let guards = ordered
            .into_iter()
            .map(|node| (node.id(), node.entity.write()))
            .collect();
        Self { guards }
    }

    fn get(&mut self, node: &Node) -> &mut NodeData {
        match self.guards.iter_mut().find(|(id, _)| *id == node.id()) {
            Some((_, guard)) => &mut **guard,
            None => unreachable!("node {} is not in the lock set", node.id()),
        }
    }
}

#[derive(Clone, Copy)]
enum Position {
    Dot,
    DotDot,
    At(DirCursor),
    Eof,
}

fn dir_entry(de: &Dirent<Arc<Node>>) -> DirEntry {
    DirEntry {
        name: de.name().clone(),
        cookie: de.cookie(),
        node: de.node().map(|node| node.id()),
        node_type: de.node().map(|node| node.node_type()),
    }
}

/// Node bound to `name` in `dir`; `Ok(None)` for a whiteout.
fn lookup_child(dir: &Node, name: &[u8]) -> FsResult<Option<Arc<Node>>> {
    let data = dir.entity.read();
    let de = data.dir()?.tree.lookup(name).ok_or(FsError::NotFound)?;
    Ok(de.node().cloned())
}

fn entry_is(data: &NodeData, name: &[u8], node: &Arc<Node>) -> FsResult<bool> {
    let bound = data.dir()?.tree.lookup(name).and_then(|de| de.node());
    Ok(matches!(bound, Some(n) if Arc::ptr_eq(n, node)))
}

fn parent_id(dir: &Node, data: &NodeData) -> FsResult<NodeId> {
    let parent = data.dir()?.parent.as_ref().and_then(Weak::upgrade);
    Ok(parent.map_or(dir.id(), |parent| parent.id()))
}

impl Mount {
    pub fn lookup_entry(&self, dir: &Arc<Node>, name: &[u8]) -> FsResult<Entry> {
        let data = dir.entity.read();
        let directory = data.dir()?;
        match name {
            b"." => {
                return Ok(Entry {
                    name: Name::new(name),
                    cookie: COOKIE_DOT,
                    node: Some(Arc::clone(dir)),
                })
            }
            b".." => {
                let parent = directory.parent.as_ref().and_then(Weak::upgrade);
                return Ok(Entry {
                    name: Name::new(name),
                    cookie: COOKIE_DOTDOT,
                    node: Some(parent.ok_or(FsError::NotFound)?),
                });
            }
            _ => validate_name(name)?,
        }

        let de = directory.tree.lookup(name).ok_or(FsError::NotFound)?;
        Ok(Entry {
            name: de.name().clone(),
            cookie: de.cookie(),
            node: de.node().cloned(),
        })
    }

    /// Allocate a node and bind it under `name` in `dir`.
    pub fn create_node(
        &self,
        dir: &Arc<Node>,
        name: &[u8],
        node_type: NodeType,
        owner: NodeOwner,
        target: Option<&[u8]>,
        rdev: Option<DeviceId>,
    ) -> FsResult<Arc<Node>> {
        self.check_writable()?;
        validate_name(name)?;
        {
            let data = dir.entity.read();
            let directory = data.dir()?;
            if directory.parent.is_none() {
                return Err(FsError::NotFound);
            }
            if directory.tree.lookup(name).is_some_and(|de| !de.is_whiteout()) {
                return Err(FsError::AlreadyExists);
            }
        }

        let node = self.allocate(node_type, owner, Some(dir), target, rdev)?;
        if let Err(err) = self.insert_entry(dir, name, &node) {
            self.release(&node);
            return Err(err);
        }
        debug!(dir = %dir.id(), node = %node.id(), name = %Name::new(name), "created node");
        Ok(node)
    }

    /// Bind `name` in `dir` to `child`, replacing a whiteout of the same name. Returns the
    /// cookie of the new entry.
    pub fn insert_entry(&self, dir: &Arc<Node>, name: &[u8], child: &Arc<Node>) -> FsResult<u32> {
        self.check_writable()?;
        validate_name(name)?;
        if Arc::ptr_eq(dir, child) {
            return Err(FsError::InvalidArgument);
        }

        let mut locks = LockSet::lock(&[dir, child]);

        let child_data = locks.get(child);
        if child_data.is_reclaimed() {
            return Err(FsError::Stale);
        }
        if child_data.unlinked {
            return Err(FsError::NotFound);
        }
        // A directory can only be linked once.
        if child.is_dir() && child_data.links >= 2 {
            return Err(FsError::IsADirectory);
        }
        if child_data.links >= LINK_MAX {
            return Err(FsError::TooManyLinks);
        }

        let dir_data = locks.get(dir);
        if child.is_dir() && dir_data.links >= LINK_MAX {
            return Err(FsError::TooManyLinks);
        }
        let directory = dir_data.dir_mut()?;
        if directory.parent.is_none() {
            return Err(FsError::NotFound);
        }

        let name = Name::new(name);
        let whiteout = match directory.tree.lookup(name.as_bytes()).map(Dirent::is_whiteout) {
            Some(true) => directory.tree.remove(name.as_bytes()),
            Some(false) => return Err(FsError::AlreadyExists),
            None => None,
        };
        let cookie = match directory.tree.insert(name.clone(), Some(Arc::clone(child))) {
            Ok(cookie) => cookie,
            Err(err) => {
                if whiteout.is_some() && directory.tree.insert(name.clone(), None).is_err() {
                    warn!(dir = %dir.id(), %name, "whiteout lost after failed insert");
                }
                return Err(err);
            }
        };
        if child.is_dir() {
            dir_data.links += 1;
        }

        let child_data = locks.get(child);
        child_data.links += 1;
        if let Ok(child_dir) = child_data.dir_mut() {
            child_dir.parent = Some(Arc::downgrade(dir));
        }

        dir.set_status(NodeStatus::MODIFIED | NodeStatus::CHANGED);
        child.set_status(NodeStatus::CHANGED);
        trace!(dir = %dir.id(), child = %child.id(), %name, cookie, "inserted entry");
        Ok(cookie)
    }

    /// Unbind `name` from `dir`. The last link of a node drops its base reference.
    pub fn remove_entry(&self, dir: &Arc<Node>, name: &[u8]) -> FsResult<()> {
        self.check_writable()?;
        validate_name(name)?;

        loop {
            let child = lookup_child(dir, name)?.ok_or(FsError::NotFound)?;
            let mut locks = LockSet::lock(&[dir, &child]);
            if !entry_is(locks.get(dir), name, &child)? {
                continue;
            }

            let child_data = locks.get(&child);
            let reap = if child.is_dir() {
                let child_dir = child_data.dir_mut()?;
                if !child_dir.tree.is_empty() {
                    return Err(FsError::NotEmpty);
                }
                child_dir.parent = None;
                child_data.links = 0;
                true
            } else {
                child_data.links -= 1;
                child_data.links == 0
            };
            child_data.unlinked = reap;

            let dir_data = locks.get(dir);
            dir_data.dir_mut()?.tree.remove(name);
            if child.is_dir() {
                dir_data.links -= 1;
            }

            dir.set_status(NodeStatus::MODIFIED | NodeStatus::CHANGED);
            child.set_status(NodeStatus::CHANGED);
            drop(locks);

            trace!(dir = %dir.id(), child = %child.id(), name = %Name::new(name), "removed entry");
            if reap {
                self.release(&child);
            }
            return Ok(());
        }
    }

    /// Fails unless `dir` lies outside the subtree rooted at `node`. Callers hold the
    /// rename lock so that no directory changes parent during the walk.
    fn check_not_ancestor(&self, node: &Arc<Node>, dir: &Arc<Node>) -> FsResult<()> {
        let mut current = Arc::clone(dir);
        loop {
            if Arc::ptr_eq(&current, node) {
                return Err(FsError::InvalidArgument);
            }
            let parent = current.parent()?.ok_or(FsError::NotFound)?;
            if Arc::ptr_eq(&parent, &current) {
                return Ok(());
            }
            current = parent;
        }
    }

    /// Move the entry `src_name` of `src_dir` to `dst_name` in `dst_dir`, replacing what is
    /// bound there.
    pub fn rename(
        &self,
        src_dir: &Arc<Node>,
        src_name: &[u8],
        dst_dir: &Arc<Node>,
        dst_name: &[u8],
    ) -> FsResult<()> {
        self.check_writable()?;
        validate_name(src_name)?;
        validate_name(dst_name)?;
        if !dst_dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let same_dir = Arc::ptr_eq(src_dir, dst_dir);

        loop {
            let child = lookup_child(src_dir, src_name)?.ok_or(FsError::NotFound)?;
            let moves_dir = child.is_dir() && !same_dir;
            let _rename = moves_dir.then(|| self.rename_lock.lock());
            if moves_dir {
                self.check_not_ancestor(&child, dst_dir)?;
            }

            let target = match lookup_child(dst_dir, dst_name) {
                Ok(node) => node,
                Err(FsError::NotFound) => None,
                Err(err) => return Err(err),
            };
            if target.as_ref().is_some_and(|target| Arc::ptr_eq(target, &child)) {
                return Ok(());
            }

            let mut nodes = vec![src_dir, dst_dir, &child];
            if let Some(target) = &target {
                nodes.push(target);
            }
            let mut locks = LockSet::lock(&nodes);

            if !entry_is(locks.get(src_dir), src_name, &child)? {
                continue;
            }
            let current = locks
                .get(dst_dir)
                .dir()?
                .tree
                .lookup(dst_name)
                .map(|de| de.node().cloned());
            let target_unchanged = match (&target, &current) {
                (Some(target), Some(Some(bound))) => Arc::ptr_eq(target, bound),
                (None, None) | (None, Some(None)) => true,
                _ => false,
            };
            if !target_unchanged {
                continue;
            }

            if let Some(target) = &target {
                let target_data = locks.get(target);
                match (child.is_dir(), target.is_dir()) {
                    (true, false) => return Err(FsError::NotADirectory),
                    (false, true) => return Err(FsError::IsADirectory),
                    (true, true) if !target_data.dir()?.tree.is_empty() => {
                        return Err(FsError::NotEmpty)
                    }
                    _ => {}
                }
            }
            let dst_data = locks.get(dst_dir);
            if dst_data.dir()?.parent.is_none() {
                return Err(FsError::NotFound);
            }
            let gains_link = moves_dir && !target.as_ref().is_some_and(|target| target.is_dir());
            if gains_link && dst_data.links >= LINK_MAX {
                return Err(FsError::TooManyLinks);
            }

            let dst_tree = &mut dst_data.dir_mut()?.tree;
            let displaced = if current.is_some() {
                dst_tree.remove(dst_name)
            } else {
                None
            };
            if let Err(err) = dst_tree.insert(Name::new(dst_name), Some(Arc::clone(&child))) {
                if let Some(de) = displaced {
                    let name = de.name().clone();
                    if dst_tree.insert(name.clone(), de.into_node()).is_err() {
                        warn!(dir = %dst_dir.id(), %name, "displaced entry lost after failed rename");
                    }
                }
                return Err(err);
            }
            locks.get(src_dir).dir_mut()?.tree.remove(src_name);

            if moves_dir {
                locks.get(src_dir).links -= 1;
                locks.get(dst_dir).links += 1;
            }
            if let Ok(child_dir) = locks.get(&child).dir_mut() {
                child_dir.parent = Some(Arc::downgrade(dst_dir));
            }

            let mut reap = None;
            if let Some(replaced) = displaced.and_then(Dirent::into_node) {
                let replaced_data = locks.get(&replaced);
                if replaced.is_dir() {
                    replaced_data.links = 0;
                    replaced_data.unlinked = true;
                    if let Ok(replaced_dir) = replaced_data.dir_mut() {
                        replaced_dir.parent = None;
                    }
                    locks.get(dst_dir).links -= 1;
                    reap = Some(replaced);
                } else {
                    replaced_data.links -= 1;
                    if replaced_data.links == 0 {
                        replaced_data.unlinked = true;
                        reap = Some(replaced);
                    }
                }
            }

            src_dir.set_status(NodeStatus::MODIFIED | NodeStatus::CHANGED);
            if !same_dir {
                dst_dir.set_status(NodeStatus::MODIFIED | NodeStatus::CHANGED);
            }
            child.set_status(NodeStatus::CHANGED);
            drop(locks);

            debug!(
                src = %src_dir.id(),
                dst = %dst_dir.id(),
                node = %child.id(),
                "renamed entry"
            );
            if let Some(replaced) = reap {
                self.release(&replaced);
            }
            return Ok(());
        }
    }

    /// Position on the first real entry of `dir`.
    pub fn first(&self, dir: &Arc<Node>) -> FsResult<Option<(DirCursor, DirEntry)>> {
        let data = dir.entity.read();
        let tree = &data.dir()?.tree;
        Ok(tree
            .first()
            .and_then(|cursor| tree.get(&cursor).map(|de| (cursor, dir_entry(de)))))
    }

    /// Step past `cursor`, which may refer to an entry removed since it was handed out.
    pub fn advance(&self, dir: &Arc<Node>, cursor: &DirCursor) -> FsResult<Option<(DirCursor, DirEntry)>> {
        let data = dir.entity.read();
        let tree = &data.dir()?.tree;
        let mut next = tree.advance(cursor);
        while let Some(cursor) = next {
            if let Some(de) = tree.get(&cursor) {
                return Ok(Some((cursor, dir_entry(de))));
            }
            next = tree.advance(&cursor);
        }
        Ok(None)
    }

    /// Enumerate up to `max_entries` entries starting at `cookie`, "." and ".." included.
    pub fn readdir(&self, dir: &Arc<Node>, cookie: u32, max_entries: usize) -> FsResult<ReadDir> {
        if max_entries == 0 {
            return Err(FsError::InvalidArgument);
        }

        let data = dir.entity.read();
        let tree = &data.dir()?.tree;
        let epoch = tree.epoch();

        let mut position = match cookie {
            COOKIE_DOT => Position::Dot,
            COOKIE_DOTDOT => Position::DotDot,
            COOKIE_EOF => Position::Eof,
            c if c < COOKIE_MIN => return Err(FsError::InvalidArgument),
            c => dir
                .resume_hint(epoch, c)
                .or_else(|| tree.seek(c))
                .map_or(Position::Eof, Position::At),
        };

        let mut batch = ReadDir::default();
        while batch.entries.len() < max_entries {
            position = match position {
                Position::Dot => {
                    batch.entries.push(DirEntry {
                        name: Name::from("."),
                        cookie: COOKIE_DOT,
                        node: Some(dir.id()),
                        node_type: Some(NodeType::Directory),
                    });
                    Position::DotDot
                }
                Position::DotDot => {
                    batch.entries.push(DirEntry {
                        name: Name::from(".."),
                        cookie: COOKIE_DOTDOT,
                        node: Some(parent_id(dir, &data)?),
                        node_type: Some(NodeType::Directory),
                    });
                    tree.first().map_or(Position::Eof, Position::At)
                }
                Position::At(cursor) => {
                    if let Some(de) = tree.get(&cursor) {
                        batch.entries.push(dir_entry(de));
                    }
                    tree.advance(&cursor).map_or(Position::Eof, Position::At)
                }
                Position::Eof => break,
            };
        }

        let (next_cookie, resume) = match position {
            Position::Dot => (COOKIE_DOT, None),
            Position::DotDot => (COOKIE_DOTDOT, None),
            Position::At(cursor) => match tree.get(&cursor) {
                Some(de) => (de.cookie(), Some(cursor)),
                None => (COOKIE_EOF, None),
            },
            Position::Eof => (COOKIE_EOF, None),
        };
        dir.set_resume_hint(epoch, next_cookie, resume);
        drop(data);

        batch.next_cookie = next_cookie;
        self.set_accessed(dir);
        Ok(batch)
    }

    /// Bind `name` in `dir` to no node.
    pub fn whiteout_add(&self, dir: &Arc<Node>, name: &[u8]) -> FsResult<u32> {
        self.check_writable()?;
        validate_name(name)?;
        let cookie = {
            let mut data = dir.entity.write();
            let directory = data.dir_mut()?;
            if directory.parent.is_none() {
                return Err(FsError::NotFound);
            }
            directory.tree.insert(Name::new(name), None)?
        };
        dir.set_status(NodeStatus::MODIFIED | NodeStatus::CHANGED);
        Ok(cookie)
    }

    /// Drop the whiteout `name`. Real entries are left alone.
    pub fn whiteout_remove(&self, dir: &Arc<Node>, name: &[u8]) -> FsResult<()> {
        self.check_writable()?;
        validate_name(name)?;
        {
            let mut data = dir.entity.write();
            let tree = &mut data.dir_mut()?.tree;
            match tree.lookup(name).map(Dirent::is_whiteout) {
                None => return Err(FsError::NotFound),
                Some(false) => return Err(FsError::InvalidArgument),
                Some(true) => {
                    tree.remove(name);
                }
            }
        }
        dir.set_status(NodeStatus::MODIFIED | NodeStatus::CHANGED);
        Ok(())
    }

    /// Change the size of a regular file, charging or refunding whole pages.
    pub fn resize(&self, node: &Arc<Node>, new_size: u64) -> FsResult<()> {
        self.check_writable()?;
        match node.node_type() {
            NodeType::Regular => {}
            NodeType::Directory => return Err(FsError::IsADirectory),
            _ => return Err(FsError::InvalidArgument),
        }
        if new_size > self.config().limits.max_file_size {
            return Err(FsError::FileTooLarge);
        }
        let new_pages = new_size.div_ceil(PAGE_SIZE);

        loop {
            let old_pages = match node.entity.read().payload {
                Payload::Regular { pages, .. } => pages,
                _ => return Err(FsError::Stale),
            };
            let grow = new_pages.saturating_sub(old_pages);
            if !self.reserve_pages(grow) {
                return Err(FsError::NoSpace);
            }

            let mut guard = node.entity.write();
            let data = &mut *guard;
            let Payload::Regular { content, pages } = &mut data.payload else {
                drop(guard);
                self.release_pages(grow);
                return Err(FsError::Stale);
            };
            if *pages != old_pages {
                drop(guard);
                self.release_pages(grow);
                continue;
            }
            if let Err(err) = self.storage.truncate(*content, new_size) {
                drop(guard);
                self.release_pages(grow);
                return Err(err);
            }
            *pages = new_pages;
            data.size = new_size;
            drop(guard);

            self.release_pages(old_pages.saturating_sub(new_pages));
            node.set_status(NodeStatus::MODIFIED | NodeStatus::CHANGED);
            trace!(node = %node.id(), new_size, pages = new_pages, "resized");
            return Ok(());
        }
    }

    /// Set the extended-attribute bytes charged to `node` to `total_bytes`.
    pub fn charge_extattr(&self, node: &Arc<Node>, total_bytes: u64) -> FsResult<()> {
        self.check_writable()?;
        loop {
            let old_bytes = {
                let data = node.entity.read();
                if data.is_reclaimed() {
                    return Err(FsError::Stale);
                }
                data.extattr_bytes
            };
            let grow = total_bytes.saturating_sub(old_bytes);
            if !self.reserve_extattr_bytes(grow) {
                return Err(FsError::NoSpace);
            }

            let mut data = node.entity.write();
            if data.is_reclaimed() || data.extattr_bytes != old_bytes {
                let reclaimed = data.is_reclaimed();
                drop(data);
                self.release_extattr_bytes(grow);
                if reclaimed {
                    return Err(FsError::Stale);
                }
                continue;
            }
            data.extattr_bytes = total_bytes;
            drop(data);

            self.release_extattr_bytes(old_bytes.saturating_sub(total_bytes));
            node.set_status(NodeStatus::CHANGED);
            return Ok(());
        }
    }

    /// Record a write through a shared mapping.
    pub fn note_mapped_write(&self, node: &Arc<Node>) {
        if !self.flags().no_mtime {
            node.set_status(NodeStatus::MODIFIED);
        }
    }

    pub fn set_accessed(&self, node: &Arc<Node>) {
        if !self.flags().read_only {
            node.mark_accessed();
        }
    }

    pub fn set_status(&self, node: &Arc<Node>, status: NodeStatus) {
        node.set_status(status);
    }

    /// Attribute snapshot with pending timestamp updates applied.
    pub fn getattr(&self, node: &Arc<Node>) -> FsResult<Attributes> {
        let mut data = node.entity.write();
        if data.is_reclaimed() {
            return Err(FsError::Stale);
        }
        node.apply_pending_times(&mut data);
        Ok(node.attributes(&data))
    }
}
