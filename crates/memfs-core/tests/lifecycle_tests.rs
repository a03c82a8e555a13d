use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use memfs_core::{
    ContentId, FixedMemory, FsError, FsResult, InMemoryBackend, Mount, MountConfig, MountLimits,
    NodeOwner, NodeType, StorageBackend, COOKIE_DOT, PAGE_SIZE,
};

/// Backing store that counts released objects.
#[derive(Default)]
struct CountingStorage {
    inner: InMemoryBackend,
    released: AtomicUsize,
}

impl CountingStorage {
    fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl StorageBackend for CountingStorage {
    fn allocate(&self) -> FsResult<ContentId> {
        self.inner.allocate()
    }

    fn truncate(&self, id: ContentId, new_len: u64) -> FsResult<()> {
        self.inner.truncate(id, new_len)
    }

    fn release(&self, id: ContentId) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.inner.release(id);
    }
}

fn counting_mount(limits: MountLimits) -> anyhow::Result<(Mount, Arc<CountingStorage>)> {
    let storage = Arc::new(CountingStorage::default());
    let mount = Mount::with_backends(
        MountConfig {
            limits,
            ..MountConfig::default()
        },
        Arc::clone(&storage) as Arc<dyn StorageBackend>,
        Arc::new(FixedMemory(u64::MAX)),
    )?;
    Ok((mount, storage))
}

fn owner() -> NodeOwner {
    NodeOwner::new(1000, 100, 0o600)
}

#[test]
fn storage_released_only_on_last_reference() -> anyhow::Result<()> {
    let (mount, storage) = counting_mount(MountLimits::default())?;
    let node = mount.allocate(NodeType::Regular, owner(), None, None, None)?;
    mount.ref_node(&node);

    mount.release(&node);
    assert_eq!(storage.released(), 0);
    assert!(mount.get_node(node.id()).is_ok());

    mount.release(&node);
    assert_eq!(storage.released(), 1);
    assert!(matches!(mount.get_node(node.id()), Err(FsError::Stale)));
    Ok(())
}

#[test]
fn two_node_budget_counts_root() -> anyhow::Result<()> {
    let (mount, _) = counting_mount(MountLimits {
        max_nodes: 2,
        ..MountLimits::default()
    })?;
    assert_eq!(mount.stats().nodes_used, 1);

    let file = mount.create_node(&mount.root(), b"only", NodeType::Regular, owner(), None, None)?;
    assert_eq!(mount.stats().nodes_used, 2);

    let err = mount
        .create_node(&mount.root(), b"extra", NodeType::Regular, owner(), None, None)
        .unwrap_err();
    assert!(matches!(err, FsError::NoSpace));
    assert_eq!(mount.stats().nodes_used, 2);
    assert!(matches!(
        mount.lookup_entry(&mount.root(), b"extra"),
        Err(FsError::NotFound)
    ));
    assert_eq!(file.links(), 1);
    Ok(())
}

#[test]
fn failed_allocation_returns_backing_object() -> anyhow::Result<()> {
    let (mount, storage) = counting_mount(MountLimits {
        max_nodes: 1,
        ..MountLimits::default()
    })?;
    let err = mount
        .allocate(NodeType::Regular, owner(), None, None, None)
        .unwrap_err();
    assert!(matches!(err, FsError::NoSpace));
    assert_eq!(storage.released(), 1);
    assert_eq!(storage.inner.object_count(), 0);
    Ok(())
}

#[test]
fn unmount_tears_everything_down() -> anyhow::Result<()> {
    let (mount, storage) = counting_mount(MountLimits {
        max_size_bytes: Some(64 * PAGE_SIZE),
        ..MountLimits::default()
    })?;
    let root = mount.root();
    let dir = mount.create_node(&root, b"var", NodeType::Directory, owner(), None, None)?;
    for i in 0..5 {
        let file = mount.create_node(&dir, format!("log{i}").as_bytes(), NodeType::Regular, owner(), None, None)?;
        mount.resize(&file, 3 * PAGE_SIZE)?;
        mount.charge_extattr(&file, 128)?;
    }
    mount.create_node(&dir, b"link", NodeType::Symlink, owner(), Some(b"log0"), None)?;
    assert_eq!(mount.stats().pages_used, 15);
    assert_eq!(mount.stats().extattr_bytes_used, 640);

    mount.unmount();
    let stats = mount.stats();
    assert_eq!(stats.nodes_used, 0);
    assert_eq!(stats.pages_used, 0);
    assert_eq!(stats.extattr_bytes_used, 0);
    assert_eq!(storage.released(), 5);
    assert!(root.is_doomed());
    assert!(dir.is_doomed());
    assert!(matches!(mount.readdir(&root, COOKIE_DOT, 8), Err(FsError::Stale)));
    assert!(matches!(
        mount.allocate(NodeType::Fifo, owner(), None, None, None),
        Err(FsError::NoSpace)
    ));
    Ok(())
}

#[test]
fn mount_from_config_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("memfs.json");
    std::fs::write(
        &path,
        r#"{"limits": {"max_nodes": 4, "max_size_bytes": 8192}, "flags": {"no_mtime": true}}"#,
    )?;

    let config = MountConfig::from_json_file(&path)?;
    let mount = Mount::new(config)?;
    let stats = mount.stats();
    assert_eq!(stats.nodes_max, 4);
    assert_eq!(stats.pages_max, 2);
    assert!(mount.flags().no_mtime);
    Ok(())
}
