//! # strata-snapshot
//!
//! Snapshot lifecycle: a state machine over named snapshots
//! (ACTIVE / VIEW / COMMITTED) with transactional metadata and union mount
//! composition.
//!
//! Two composition strategies exist behind the [`LowerComposer`] trait:
//! read-only images mounted through the mount manager, or plain parent
//! directories when the image path is disabled. Layer conversion is
//! reached through the [`Ingestor`] trait so the lifecycle never depends
//! on the builder directly.

pub mod metadata;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use strata_mount::{compose_union_mount, MountSpec};
use tracing::{debug, info, warn};

pub use metadata::{SnapshotInfo, SnapshotKind, SnapshotStore};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot not found: {0}")]
    NotFound(String),

    #[error("snapshot already exists: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("mount error: {0}")]
    Mount(#[from] strata_mount::MountError),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Disk usage of a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub size: u64,
    pub inodes: u64,
}

/// Strategy resolving parent ids to read-only lower directories.
pub trait LowerComposer: Send + Sync {
    /// Lower directory per parent id, topmost first.
    fn compose_lowers(&self, parent_ids: &[String]) -> Result<Vec<PathBuf>>;

    /// Release whatever `compose_lowers` acquired for these parents.
    fn release_lowers(&self, parent_ids: &[String]);
}

/// Plain-directory composition: each parent contributes its upper dir.
/// Used when the read-only-image path is disabled.
pub struct DirComposer {
    snapshots_dir: PathBuf,
}

impl DirComposer {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            snapshots_dir: root.as_ref().join("snapshots"),
        }
    }
}

impl LowerComposer for DirComposer {
    fn compose_lowers(&self, parent_ids: &[String]) -> Result<Vec<PathBuf>> {
        Ok(parent_ids
            .iter()
            .map(|id| self.snapshots_dir.join(id).join("fs"))
            .collect())
    }

    fn release_lowers(&self, _parent_ids: &[String]) {}
}

/// Layer conversion entry point used during prepare; wired to the layer
/// builder by the composition root.
pub trait Ingestor: Send + Sync {
    fn has_image(&self, layer_id: &str) -> bool;

    fn convert_tree(
        &self,
        layer_id: &str,
        tree: &Path,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// The snapshot lifecycle service.
pub struct Snapshotter {
    store: SnapshotStore,
    composer: Arc<dyn LowerComposer>,
    ingestor: Option<Arc<dyn Ingestor>>,
    active_mounts: Mutex<HashSet<String>>,
    deferred_removals: Mutex<HashSet<String>>,
}

impl Snapshotter {
    pub fn new<P: AsRef<Path>>(root: P, composer: Arc<dyn LowerComposer>) -> Result<Self> {
        Ok(Self {
            store: SnapshotStore::open(root)?,
            composer,
            ingestor: None,
            active_mounts: Mutex::new(HashSet::new()),
            deferred_removals: Mutex::new(HashSet::new()),
        })
    }

    /// Attach the layer conversion hook.
    pub fn with_ingestor(mut self, ingestor: Arc<dyn Ingestor>) -> Self {
        self.ingestor = Some(ingestor);
        self
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Read-only metadata for a key.
    pub fn stat(&self, key: &str) -> Result<SnapshotInfo> {
        self.store.get(key)
    }

    /// Partial metadata update.
    pub fn update(&self, info: &SnapshotInfo, fieldpaths: &[String]) -> Result<SnapshotInfo> {
        let start = Instant::now();
        let result = self.store.update(info, fieldpaths);
        self.log_op("update", &info.key, start, result.is_ok());
        result
    }

    /// Disk usage: recomputed by directory walk for ACTIVE snapshots,
    /// the recorded value otherwise.
    pub fn usage(&self, key: &str) -> Result<Usage> {
        let info = self.store.get(key)?;
        if info.kind == SnapshotKind::Active {
            Ok(directory_usage(
                &self.store.snapshot_dir(&info.id).join("fs"),
            ))
        } else {
            Ok(Usage {
                size: info.usage_bytes,
                inodes: info.usage_inodes,
            })
        }
    }

    /// Create an active snapshot and return its mount set.
    pub fn prepare(&self, key: &str, parent: Option<&str>) -> Result<Vec<MountSpec>> {
        let start = Instant::now();
        let result = self.create_snapshot(SnapshotKind::Active, key, parent);
        self.log_op("prepare", key, start, result.is_ok());
        result
    }

    /// Create a read-only view snapshot and return its mount set.
    pub fn view(&self, key: &str, parent: Option<&str>) -> Result<Vec<MountSpec>> {
        let start = Instant::now();
        let result = self.create_snapshot(SnapshotKind::View, key, parent);
        self.log_op("view", key, start, result.is_ok());
        result
    }

    /// Recompose the mount set for an existing snapshot and mark it
    /// actively mounted, deferring any removal until released.
    pub fn mounts(&self, key: &str) -> Result<Vec<MountSpec>> {
        let info = self.store.get(key)?;
        self.active_mounts.lock().unwrap().insert(key.to_string());
        self.compose_mounts(&info)
    }

    /// Transition ACTIVE → COMMITTED under `name`, recording final usage.
    pub fn commit(&self, name: &str, key: &str) -> Result<()> {
        let start = Instant::now();
        let result = (|| {
            let info = self.store.get(key)?;
            let usage = directory_usage(&self.store.snapshot_dir(&info.id).join("fs"));
            self.store.commit(name, key, usage.size, usage.inodes)?;
            Ok(())
        })();
        self.log_op("commit", key, start, result.is_ok());
        result
    }

    /// Remove a snapshot. While the key is actively mounted the removal is
    /// deferred: the reaper retries it once the mount flag clears.
    pub fn remove(&self, key: &str) -> Result<()> {
        let start = Instant::now();

        if self.active_mounts.lock().unwrap().contains(key) {
            info!(key, "snapshot actively mounted, deferring removal");
            self.deferred_removals
                .lock()
                .unwrap()
                .insert(key.to_string());
            self.log_op("remove", key, start, true);
            return Ok(());
        }

        let result = self.remove_now(key);
        self.log_op("remove", key, start, result.is_ok());
        result
    }

    /// Release the active-mount flag taken by [`mounts`].
    ///
    /// [`mounts`]: Snapshotter::mounts
    pub fn unmark_mounted(&self, key: &str) {
        self.active_mounts.lock().unwrap().remove(key);
        if self.deferred_removals.lock().unwrap().contains(key) {
            self.reap_deferred();
        }
    }

    /// Retry deferred removals whose active-mount flag has cleared.
    pub fn reap_deferred(&self) -> usize {
        let candidates: Vec<String> = {
            let deferred = self.deferred_removals.lock().unwrap();
            let active = self.active_mounts.lock().unwrap();
            deferred
                .iter()
                .filter(|key| !active.contains(*key))
                .cloned()
                .collect()
        };

        let mut reaped = 0;
        for key in candidates {
            match self.remove_now(&key) {
                Ok(()) | Err(SnapshotError::NotFound(_)) => {
                    self.deferred_removals.lock().unwrap().remove(&key);
                    reaped += 1;
                }
                Err(e) => warn!(key = %key, error = %e, "deferred removal failed"),
            }
        }
        if reaped > 0 {
            info!(reaped, "deferred snapshot removals completed");
        }
        reaped
    }

    /// All snapshots matching the filters.
    pub fn walk(&self, filters: &[String]) -> Vec<SnapshotInfo> {
        self.store.walk(filters)
    }

    fn create_snapshot(
        &self,
        kind: SnapshotKind,
        key: &str,
        parent: Option<&str>,
    ) -> Result<Vec<MountSpec>> {
        let info = self.store.create(key, kind, parent)?;

        // Layer conversion: a populated tree with no read-only image yet is
        // a freshly imported layer. Parents are checked too so a whole
        // chain imported before this prepare gets converted.
        if let Some(ingestor) = &self.ingestor {
            let mut candidates = vec![info.id.clone()];
            candidates.extend(info.parent_ids.iter().cloned());
            for id in candidates {
                self.maybe_convert(ingestor.as_ref(), &id);
            }
        }

        self.compose_mounts(&info)
    }

    /// Convert one snapshot tree to a read-only image if it needs it.
    /// Conversion failure falls back to directory composition, so it is
    /// logged rather than propagated.
    fn maybe_convert(&self, ingestor: &dyn Ingestor, id: &str) {
        if ingestor.has_image(id) {
            return;
        }
        let tree = self.store.snapshot_dir(id).join("fs");
        match std::fs::read_dir(&tree) {
            Ok(mut entries) => {
                if entries.next().is_none() {
                    return;
                }
            }
            Err(_) => return,
        }

        info!(id, "populated tree detected, converting to read-only image");
        if let Err(e) = ingestor.convert_tree(id, &tree) {
            warn!(id, error = %e, "layer conversion failed, falling back to directory mount");
        }
    }

    /// Explicit conversion entry point for orchestrators that know a layer
    /// is fully imported.
    pub fn convert_layer(&self, key: &str) -> Result<()> {
        let info = self.store.get(key)?;
        let ingestor = self
            .ingestor
            .as_ref()
            .ok_or_else(|| SnapshotError::InvalidArgument("no ingestor attached".to_string()))?;
        let tree = self.store.snapshot_dir(&info.id).join("fs");
        ingestor
            .convert_tree(&info.id, &tree)
            .map_err(|e| SnapshotError::InvalidArgument(e.to_string()))
    }

    fn compose_mounts(&self, info: &SnapshotInfo) -> Result<Vec<MountSpec>> {
        let lowers = self.composer.compose_lowers(&info.parent_ids)?;
        let dir = self.store.snapshot_dir(&info.id);
        let spec = compose_union_mount(&info.id, &lowers, &dir.join("fs"), &dir.join("work"))?;
        debug!(key = %info.key, id = %info.id, lowers = lowers.len(), "mounts composed");
        Ok(vec![spec])
    }

    fn remove_now(&self, key: &str) -> Result<()> {
        let info = self.store.remove(key)?;
        let dir = self.store.snapshot_dir(&info.id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        self.composer.release_lowers(&info.parent_ids);
        info!(key, id = %info.id, "snapshot removed");
        Ok(())
    }

    fn log_op(&self, op: &str, key: &str, start: Instant, ok: bool) {
        info!(
            op,
            key,
            ok,
            duration_ms = start.elapsed().as_millis() as u64,
            "lifecycle operation"
        );
    }
}

/// Recursive size and inode summation.
fn directory_usage(path: &Path) -> Usage {
    fn walk(path: &Path, usage: &mut Usage) {
        let Ok(entries) = std::fs::read_dir(path) else {
            return;
        };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            usage.inodes += 1;
            if file_type.is_dir() {
                walk(&entry.path(), usage);
            } else if let Ok(meta) = entry.metadata() {
                usage.size += meta.len();
            }
        }
    }

    let mut usage = Usage::default();
    walk(path, &mut usage);
    usage
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn snapshotter(dir: &TempDir) -> Snapshotter {
        let composer = Arc::new(DirComposer::new(dir.path()));
        Snapshotter::new(dir.path(), composer).unwrap()
    }

    #[test]
    fn test_prepare_returns_overlay_spec() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);

        let mounts = s.prepare("base", None).unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].fstype, "overlay");
        assert!(mounts[0].options.iter().any(|o| o.starts_with("upperdir=")));
        assert!(mounts[0].options.iter().all(|o| !o.starts_with("lowerdir=")));
    }

    #[test]
    fn test_prepare_with_parent_stacks_lowers() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);

        s.prepare("layer-1", None).unwrap();
        s.commit("committed-1", "layer-1").unwrap();
        let mounts = s.prepare("container", Some("committed-1")).unwrap();

        let lower = mounts[0]
            .options
            .iter()
            .find(|o| o.starts_with("lowerdir="))
            .unwrap();
        let committed_id = s.stat("committed-1").unwrap().id;
        assert!(lower.contains(&format!("snapshots/{committed_id}/fs")));
    }

    #[test]
    fn test_commit_then_stat_usage() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);

        s.prepare("prep", None).unwrap();
        let id = s.stat("prep").unwrap().id;
        let fs_dir = dir.path().join("snapshots").join(&id).join("fs");
        std::fs::write(fs_dir.join("data.bin"), vec![0u8; 2048]).unwrap();

        s.commit("layer", "prep").unwrap();
        let info = s.stat("layer").unwrap();
        assert_eq!(info.kind, SnapshotKind::Committed);

        let usage = s.usage("layer").unwrap();
        assert_eq!(usage.size, 2048);
        assert_eq!(usage.inodes, 1);
    }

    #[test]
    fn test_usage_recomputed_for_active() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);

        s.prepare("active", None).unwrap();
        let id = s.stat("active").unwrap().id;
        assert_eq!(s.usage("active").unwrap().size, 0);

        std::fs::write(
            dir.path().join("snapshots").join(&id).join("fs/f"),
            vec![1u8; 100],
        )
        .unwrap();
        assert_eq!(s.usage("active").unwrap().size, 100);
    }

    #[test]
    fn test_remove_deletes_directory() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);

        s.prepare("gone", None).unwrap();
        let id = s.stat("gone").unwrap().id;
        s.remove("gone").unwrap();

        assert!(!dir.path().join("snapshots").join(&id).exists());
        assert!(matches!(s.stat("gone"), Err(SnapshotError::NotFound(_))));
    }

    #[test]
    fn test_remove_deferred_while_mounted_then_reaped() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);

        s.prepare("busy", None).unwrap();
        let id = s.stat("busy").unwrap().id;
        s.mounts("busy").unwrap();

        // Removal under an active mount is a deferred no-op.
        s.remove("busy").unwrap();
        assert!(s.stat("busy").is_ok());
        assert!(dir.path().join("snapshots").join(&id).exists());

        // Releasing the mount lets the reaper finish the job.
        s.unmark_mounted("busy");
        assert!(matches!(s.stat("busy"), Err(SnapshotError::NotFound(_))));
        assert!(!dir.path().join("snapshots").join(&id).exists());
    }

    #[test]
    fn test_walk_by_kind() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);
        s.prepare("a", None).unwrap();
        s.view("v", None).unwrap();

        let views = s.walk(&["kind==view".to_string()]);
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].key, "v");
    }

    struct CountingIngestor {
        converted: AtomicUsize,
        has_image: bool,
    }

    impl Ingestor for CountingIngestor {
        fn has_image(&self, _layer_id: &str) -> bool {
            self.has_image
        }

        fn convert_tree(
            &self,
            _layer_id: &str,
            _tree: &Path,
        ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.converted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_populated_parent_triggers_conversion() {
        let dir = TempDir::new().unwrap();
        let ingestor = Arc::new(CountingIngestor {
            converted: AtomicUsize::new(0),
            has_image: false,
        });
        let composer = Arc::new(DirComposer::new(dir.path()));
        let s = Snapshotter::new(dir.path(), composer)
            .unwrap()
            .with_ingestor(ingestor.clone());

        s.prepare("layer-1", None).unwrap();
        let id = s.stat("layer-1").unwrap().id;
        std::fs::write(
            dir.path().join("snapshots").join(&id).join("fs/bin"),
            b"payload",
        )
        .unwrap();
        s.commit("committed-1", "layer-1").unwrap();

        s.prepare("container", Some("committed-1")).unwrap();
        assert_eq!(ingestor.converted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_tree_not_converted() {
        let dir = TempDir::new().unwrap();
        let ingestor = Arc::new(CountingIngestor {
            converted: AtomicUsize::new(0),
            has_image: false,
        });
        let composer = Arc::new(DirComposer::new(dir.path()));
        let s = Snapshotter::new(dir.path(), composer)
            .unwrap()
            .with_ingestor(ingestor.clone());

        s.prepare("empty", None).unwrap();
        assert_eq!(ingestor.converted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_existing_image_not_reconverted() {
        let dir = TempDir::new().unwrap();
        let ingestor = Arc::new(CountingIngestor {
            converted: AtomicUsize::new(0),
            has_image: true,
        });
        let composer = Arc::new(DirComposer::new(dir.path()));
        let s = Snapshotter::new(dir.path(), composer)
            .unwrap()
            .with_ingestor(ingestor.clone());

        s.prepare("layer-1", None).unwrap();
        let id = s.stat("layer-1").unwrap().id;
        std::fs::write(
            dir.path().join("snapshots").join(&id).join("fs/bin"),
            b"payload",
        )
        .unwrap();
        s.commit("c1", "layer-1").unwrap();
        s.prepare("top", Some("c1")).unwrap();

        assert_eq!(ingestor.converted.load(Ordering::SeqCst), 0);
    }
}
