//! Snapshot metadata store.
//!
//! The table lives in memory under one lock (metadata transactions are
//! serialized) and is persisted as one JSON descriptor per snapshot at
//! `snapshots/<id>/.metadata`, written atomically via a temp sibling.
//! On open the store walks the snapshot directories and revalidates every
//! descriptor, skipping entries whose directory lost its `fs/`.

use crate::{SnapshotError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const METADATA_FILE: &str = ".metadata";
const FS_DIR_MODE: u32 = 0o755;
const WORK_DIR_MODE: u32 = 0o700;

/// Snapshot kind: the three lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Active,
    View,
    Committed,
}

/// One snapshot row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Caller-visible name; rewritten on commit.
    pub key: String,
    /// Stable identifier; names the on-disk directory, never changes.
    pub id: String,
    pub kind: SnapshotKind,
    /// Parent key as given at creation (empty for base snapshots).
    pub parent: String,
    /// Resolved parent chain, topmost first.
    pub parent_ids: Vec<String>,
    pub created_at: i64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Usage recorded at commit time.
    #[serde(default)]
    pub usage_bytes: u64,
    #[serde(default)]
    pub usage_inodes: u64,
}

fn timestamp_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Serialized, descriptor-backed snapshot table.
pub struct SnapshotStore {
    snapshots_dir: PathBuf,
    table: Mutex<HashMap<String, SnapshotInfo>>,
    next_id: AtomicU64,
}

impl SnapshotStore {
    /// Open the store under `<root>/snapshots/`, recovering the table from
    /// the on-disk descriptors.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let snapshots_dir = root.as_ref().join("snapshots");
        fs::create_dir_all(&snapshots_dir)?;

        let mut table = HashMap::new();
        let mut max_id = 0u64;
        let mut recovered = 0usize;

        for entry in fs::read_dir(&snapshots_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let descriptor = entry.path().join(METADATA_FILE);
            let info: SnapshotInfo = match fs::read(&descriptor)
                .map_err(SnapshotError::from)
                .and_then(|data| {
                    serde_json::from_slice(&data).map_err(SnapshotError::from)
                }) {
                Ok(info) => info,
                Err(e) => {
                    warn!(dir = %entry.path().display(), error = %e, "snapshot descriptor unreadable, skipping");
                    continue;
                }
            };
            if !entry.path().join("fs").is_dir() {
                warn!(id = %info.id, "snapshot missing fs directory, skipping");
                continue;
            }
            if let Ok(n) = info.id.parse::<u64>() {
                max_id = max_id.max(n);
            }
            table.insert(info.key.clone(), info);
            recovered += 1;
        }

        info!(recovered, "snapshot store opened");
        Ok(Self {
            snapshots_dir,
            table: Mutex::new(table),
            next_id: AtomicU64::new(max_id + 1),
        })
    }

    pub fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.snapshots_dir.join(id)
    }

    fn write_descriptor(&self, info: &SnapshotInfo) -> Result<()> {
        let dir = self.snapshot_dir(&info.id);
        let path = dir.join(METADATA_FILE);
        let tmp = dir.join(".metadata.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(info)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Create a snapshot row and its `fs/`/`work/` directories.
    pub fn create(
        &self,
        key: &str,
        kind: SnapshotKind,
        parent: Option<&str>,
    ) -> Result<SnapshotInfo> {
        let mut table = self.table.lock().unwrap();
        if table.contains_key(key) {
            return Err(SnapshotError::Conflict(key.to_string()));
        }

        let parent_ids = match parent {
            None => Vec::new(),
            Some(parent_key) if parent_key.is_empty() => Vec::new(),
            Some(parent_key) => {
                let parent_info = table
                    .get(parent_key)
                    .ok_or_else(|| SnapshotError::NotFound(parent_key.to_string()))?;
                let mut ids = vec![parent_info.id.clone()];
                ids.extend(parent_info.parent_ids.iter().cloned());
                ids
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let dir = self.snapshot_dir(&id);
        fs::DirBuilder::new()
            .recursive(true)
            .mode(FS_DIR_MODE)
            .create(dir.join("fs"))?;
        fs::DirBuilder::new()
            .mode(WORK_DIR_MODE)
            .create(dir.join("work"))?;

        let info = SnapshotInfo {
            key: key.to_string(),
            id,
            kind,
            parent: parent.unwrap_or_default().to_string(),
            parent_ids,
            created_at: timestamp_secs(),
            labels: HashMap::new(),
            usage_bytes: 0,
            usage_inodes: 0,
        };
        self.write_descriptor(&info)?;
        table.insert(key.to_string(), info.clone());

        debug!(key, id = %info.id, kind = ?kind, "snapshot created");
        Ok(info)
    }

    pub fn get(&self, key: &str) -> Result<SnapshotInfo> {
        self.table
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| SnapshotError::NotFound(key.to_string()))
    }

    /// Partial metadata update along the given field paths.
    pub fn update(&self, info: &SnapshotInfo, fieldpaths: &[String]) -> Result<SnapshotInfo> {
        let mut table = self.table.lock().unwrap();
        let current = table
            .get_mut(&info.key)
            .ok_or_else(|| SnapshotError::NotFound(info.key.clone()))?;

        if fieldpaths.is_empty() {
            current.labels = info.labels.clone();
        } else {
            for path in fieldpaths {
                match path.as_str() {
                    "labels" => current.labels = info.labels.clone(),
                    other => {
                        if let Some(label_key) = other.strip_prefix("labels.") {
                            match info.labels.get(label_key) {
                                Some(value) => {
                                    current
                                        .labels
                                        .insert(label_key.to_string(), value.clone());
                                }
                                None => {
                                    current.labels.remove(label_key);
                                }
                            }
                        } else {
                            return Err(SnapshotError::InvalidArgument(format!(
                                "cannot update field {other}"
                            )));
                        }
                    }
                }
            }
        }

        let updated = current.clone();
        self.write_descriptor(&updated)?;
        Ok(updated)
    }

    /// ACTIVE → COMMITTED, renaming `key` to `name` and recording usage.
    pub fn commit(&self, name: &str, key: &str, usage_bytes: u64, usage_inodes: u64) -> Result<SnapshotInfo> {
        let mut table = self.table.lock().unwrap();
        if table.contains_key(name) {
            return Err(SnapshotError::Conflict(name.to_string()));
        }
        let Some(info) = table.get(key) else {
            return Err(SnapshotError::NotFound(key.to_string()));
        };
        if info.kind != SnapshotKind::Active {
            return Err(SnapshotError::InvalidArgument(format!(
                "snapshot {key} is not active"
            )));
        }

        let Some(mut committed) = table.remove(key) else {
            return Err(SnapshotError::NotFound(key.to_string()));
        };
        committed.key = name.to_string();
        committed.kind = SnapshotKind::Committed;
        committed.usage_bytes = usage_bytes;
        committed.usage_inodes = usage_inodes;
        self.write_descriptor(&committed)?;
        table.insert(name.to_string(), committed.clone());

        debug!(key, name, "snapshot committed");
        Ok(committed)
    }

    /// Drop a row; the caller removes the directory.
    pub fn remove(&self, key: &str) -> Result<SnapshotInfo> {
        let mut table = self.table.lock().unwrap();
        table
            .remove(key)
            .ok_or_else(|| SnapshotError::NotFound(key.to_string()))
    }

    /// All rows matching the filters. Supported filters: `kind==<kind>`,
    /// `parent==<key>`; an empty list matches everything.
    pub fn walk(&self, filters: &[String]) -> Vec<SnapshotInfo> {
        let table = self.table.lock().unwrap();
        let mut rows: Vec<SnapshotInfo> = table
            .values()
            .filter(|info| {
                filters.iter().all(|f| match f.split_once("==") {
                    Some(("kind", kind)) => match info.kind {
                        SnapshotKind::Active => kind == "active",
                        SnapshotKind::View => kind == "view",
                        SnapshotKind::Committed => kind == "committed",
                    },
                    Some(("parent", parent)) => info.parent == parent,
                    _ => true,
                })
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key.cmp(&b.key)));
        rows
    }
}
