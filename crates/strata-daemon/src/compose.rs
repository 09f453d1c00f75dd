//! Image-backed lower composition.
//!
//! Each parent with a built read-only image is mounted through the mount
//! manager (cache-backed naming first when enabled, loop device as the
//! fallback); parents without an image contribute their upper directory
//! directly. Page deduplication runs opportunistically over freshly
//! mounted lowers.

use std::path::PathBuf;
use std::sync::Arc;
use strata_memdedup::MemoryDeduplicator;
use strata_mount::MountManager;
use strata_snapshot::{LowerComposer, Result as SnapResult};
use tracing::{debug, warn};

pub struct ImageComposer {
    images_dir: PathBuf,
    snapshots_dir: PathBuf,
    mounts: Arc<MountManager>,
    /// Cache domain when the kernel cache path is enabled.
    cache_domain: Option<String>,
    memdedup: Option<Arc<MemoryDeduplicator>>,
}

impl ImageComposer {
    pub fn new(
        root: &std::path::Path,
        mounts: Arc<MountManager>,
        cache_domain: Option<String>,
        memdedup: Option<Arc<MemoryDeduplicator>>,
    ) -> Self {
        Self {
            images_dir: root.join("images"),
            snapshots_dir: root.join("snapshots"),
            mounts,
            cache_domain,
            memdedup,
        }
    }

    fn image_path(&self, id: &str) -> PathBuf {
        self.images_dir.join(format!("{id}.img"))
    }

    fn mount_parent(&self, id: &str, image: &std::path::Path) -> strata_mount::Result<PathBuf> {
        if let Some(domain) = &self.cache_domain {
            match self.mounts.mount_image_via_cache(id, id, domain) {
                Ok(path) => return Ok(path),
                Err(e) => {
                    warn!(id, error = %e, "cache mount failed, falling back to loop mount");
                }
            }
        }
        self.mounts.mount_image(id, image)
    }

    fn advise_mergeable(&self, mount_path: PathBuf) {
        let Some(memdedup) = self.memdedup.clone() else {
            return;
        };
        // Opportunistic; never blocks composition.
        std::thread::spawn(move || {
            let mut stack = vec![mount_path];
            while let Some(dir) = stack.pop() {
                let Ok(entries) = std::fs::read_dir(&dir) else {
                    continue;
                };
                for entry in entries.flatten() {
                    let Ok(file_type) = entry.file_type() else {
                        continue;
                    };
                    if file_type.is_dir() {
                        stack.push(entry.path());
                    } else if file_type.is_file() {
                        if let Err(e) = memdedup.deduplicate_file(&entry.path()) {
                            debug!(path = %entry.path().display(), error = %e, "page dedup skipped");
                        }
                    }
                }
            }
        });
    }
}

impl LowerComposer for ImageComposer {
    fn compose_lowers(&self, parent_ids: &[String]) -> SnapResult<Vec<PathBuf>> {
        let mut lowers = Vec::with_capacity(parent_ids.len());
        for id in parent_ids {
            let image = self.image_path(id);
            if image.exists() {
                let mount_path = self.mount_parent(id, &image)?;
                self.advise_mergeable(mount_path.clone());
                lowers.push(mount_path);
            } else {
                // No image built yet: fall back to the parent's upper dir.
                lowers.push(self.snapshots_dir.join(id).join("fs"));
            }
        }
        Ok(lowers)
    }

    fn release_lowers(&self, parent_ids: &[String]) {
        for id in parent_ids {
            if self.mounts.refcount(id).is_some() {
                if let Err(e) = self.mounts.unmount(id) {
                    warn!(id, error = %e, "parent image unmount failed");
                }
            }
        }
    }
}
