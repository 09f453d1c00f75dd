//! Image registration for the cache-backed fetch path.
//!
//! A freshly built layer is registered by creating its cache volume and
//! parsing the tab-separated manifest emitted next to the image. The
//! registry is the lookup point for prefetch jobs needing a volume.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use strata_fscache::{CacheBackend, Volume};
use strata_layer::LayerRegistrar;
use tracing::{info, warn};

/// One manifest line: `relative_path TAB size TAB sha256`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: String,
    pub size: u64,
    pub digest: String,
}

struct RegisteredImage {
    volume: Arc<Volume>,
    entries: Vec<ManifestEntry>,
}

/// Registry of images known to the cache backend.
pub struct CacheRegistrar {
    backend: Arc<CacheBackend>,
    images: Mutex<HashMap<String, RegisteredImage>>,
}

impl CacheRegistrar {
    pub fn new(backend: Arc<CacheBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            images: Mutex::new(HashMap::new()),
        })
    }

    /// Volume for a registered image.
    pub fn volume(&self, image_id: &str) -> Option<Arc<Volume>> {
        self.images
            .lock()
            .unwrap()
            .get(image_id)
            .map(|img| Arc::clone(&img.volume))
    }

    /// Parsed manifest entries for a registered image.
    pub fn manifest(&self, image_id: &str) -> Option<Vec<ManifestEntry>> {
        self.images
            .lock()
            .unwrap()
            .get(image_id)
            .map(|img| img.entries.clone())
    }

    pub fn image_count(&self) -> usize {
        self.images.lock().unwrap().len()
    }
}

fn parse_manifest(data: &str) -> Vec<ManifestEntry> {
    let mut entries = Vec::new();
    for line in data.lines() {
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let (Some(path), Some(size), Some(digest)) =
            (fields.next(), fields.next(), fields.next())
        else {
            warn!(line, "malformed manifest line skipped");
            continue;
        };
        let Ok(size) = size.parse() else {
            warn!(line, "manifest size unparsable, line skipped");
            continue;
        };
        entries.push(ManifestEntry {
            path: path.to_string(),
            size,
            digest: digest.to_string(),
        });
    }
    entries
}

impl LayerRegistrar for CacheRegistrar {
    fn register_layer(
        &self,
        layer_id: &str,
        manifest_path: &Path,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut images = self.images.lock().unwrap();
        if images.contains_key(layer_id) {
            return Ok(());
        }

        let volume = self.backend.create_volume(layer_id)?;
        let data = std::fs::read_to_string(manifest_path)?;
        let entries = parse_manifest(&data);

        info!(layer_id, files = entries.len(), "layer registered with cache backend");
        images.insert(layer_id.to_string(), RegisteredImage { volume, entries });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_fscache::fake::FakeCacheControl;
    use strata_fscache::CacheControl;
    use tempfile::TempDir;

    fn registrar(dir: &TempDir) -> Arc<CacheRegistrar> {
        let control: Arc<dyn CacheControl> = Arc::new(FakeCacheControl::new());
        let backend = Arc::new(CacheBackend::new(dir.path(), control).unwrap());
        CacheRegistrar::new(backend)
    }

    #[test]
    fn test_register_creates_volume_and_parses_manifest() {
        let dir = TempDir::new().unwrap();
        let registrar = registrar(&dir);

        let manifest = dir.path().join("l1.manifest");
        std::fs::write(&manifest, "bin/sh\t100\tabc\nnot a line\netc/os\t2\tdef\n").unwrap();

        registrar.register_layer("l1", &manifest).unwrap();
        assert_eq!(registrar.image_count(), 1);
        assert!(registrar.volume("l1").is_some());

        let entries = registrar.manifest("l1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "bin/sh");
        assert_eq!(entries[0].size, 100);
        assert_eq!(entries[1].digest, "def");
    }

    #[test]
    fn test_register_idempotent() {
        let dir = TempDir::new().unwrap();
        let registrar = registrar(&dir);
        let manifest = dir.path().join("l1.manifest");
        std::fs::write(&manifest, "a\t1\tx\n").unwrap();

        registrar.register_layer("l1", &manifest).unwrap();
        registrar.register_layer("l1", &manifest).unwrap();
        assert_eq!(registrar.image_count(), 1);
    }

    #[test]
    fn test_unknown_image_lookup() {
        let dir = TempDir::new().unwrap();
        let registrar = registrar(&dir);
        assert!(registrar.volume("ghost").is_none());
        assert!(registrar.manifest("ghost").is_none());
    }
}
