//! # strata-layer
//!
//! Layer ingestion pipeline: decompress → apply → walk → chunk → pack.
//!
//! A layer archive is streamed to disk while its SHA-256 is computed; that
//! content digest is the whole-layer dedup key. The applied tree is walked
//! and large files are sliced into fixed 4 MiB chunks recorded through the
//! chunk index, then an external packer turns the tree into a read-only
//! image. Small files (< 4 MiB) are copied verbatim; chunking them churns
//! refcounts for no dedup win.

pub mod archive;
pub mod image;
pub mod stream;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_cas::{ChunkStore, CHUNK_SIZE};
use strata_index::ChunkIndex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub use image::{ImagePacker, PackerOptions};

#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index error: {0}")]
    Index(#[from] strata_index::IndexError),

    #[error("chunk store error: {0}")]
    Store(#[from] strata_cas::CasError),

    #[error("image packer error: {0}")]
    ImagePacker(String),
}

pub type Result<T> = std::result::Result<T, LayerError>;

/// Descriptor written next to each built image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerMetadata {
    pub layer_id: String,
    pub digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub image: PathBuf,
    pub size: u64,
    pub file_count: u64,
}

/// Receives newly built layers, e.g. the cache daemon registration path.
pub trait LayerRegistrar: Send + Sync {
    fn register_layer(
        &self,
        layer_id: &str,
        manifest_path: &Path,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Removes ephemeral build state on every exit path.
struct Unwind(Vec<PathBuf>);

impl Drop for Unwind {
    fn drop(&mut self) {
        for path in &self.0 {
            if path.is_dir() {
                let _ = fs::remove_dir_all(path);
            } else {
                let _ = fs::remove_file(path);
            }
        }
    }
}

/// Builds read-only deduplicated images out of layer archives.
pub struct LayerBuilder {
    root: PathBuf,
    store: ChunkStore,
    index: Arc<ChunkIndex>,
    packer: ImagePacker,
    registrar: Option<Arc<dyn LayerRegistrar>>,
}

impl LayerBuilder {
    pub fn new(
        root: PathBuf,
        store: ChunkStore,
        index: Arc<ChunkIndex>,
        packer: ImagePacker,
    ) -> Result<Self> {
        for sub in ["temp", "extract", "images", "metadata", "manifests"] {
            fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self {
            root,
            store,
            index,
            packer,
            registrar: None,
        })
    }

    /// Attach a registrar notified after every successful build.
    pub fn with_registrar(mut self, registrar: Arc<dyn LayerRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn image_path(&self, layer_id: &str) -> PathBuf {
        self.root.join("images").join(format!("{layer_id}.img"))
    }

    pub fn has_image(&self, layer_id: &str) -> bool {
        self.image_path(layer_id).exists()
    }

    pub fn manifest_path(&self, layer_id: &str) -> PathBuf {
        self.root
            .join("manifests")
            .join(format!("{layer_id}.manifest"))
    }

    /// Ingest one layer archive. Idempotent per content digest: a layer
    /// whose archive was processed before short-circuits successfully.
    pub fn process_layer<R: Read>(
        &self,
        layer_id: &str,
        archive: R,
        parent: Option<&str>,
    ) -> Result<()> {
        let start = std::time::Instant::now();
        let temp_path = self.root.join("temp").join(format!("{layer_id}.tar"));
        let staging = self.root.join("extract").join(layer_id);
        let image_input = self
            .root
            .join("extract")
            .join(format!("{layer_id}.image"));
        let _unwind = Unwind(vec![temp_path.clone(), staging.clone(), image_input.clone()]);

        let digest = stream_to_file(archive, &temp_path)?;

        if let Some(existing) = self.index.layer_for_digest(&digest)? {
            info!(
                layer_id,
                existing,
                digest = %&digest[..12],
                "layer content already processed, short-circuiting"
            );
            return Ok(());
        }
        self.index.register_layer(layer_id, &digest)?;

        fs::create_dir_all(&staging)?;
        let tar_stream = archive::open_decompressed(&temp_path)?;
        let applied = archive::apply_layer(tar_stream, &staging)?;
        debug!(layer_id, entries = applied, "layer archive applied");

        fs::create_dir_all(&image_input)?;
        self.build_image_tree(layer_id, &staging, &image_input)?;

        let image_path = self.image_path(layer_id);
        self.packer.pack(&image_input, &image_path)?;

        let metadata = LayerMetadata {
            layer_id: layer_id.to_string(),
            digest: digest.clone(),
            parent: parent.map(|p| p.to_string()),
            image: image_path,
            size: dir_size(&staging),
            file_count: count_regular_files(&staging),
        };
        self.save_metadata(&metadata)?;

        if let Some(registrar) = &self.registrar {
            let manifest_path = self.manifest_path(layer_id);
            match self.write_manifest(&staging, &manifest_path) {
                Ok(()) => {
                    if let Err(e) = registrar.register_layer(layer_id, &manifest_path) {
                        warn!(layer_id, error = %e, "layer registration failed");
                    }
                }
                Err(e) => warn!(layer_id, error = %e, "manifest generation failed"),
            }
        }

        info!(
            layer_id,
            digest = %&digest[..12],
            files = metadata.file_count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "layer processed"
        );
        Ok(())
    }

    /// Convert an already-applied tree into a read-only image. Used for
    /// trees imported directly into a snapshot's upper directory, where no
    /// archive (and hence no content digest) exists.
    pub fn convert_tree(&self, layer_id: &str, tree: &Path) -> Result<()> {
        let image_input = self
            .root
            .join("extract")
            .join(format!("{layer_id}.image"));
        let _unwind = Unwind(vec![image_input.clone()]);

        fs::create_dir_all(&image_input)?;
        self.build_image_tree(layer_id, tree, &image_input)?;
        self.packer.pack(&image_input, &self.image_path(layer_id))?;

        if let Some(registrar) = &self.registrar {
            let manifest_path = self.manifest_path(layer_id);
            match self.write_manifest(tree, &manifest_path) {
                Ok(()) => {
                    if let Err(e) = registrar.register_layer(layer_id, &manifest_path) {
                        warn!(layer_id, error = %e, "layer registration failed");
                    }
                }
                Err(e) => warn!(layer_id, error = %e, "manifest generation failed"),
            }
        }

        info!(layer_id, tree = %tree.display(), "tree converted to read-only image");
        Ok(())
    }

    /// Mirror the staging tree into the packer input tree, slicing large
    /// files through the chunk store on the way.
    fn build_image_tree(&self, layer_id: &str, staging: &Path, target: &Path) -> Result<()> {
        for entry in WalkDir::new(staging) {
            let entry = entry.map_err(std::io::Error::from)?;
            let rel = entry
                .path()
                .strip_prefix(staging)
                .expect("walk stays under staging");
            if rel.as_os_str().is_empty() {
                continue;
            }
            let dest = target.join(rel);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                fs::create_dir_all(&dest)?;
                let mode = entry.metadata().map_err(std::io::Error::from)?.mode();
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
            } else if file_type.is_symlink() {
                let link = fs::read_link(entry.path())?;
                std::os::unix::fs::symlink(&link, &dest)?;
            } else if file_type.is_file() {
                let meta = entry.metadata().map_err(std::io::Error::from)?;
                if meta.len() < CHUNK_SIZE as u64 {
                    fs::copy(entry.path(), &dest)?;
                } else {
                    let chunks = self.chunk_file(layer_id, entry.path())?;
                    self.reconstruct_file(&chunks, &dest)?;
                    fs::set_permissions(&dest, fs::Permissions::from_mode(meta.mode()))?;
                }
            }
        }
        Ok(())
    }

    /// Slice a file into sequential 4 MiB windows, storing and recording
    /// each. Returns the ordered digests.
    fn chunk_file(&self, layer_id: &str, path: &Path) -> Result<Vec<String>> {
        let mut file = File::open(path)?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut digests = Vec::new();

        loop {
            let n = read_full(&mut file, &mut buffer)?;
            if n == 0 {
                break;
            }
            let window = &buffer[..n];
            let digest = strata_cas::digest_bytes(window);

            if !self.store.exists(&digest) {
                self.store.put(&digest, window, false)?;
            }
            self.index
                .record_layer_chunk(layer_id, &digest, n as u64)?;
            digests.push(digest);

            if n < CHUNK_SIZE {
                break;
            }
        }

        debug!(path = %path.display(), chunks = digests.len(), "file chunked");
        Ok(digests)
    }

    /// Rebuild a file from its chunk sequence. The store keeps the content;
    /// the image layout keeps the filesystem structure.
    fn reconstruct_file(&self, digests: &[String], dest: &Path) -> Result<()> {
        let mut out = File::create(dest)?;
        for digest in digests {
            let data = self.store.read(digest)?;
            out.write_all(&data)?;
        }
        Ok(())
    }

    fn save_metadata(&self, metadata: &LayerMetadata) -> Result<()> {
        let path = self
            .root
            .join("metadata")
            .join(format!("{}.json", metadata.layer_id));
        let data = serde_json::to_vec_pretty(metadata).map_err(std::io::Error::other)?;
        fs::write(path, data)?;
        Ok(())
    }

    /// Load a previously written descriptor.
    pub fn load_metadata(&self, layer_id: &str) -> Result<LayerMetadata> {
        let path = self.root.join("metadata").join(format!("{layer_id}.json"));
        let data = fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| LayerError::Io(std::io::Error::other(e)))
    }

    /// `relative_path TAB size TAB sha256` per regular file.
    fn write_manifest(&self, tree: &Path, manifest_path: &Path) -> Result<()> {
        let mut out = File::create(manifest_path)?;
        for entry in WalkDir::new(tree) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(tree).expect("under tree");
            let size = entry.metadata().map_err(std::io::Error::from)?.len();
            let digest = hash_file(entry.path())?;
            writeln!(out, "{}\t{}\t{}", rel.display(), size, digest)?;
        }
        Ok(())
    }
}

/// Stream a reader to a file, returning the SHA-256 of everything written.
fn stream_to_file<R: Read>(mut reader: R, path: &Path) -> Result<String> {
    let mut file = File::create(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])?;
    }
    file.sync_all()?;
    Ok(hex::encode(hasher.finalize()))
}

/// Fill `buf` as far as the reader allows; short only at end of stream.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn count_regular_files(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count() as u64
}
