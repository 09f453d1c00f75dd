//! # strata-cas
//!
//! Content-addressed chunk store.
//!
//! Chunks are byte strings of at most 4 MiB, stored at-most-once in a single
//! flat directory under the lowercase hex rendering of their SHA-256 digest:
//!
//! ```text
//! <root>/chunks/<64-hex-digest>
//! ```
//!
//! Writes go to a sibling `.tmp` path and are renamed into place, so readers
//! never observe partial content. The store owns chunk files on disk; the
//! chunk index owns their reference counts.

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Fixed chunk size: 4 MiB. The final chunk of a file may be shorter.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

const CHUNKS_DIR: &str = "chunks";
const CHUNK_FILE_MODE: u32 = 0o644;
const CHUNKS_DIR_MODE: u32 = 0o700;

#[derive(Debug, thiserror::Error)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk not found: {digest}")]
    NotFound { digest: String },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("invalid digest {0:?}: must be 64 lowercase hex characters")]
    InvalidDigest(String),
}

pub type Result<T> = std::result::Result<T, CasError>;

/// Compute the SHA-256 digest of `data`, rendered as 64 lowercase hex chars.
pub fn digest_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn validate_digest(digest: &str) -> Result<()> {
    if digest.len() == 64
        && digest
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        Ok(())
    } else {
        Err(CasError::InvalidDigest(digest.to_string()))
    }
}

/// On-disk content-addressed store for fixed-size chunks.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    chunks_dir: PathBuf,
}

impl ChunkStore {
    /// Open (creating if needed) the chunk directory under `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let chunks_dir = root.as_ref().join(CHUNKS_DIR);
        if !chunks_dir.exists() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(CHUNKS_DIR_MODE)
                .create(&chunks_dir)?;
        }
        Ok(Self { chunks_dir })
    }

    /// Directory holding the chunk files.
    pub fn dir(&self) -> &Path {
        &self.chunks_dir
    }

    fn chunk_path(&self, digest: &str) -> PathBuf {
        self.chunks_dir.join(digest)
    }

    /// Store a chunk under `digest`. Idempotent: an existing file wins and
    /// the write is skipped. When `verify` is set the digest is recomputed
    /// and checked before anything touches the disk.
    pub fn put(&self, digest: &str, bytes: &[u8], verify: bool) -> Result<()> {
        validate_digest(digest)?;
        if verify {
            let actual = digest_bytes(bytes);
            if actual != digest {
                return Err(CasError::DigestMismatch {
                    expected: digest.to_string(),
                    actual,
                });
            }
        }

        let path = self.chunk_path(digest);
        if path.exists() {
            debug!(digest = %&digest[..12], "chunk already present, skipping write");
            return Ok(());
        }

        // Unique per writer so concurrent identical puts never share a
        // temp file; the last rename wins with identical content.
        static TMP_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let seq = TMP_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let tmp = self
            .chunks_dir
            .join(format!("{digest}.{}.{}.tmp", std::process::id(), seq));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            let mut perms = file.metadata()?.permissions();
            perms.set_mode(CHUNK_FILE_MODE);
            file.set_permissions(perms)?;
        }
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        debug!(digest = %&digest[..12], size = bytes.len(), "chunk stored");
        Ok(())
    }

    /// Whether a chunk file exists for `digest`.
    pub fn exists(&self, digest: &str) -> bool {
        self.chunk_path(digest).exists()
    }

    /// Open a chunk for reading.
    pub fn open(&self, digest: &str) -> Result<File> {
        validate_digest(digest)?;
        File::open(self.chunk_path(digest)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CasError::NotFound {
                    digest: digest.to_string(),
                }
            } else {
                e.into()
            }
        })
    }

    /// Read a chunk fully into memory.
    pub fn read(&self, digest: &str) -> Result<Vec<u8>> {
        validate_digest(digest)?;
        fs::read(self.chunk_path(digest)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CasError::NotFound {
                    digest: digest.to_string(),
                }
            } else {
                e.into()
            }
        })
    }

    /// Read a chunk and verify its content hashes to its name. Mandatory
    /// path when the bytes are untrusted.
    pub fn read_verified(&self, digest: &str) -> Result<Vec<u8>> {
        let bytes = self.read(digest)?;
        let actual = digest_bytes(&bytes);
        if actual != digest {
            return Err(CasError::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }
        Ok(bytes)
    }

    /// Remove a chunk file. Called when its refcount reaches zero.
    pub fn delete(&self, digest: &str) -> Result<()> {
        validate_digest(digest)?;
        match fs::remove_file(self.chunk_path(digest)) {
            Ok(()) => {
                debug!(digest = %&digest[..12], "chunk deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CasError::NotFound {
                digest: digest.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of chunk files on disk (excluding leftover temp files).
    pub fn count(&self) -> Result<usize> {
        let mut n = 0;
        for entry in fs::read_dir(&self.chunks_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file()
                && !entry.file_name().to_string_lossy().ends_with(".tmp")
            {
                n += 1;
            }
        }
        Ok(n)
    }

    /// Total bytes stored across all chunk files.
    pub fn total_bytes(&self) -> Result<u64> {
        let mut total = 0;
        for entry in fs::read_dir(&self.chunks_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file()
                && !entry.file_name().to_string_lossy().ends_with(".tmp")
            {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }

    /// Remove `.tmp` leftovers from interrupted writes.
    pub fn sweep_partials(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.chunks_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file()
                && entry.file_name().to_string_lossy().ends_with(".tmp")
            {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ChunkStore) {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_and_read_back() {
        let (_dir, store) = store();
        let data = vec![0xABu8; 1024];
        let digest = digest_bytes(&data);

        store.put(&digest, &data, true).unwrap();
        assert!(store.exists(&digest));
        assert_eq!(store.read(&digest).unwrap(), data);
        assert_eq!(store.read_verified(&digest).unwrap(), data);
    }

    #[test]
    fn test_put_is_idempotent() {
        let (_dir, store) = store();
        let data = b"chunk content".to_vec();
        let digest = digest_bytes(&data);

        store.put(&digest, &data, false).unwrap();
        store.put(&digest, &data, false).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_put_rejects_wrong_digest_when_verifying() {
        let (_dir, store) = store();
        let digest = digest_bytes(b"something else");

        let err = store.put(&digest, b"actual bytes", true).unwrap_err();
        assert!(matches!(err, CasError::DigestMismatch { .. }));
        assert!(!store.exists(&digest));
    }

    #[test]
    fn test_invalid_digest_rejected() {
        let (_dir, store) = store();
        assert!(matches!(
            store.put("ABCD", b"x", false),
            Err(CasError::InvalidDigest(_))
        ));
        // Uppercase hex is not a valid name either.
        let upper = digest_bytes(b"x").to_uppercase();
        assert!(matches!(
            store.read(&upper),
            Err(CasError::InvalidDigest(_))
        ));
    }

    #[test]
    fn test_read_verified_detects_corruption() {
        let (_dir, store) = store();
        let data = b"original".to_vec();
        let digest = digest_bytes(&data);
        store.put(&digest, &data, false).unwrap();

        std::fs::write(store.dir().join(&digest), b"tampered").unwrap();
        assert!(matches!(
            store.read_verified(&digest),
            Err(CasError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_delete_and_not_found() {
        let (_dir, store) = store();
        let data = b"to delete".to_vec();
        let digest = digest_bytes(&data);
        store.put(&digest, &data, false).unwrap();

        store.delete(&digest).unwrap();
        assert!(!store.exists(&digest));
        assert!(matches!(
            store.delete(&digest),
            Err(CasError::NotFound { .. })
        ));
        assert!(matches!(
            store.read(&digest),
            Err(CasError::NotFound { .. })
        ));
    }

    #[test]
    fn test_file_mode() {
        use std::os::unix::fs::MetadataExt;
        let (_dir, store) = store();
        let data = b"perm check".to_vec();
        let digest = digest_bytes(&data);
        store.put(&digest, &data, false).unwrap();

        let meta = std::fs::metadata(store.dir().join(&digest)).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o644);
    }

    #[test]
    fn test_sweep_partials() {
        let (_dir, store) = store();
        let digest = digest_bytes(b"real");
        store.put(&digest, b"real", false).unwrap();
        std::fs::write(store.dir().join("deadbeef.tmp"), b"partial").unwrap();

        assert_eq!(store.sweep_partials().unwrap(), 1);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_concurrent_identical_puts_store_once() {
        let (_dir, store) = store();
        let data = std::sync::Arc::new(vec![0x5Au8; CHUNK_SIZE]);
        let digest = digest_bytes(&data);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let store = store.clone();
            let data = std::sync::Arc::clone(&data);
            let digest = digest.clone();
            handles.push(std::thread::spawn(move || {
                store.put(&digest, &data, false).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.read_verified(&digest).unwrap().len(), CHUNK_SIZE);
    }
}
