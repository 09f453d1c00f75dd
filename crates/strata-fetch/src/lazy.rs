//! Simple lazy fetch fallback.
//!
//! When the kernel cache backend is unavailable (or disabled), chunks are
//! fetched whole into a flat on-disk cache directory instead of cache
//! objects. Downloads land in a `.tmp` sibling and are renamed into place.

use crate::{BoxFuture, ChunkFetcher, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

const LAZY_QUEUE_SIZE: usize = 1000;
const LAZY_WORKERS: usize = 4;

struct LazyTask {
    image_id: String,
    chunk_digest: String,
}

/// Whole-chunk loader with a small prefetch worker pool.
pub struct LazyLoader {
    cache_dir: PathBuf,
    fetcher: Arc<dyn ChunkFetcher>,
    loaded: RwLock<HashSet<String>>,
    queue_tx: mpsc::Sender<LazyTask>,
    cancel_tx: watch::Sender<bool>,
    workers: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl LazyLoader {
    pub fn new<P: AsRef<Path>>(root: P, fetcher: Arc<dyn ChunkFetcher>) -> Result<Arc<Self>> {
        use std::os::unix::fs::DirBuilderExt;
        let cache_dir = root.as_ref().join("lazy-cache");
        if !cache_dir.exists() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&cache_dir)?;
        }

        let (queue_tx, queue_rx) = mpsc::channel(LAZY_QUEUE_SIZE);
        let (cancel_tx, _) = watch::channel(false);

        let loader = Arc::new(Self {
            cache_dir,
            fetcher,
            loaded: RwLock::new(HashSet::new()),
            queue_tx,
            cancel_tx,
            workers: StdMutex::new(Vec::new()),
        });

        let shared_rx = Arc::new(Mutex::new(queue_rx));
        let mut workers = Vec::with_capacity(LAZY_WORKERS);
        for id in 0..LAZY_WORKERS {
            let loader_ref = Arc::clone(&loader);
            let rx = Arc::clone(&shared_rx);
            let mut cancel_rx = loader.cancel_tx.subscribe();
            workers.push(tokio::spawn(async move {
                loop {
                    let task = tokio::select! {
                        _ = cancel_rx.changed() => {
                            if *cancel_rx.borrow() {
                                break;
                            }
                            continue;
                        }
                        task = async {
                            let mut rx = rx.lock().await;
                            rx.recv().await
                        } => match task {
                            Some(task) => task,
                            None => break,
                        },
                    };

                    match loader_ref
                        .load_chunk(&task.chunk_digest, &task.image_id)
                        .await
                    {
                        Ok(_) => {
                            debug!(worker = id, chunk = %task.chunk_digest, "chunk prefetched")
                        }
                        Err(e) => {
                            warn!(worker = id, chunk = %task.chunk_digest, error = %e, "lazy prefetch failed")
                        }
                    }
                }
            }));
        }
        *loader.workers.lock().unwrap() = workers;

        info!(cache_dir = %loader.cache_dir.display(), "lazy loader started");
        Ok(loader)
    }

    fn chunk_path(&self, chunk_digest: &str) -> PathBuf {
        self.cache_dir.join(chunk_digest)
    }

    /// Fetch a chunk into the cache (idempotent) and return its path.
    pub fn load_chunk<'a>(
        &'a self,
        chunk_digest: &'a str,
        image_id: &'a str,
    ) -> BoxFuture<'a, Result<PathBuf>> {
        Box::pin(async move {
            let path = self.chunk_path(chunk_digest);

            if self.loaded.read().unwrap().contains(chunk_digest) && path.exists() {
                return Ok(path);
            }
            if path.exists() {
                self.loaded.write().unwrap().insert(chunk_digest.to_string());
                return Ok(path);
            }

            let data = self.fetcher.fetch_blob(image_id, chunk_digest).await?;

            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, &data).await?;
            if let Err(e) = tokio::fs::rename(&tmp, &path).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e.into());
            }

            self.loaded.write().unwrap().insert(chunk_digest.to_string());
            debug!(chunk = %chunk_digest, size = data.len(), "chunk loaded");
            Ok(path)
        })
    }

    /// Queue chunks for background prefetch; a full queue drops the rest.
    pub fn prefetch(&self, image_id: &str, chunk_digests: &[String]) {
        for digest in chunk_digests {
            let task = LazyTask {
                image_id: image_id.to_string(),
                chunk_digest: digest.clone(),
            };
            if self.queue_tx.try_send(task).is_err() {
                warn!(chunk = %digest, "lazy prefetch queue full, skipping");
            }
        }
    }

    /// Replay a trace file through the prefetch queue.
    pub fn prefetch_with_trace(&self, image_id: &str, trace_path: &Path) -> Result<()> {
        let entries = crate::prefetch::load_trace(trace_path)?;
        info!(entries = entries.len(), "trace loaded for lazy prefetch");
        let digests: Vec<String> = entries.into_iter().map(|e| e.chunk_digest).collect();
        self.prefetch(image_id, &digests);
        Ok(())
    }

    /// Cache statistics: loaded chunk count, files and bytes on disk.
    pub fn cache_stats(&self) -> Result<LazyCacheStats> {
        let mut files = 0u64;
        let mut bytes = 0u64;
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files += 1;
                bytes += entry.metadata()?.len();
            }
        }
        Ok(LazyCacheStats {
            loaded_chunks: self.loaded.read().unwrap().len() as u64,
            cached_files: files,
            total_size: bytes,
        })
    }

    /// Cancel workers and drain the pool.
    pub async fn shutdown(&self) {
        let _ = self.cancel_tx.send(true);
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            let _ = handle.await;
        }
        info!("lazy loader stopped");
    }
}

#[derive(Debug, Clone, Default)]
pub struct LazyCacheStats {
    pub loaded_chunks: u64,
    pub cached_files: u64,
    pub total_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::FakeFetcher;
    use std::time::Duration;

    #[tokio::test]
    async fn test_load_chunk_writes_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::serving("abc", b"chunk bytes".to_vec());
        let loader = LazyLoader::new(dir.path(), fetcher.as_fetcher()).unwrap();

        let path = loader.load_chunk("abc", "img-1").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"chunk bytes");

        // Second load is served from disk.
        loader.load_chunk("abc", "img-1").await.unwrap();
        assert_eq!(fetcher.calls(), 1);

        let stats = loader.cache_stats().unwrap();
        assert_eq!(stats.cached_files, 1);
        assert_eq!(stats.loaded_chunks, 1);
        loader.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_no_partial() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::default();
        let loader = LazyLoader::new(dir.path(), fetcher.as_fetcher()).unwrap();

        assert!(loader.load_chunk("missing", "img-1").await.is_err());
        let stats = loader.cache_stats().unwrap();
        assert_eq!(stats.cached_files, 0);
        loader.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_prefetch() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::serving("c1", vec![1u8; 16]);
        let loader = LazyLoader::new(dir.path(), fetcher.as_fetcher()).unwrap();

        loader.prefetch("img-1", &["c1".to_string()]);
        for _ in 0..100 {
            if loader.cache_stats().unwrap().cached_files == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(loader.cache_stats().unwrap().cached_files, 1);
        loader.shutdown().await;
    }
}
