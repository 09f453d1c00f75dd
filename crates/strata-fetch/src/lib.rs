//! # strata-fetch
//!
//! On-demand chunk fetch engine: a bounded FIFO task queue feeding a fixed
//! worker pool that populates cache objects through byte-range registry
//! fetches. Tasks for the same chunk coalesce on the idempotent object
//! existence check; no stronger cross-chunk ordering is promised.

pub mod lazy;
pub mod prefetch;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use strata_fscache::{CacheControl, Volume};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Per-request timeout for registry fetches.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Transient fetch failures are retried this many times before the task is
/// dropped.
const FETCH_RETRIES: u32 = 2;
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Bound on worker drain time during shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("cache error: {0}")]
    Cache(#[from] strata_fscache::CacheError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("prefetch already active for image {0}")]
    JobConflict(String),

    #[error("no active prefetch job for image {0}")]
    JobNotFound(String),

    #[error("fetch queue closed")]
    QueueClosed,
}

pub type Result<T> = std::result::Result<T, FetchError>;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Registry access boundary; tests substitute an in-memory implementation.
pub trait ChunkFetcher: Send + Sync {
    /// Ranged read of `[offset, offset+size)` from a layer blob.
    fn fetch_range(
        &self,
        image_id: &str,
        layer_digest: &str,
        offset: u64,
        size: u64,
    ) -> BoxFuture<'_, Result<Vec<u8>>>;

    /// Whole-blob read, used by the simple lazy fallback path.
    fn fetch_blob(&self, image_id: &str, digest: &str) -> BoxFuture<'_, Result<Vec<u8>>>;
}

/// Production fetcher issuing `GET <registry>/v2/<image>/blobs/<digest>`.
pub struct HttpChunkFetcher {
    client: reqwest::Client,
    registry: String,
}

impl HttpChunkFetcher {
    pub fn new(registry: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| FetchError::Http(e.to_string()))?;
        Ok(Self { client, registry })
    }

    async fn get(&self, url: String, range: Option<String>) -> Result<Vec<u8>> {
        let mut request = self.client.get(&url);
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range);
        }
        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Http(format!("{url}: {e}")))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::PARTIAL_CONTENT {
            return Err(FetchError::Http(format!("{url}: unexpected status {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Http(format!("{url}: read body: {e}")))?;
        Ok(body.to_vec())
    }
}

impl ChunkFetcher for HttpChunkFetcher {
    fn fetch_range(
        &self,
        image_id: &str,
        layer_digest: &str,
        offset: u64,
        size: u64,
    ) -> BoxFuture<'_, Result<Vec<u8>>> {
        let url = format!("{}/v2/{}/blobs/{}", self.registry, image_id, layer_digest);
        let range = format!("bytes={}-{}", offset, offset + size - 1);
        Box::pin(self.get(url, Some(range)))
    }

    fn fetch_blob(&self, image_id: &str, digest: &str) -> BoxFuture<'_, Result<Vec<u8>>> {
        let url = format!("{}/v2/{}/blobs/sha256:{}", self.registry, image_id, digest);
        Box::pin(self.get(url, None))
    }
}

/// One unit of population work.
pub struct FetchTask {
    pub image_id: String,
    pub layer_digest: String,
    pub chunk_digest: String,
    pub offset: u64,
    pub size: u64,
    pub priority: i32,
    pub volume: Arc<Volume>,
}

/// Bounded queue plus fixed worker pool.
pub struct FetchEngine {
    queue_tx: mpsc::Sender<FetchTask>,
    cancel_tx: watch::Sender<bool>,
    workers: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    fetcher: Arc<dyn ChunkFetcher>,
    control: Arc<dyn CacheControl>,
}

impl FetchEngine {
    /// Start `worker_count` workers over a queue of `queue_size` slots.
    pub fn new(
        worker_count: usize,
        queue_size: usize,
        fetcher: Arc<dyn ChunkFetcher>,
        control: Arc<dyn CacheControl>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(queue_size);
        let (cancel_tx, _) = watch::channel(false);
        let shared_rx = Arc::new(Mutex::new(queue_rx));

        let engine = Arc::new(Self {
            queue_tx,
            cancel_tx,
            workers: std::sync::Mutex::new(Vec::new()),
            fetcher,
            control,
        });

        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let rx = Arc::clone(&shared_rx);
            let cancel_rx = engine.cancel_tx.subscribe();
            let fetcher = Arc::clone(&engine.fetcher);
            let control = Arc::clone(&engine.control);
            workers.push(tokio::spawn(worker_loop(id, rx, cancel_rx, fetcher, control)));
        }
        *engine.workers.lock().unwrap() = workers;

        info!(workers = worker_count, queue_size, "fetch engine started");
        engine
    }

    /// Enqueue a task without blocking. A full queue drops the task, as
    /// does a closed one; both are logged and reported to the caller.
    pub fn enqueue(&self, task: FetchTask) -> bool {
        match self.queue_tx.try_send(task) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!(chunk = %task.chunk_digest, "fetch queue full, dropping task");
                false
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                warn!(chunk = %task.chunk_digest, "fetch queue closed, dropping task");
                false
            }
        }
    }

    /// Queue depth currently available.
    pub fn capacity(&self) -> usize {
        self.queue_tx.capacity()
    }

    /// Cancel workers, close the queue and drain with a bounded join.
    pub async fn shutdown(&self) {
        let _ = self.cancel_tx.send(true);
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
                warn!("fetch worker did not drain in time, aborting");
            }
        }
        info!("fetch engine stopped");
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<FetchTask>>>,
    mut cancel_rx: watch::Receiver<bool>,
    fetcher: Arc<dyn ChunkFetcher>,
    control: Arc<dyn CacheControl>,
) {
    debug!(worker = id, "fetch worker started");
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

        let chunk = task.chunk_digest.clone();
        match process_task(&*fetcher, &*control, task).await {
            Ok(()) => debug!(worker = id, chunk = %chunk, "task completed"),
            Err(e) => warn!(worker = id, chunk = %chunk, error = %e, "task dropped after retries"),
        }
    }
    debug!(worker = id, "fetch worker stopped");
}

/// Populate one cache object: existence check, idempotent create, ranged
/// fetch with bounded retry, write at offset zero, mark complete.
async fn process_task(
    fetcher: &dyn ChunkFetcher,
    control: &dyn CacheControl,
    task: FetchTask,
) -> Result<()> {
    if let Some(object) = task.volume.object(&task.chunk_digest) {
        if object.is_complete() {
            debug!(chunk = %task.chunk_digest, "chunk already cached");
            return Ok(());
        }
    }

    let object = task
        .volume
        .create_object(control, &task.chunk_digest, task.size)?;

    let mut attempt = 0;
    let data = loop {
        match fetcher
            .fetch_range(&task.image_id, &task.layer_digest, task.offset, task.size)
            .await
        {
            Ok(data) => break data,
            Err(e) if attempt < FETCH_RETRIES => {
                attempt += 1;
                warn!(chunk = %task.chunk_digest, attempt, error = %e, "fetch failed, retrying");
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(e) => return Err(e),
        }
    };

    object.write(0, &data)?;
    object.mark_complete()?;
    debug!(chunk = %task.chunk_digest, size = data.len(), "chunk fetched and cached");
    Ok(())
}
