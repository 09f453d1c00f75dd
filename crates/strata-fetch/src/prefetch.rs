//! Trace-driven prefetch.
//!
//! A prefetch job replays an ordered access trace for one image, feeding
//! the fetch engine under a concurrency bound. A small predictor records,
//! for each consumed chunk, the window of chunks that followed it in the
//! trace, so future reads can pre-queue likely followers.

use crate::{FetchEngine, FetchError, FetchTask, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use strata_fscache::Volume;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Concurrent in-flight prefetches within one job.
const MAX_CONCURRENT: usize = 8;

/// Pacing delay between enqueues.
const PACING: Duration = Duration::from_millis(10);

/// Followers recorded per consumed chunk.
const PREDICT_WINDOW: usize = 5;

/// Confidence attached to recorded windows.
const PREDICT_PROBABILITY: f64 = 0.8;

/// Chunk-granular trace entries carry a synthesized offset at a 4 MiB
/// stride.
const TRACE_STRIDE: u64 = 4 * 1024 * 1024;

/// One access record: `(offset, size, chunk_digest, timestamp)`.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub offset: u64,
    pub size: u64,
    pub chunk_digest: String,
    pub timestamp: i64,
}

/// Load a trace file: one chunk digest per line, offsets synthesized
/// sequentially.
pub fn load_trace(path: &Path) -> Result<Vec<TraceEntry>> {
    let data = std::fs::read_to_string(path)?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64;

    let mut entries = Vec::new();
    let mut offset = 0u64;
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        entries.push(TraceEntry {
            offset,
            size: TRACE_STRIDE,
            chunk_digest: line.to_string(),
            timestamp: now,
        });
        offset += TRACE_STRIDE;
    }
    Ok(entries)
}

#[derive(Debug, Clone)]
struct AccessPattern {
    next_chunks: Vec<String>,
    probability: f64,
}

/// Progress snapshot of a running job.
#[derive(Debug, Clone)]
pub struct PrefetchStatus {
    pub image_id: String,
    pub total_entries: usize,
    pub completed: usize,
    pub progress: f64,
    pub elapsed: Duration,
}

struct PrefetchJob {
    cancel_tx: watch::Sender<bool>,
    completed: Arc<AtomicUsize>,
    total: usize,
    started_at: Instant,
    handle: tokio::task::JoinHandle<()>,
}

/// Manages per-image prefetch jobs over a shared fetch engine.
pub struct Prefetcher {
    engine: Arc<FetchEngine>,
    active: Mutex<HashMap<String, PrefetchJob>>,
    predictor: Mutex<HashMap<String, AccessPattern>>,
}

impl Prefetcher {
    pub fn new(engine: Arc<FetchEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            active: Mutex::new(HashMap::new()),
            predictor: Mutex::new(HashMap::new()),
        })
    }

    /// Start replaying a trace for `image_id` into `volume`. A duplicate
    /// job for the same image is a conflict.
    pub fn start(
        self: &Arc<Self>,
        image_id: &str,
        layer_digest: &str,
        volume: Arc<Volume>,
        trace_path: &Path,
    ) -> Result<()> {
        let mut active = self.active.lock().unwrap();
        if active.contains_key(image_id) {
            return Err(FetchError::JobConflict(image_id.to_string()));
        }

        let entries = load_trace(trace_path)?;
        let total = entries.len();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let completed = Arc::new(AtomicUsize::new(0));

        let handle = tokio::spawn(run_job(
            Arc::clone(self),
            image_id.to_string(),
            layer_digest.to_string(),
            volume,
            entries,
            cancel_rx,
            Arc::clone(&completed),
        ));

        active.insert(
            image_id.to_string(),
            PrefetchJob {
                cancel_tx,
                completed,
                total,
                started_at: Instant::now(),
                handle,
            },
        );

        info!(image_id, entries = total, "prefetch job started");
        Ok(())
    }

    /// Cancel a running job. Outstanding tasks are awaited by the job task
    /// before it leaves the active set.
    pub fn stop(&self, image_id: &str) -> Result<()> {
        let active = self.active.lock().unwrap();
        let job = active
            .get(image_id)
            .ok_or_else(|| FetchError::JobNotFound(image_id.to_string()))?;
        let _ = job.cancel_tx.send(true);
        info!(image_id, "prefetch job cancelled");
        Ok(())
    }

    /// Progress of a running job, if any.
    pub fn status(&self, image_id: &str) -> Option<PrefetchStatus> {
        let active = self.active.lock().unwrap();
        active.get(image_id).map(|job| {
            let completed = job.completed.load(Ordering::Acquire);
            PrefetchStatus {
                image_id: image_id.to_string(),
                total_entries: job.total,
                completed,
                progress: if job.total > 0 {
                    completed as f64 / job.total as f64 * 100.0
                } else {
                    100.0
                },
                elapsed: job.started_at.elapsed(),
            }
        })
    }

    /// Record the next-k window that followed `chunk` in a trace.
    fn update_predictor(&self, chunk: &str, entries: &[TraceEntry], index: usize) {
        if index + 1 >= entries.len() {
            return;
        }
        let next_chunks: Vec<String> = entries[index + 1..]
            .iter()
            .take(PREDICT_WINDOW)
            .map(|e| e.chunk_digest.clone())
            .collect();

        self.predictor.lock().unwrap().insert(
            chunk.to_string(),
            AccessPattern {
                next_chunks,
                probability: PREDICT_PROBABILITY,
            },
        );
    }

    /// Likely followers of `chunk`, from previously replayed traces.
    pub fn predict_next(&self, chunk: &str) -> Vec<String> {
        self.predictor
            .lock()
            .unwrap()
            .get(chunk)
            .map(|p| p.next_chunks.clone())
            .unwrap_or_default()
    }

    /// Confidence of the recorded window for `chunk`, if any.
    pub fn prediction_confidence(&self, chunk: &str) -> Option<f64> {
        self.predictor
            .lock()
            .unwrap()
            .get(chunk)
            .map(|p| p.probability)
    }

    /// Cancel every job and wait for the set to drain.
    pub async fn shutdown(&self) {
        let jobs: Vec<(String, PrefetchJob)> = {
            let mut active = self.active.lock().unwrap();
            active.drain().collect()
        };
        for (image_id, job) in jobs {
            let _ = job.cancel_tx.send(true);
            if let Err(e) = job.handle.await {
                warn!(image_id = %image_id, error = %e, "prefetch job join failed");
            }
        }
        info!("prefetcher stopped");
    }

    fn remove_job(&self, image_id: &str) {
        self.active.lock().unwrap().remove(image_id);
    }
}

async fn run_job(
    prefetcher: Arc<Prefetcher>,
    image_id: String,
    layer_digest: String,
    volume: Arc<Volume>,
    entries: Vec<TraceEntry>,
    cancel_rx: watch::Receiver<bool>,
    completed: Arc<AtomicUsize>,
) {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT));
    let mut in_flight = JoinSet::new();
    let entries = Arc::new(entries);

    for (index, entry) in entries.iter().enumerate() {
        // Cancellation is observed between entries.
        if *cancel_rx.borrow() {
            debug!(image_id = %image_id, index, "prefetch job cancelled mid-trace");
            break;
        }

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let engine = Arc::clone(&prefetcher.engine);
        let prefetcher_ref = Arc::clone(&prefetcher);
        let entries_ref = Arc::clone(&entries);
        let completed_ref = Arc::clone(&completed);
        let volume = Arc::clone(&volume);
        let image_id_task = image_id.clone();
        let layer_digest = layer_digest.clone();
        let entry = entry.clone();

        in_flight.spawn(async move {
            let _permit = permit;

            // Already populated chunks are skipped without queueing.
            let cached = volume
                .object(&entry.chunk_digest)
                .map(|o| o.is_complete())
                .unwrap_or(false);
            if !cached {
                engine.enqueue(FetchTask {
                    image_id: image_id_task,
                    layer_digest,
                    chunk_digest: entry.chunk_digest.clone(),
                    offset: entry.offset,
                    size: entry.size,
                    priority: 100,
                    volume,
                });
            }

            completed_ref.fetch_add(1, Ordering::Release);
            prefetcher_ref.update_predictor(&entry.chunk_digest, &entries_ref, index);
        });

        tokio::time::sleep(PACING).await;
    }

    // Outstanding tasks are awaited before the job leaves the active set.
    while in_flight.join_next().await.is_some() {}
    prefetcher.remove_job(&image_id);
    info!(image_id = %image_id, "prefetch job completed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::FakeFetcher;
    use strata_fscache::fake::FakeCacheControl;
    use strata_fscache::{CacheBackend, CacheControl};

    fn write_trace(dir: &tempfile::TempDir, lines: &[&str]) -> std::path::PathBuf {
        let path = dir.path().join("img-1.trace");
        std::fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    #[test]
    fn test_load_trace_synthesizes_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_trace(&dir, &["aaa", "bbb", "", "ccc"]);

        let entries = load_trace(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].offset, 0);
        assert_eq!(entries[1].offset, TRACE_STRIDE);
        assert_eq!(entries[2].offset, 2 * TRACE_STRIDE);
        assert!(entries.iter().all(|e| e.size == TRACE_STRIDE));
    }

    #[tokio::test]
    async fn test_job_replays_trace_and_records_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let control: Arc<dyn CacheControl> = Arc::new(FakeCacheControl::new());
        let backend = CacheBackend::new(dir.path(), Arc::clone(&control)).unwrap();
        let volume = backend.create_volume("img-1").unwrap();

        let fetcher = FakeFetcher::serving("layer-blob", vec![9u8; 64 * 1024 * 1024]);
        let engine = FetchEngine::new(2, 64, fetcher.as_fetcher(), control);
        let prefetcher = Prefetcher::new(Arc::clone(&engine));

        let chunks = ["c0", "c1", "c2", "c3", "c4", "c5", "c6"];
        let trace = write_trace(&dir, &chunks);
        prefetcher
            .start("img-1", "layer-blob", Arc::clone(&volume), &trace)
            .unwrap();

        // Duplicate start is a conflict while the job is active.
        assert!(matches!(
            prefetcher.start("img-1", "layer-blob", Arc::clone(&volume), &trace),
            Err(FetchError::JobConflict(_))
        ));

        // Job leaves the active set once the trace is drained.
        for _ in 0..300 {
            if prefetcher.status("img-1").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(prefetcher.status("img-1").is_none());

        // Predictor: c0's window holds the next 5 digests, with the fixed
        // confidence; the final entry records nothing.
        assert_eq!(
            prefetcher.predict_next("c0"),
            vec!["c1", "c2", "c3", "c4", "c5"]
        );
        assert_eq!(prefetcher.prediction_confidence("c0"), Some(0.8));
        assert_eq!(prefetcher.predict_next("c5"), vec!["c6"]);
        assert!(prefetcher.predict_next("c6").is_empty());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_stops_between_entries() {
        let dir = tempfile::tempdir().unwrap();
        let control: Arc<dyn CacheControl> = Arc::new(FakeCacheControl::new());
        let backend = CacheBackend::new(dir.path(), Arc::clone(&control)).unwrap();
        let volume = backend.create_volume("img-1").unwrap();

        let fetcher = FakeFetcher::serving("layer-blob", vec![0u8; 1024]);
        let engine = FetchEngine::new(1, 512, fetcher.as_fetcher(), control);
        let prefetcher = Prefetcher::new(Arc::clone(&engine));

        let lines: Vec<String> = (0..200).map(|i| format!("chunk-{i}")).collect();
        let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        let trace = write_trace(&dir, &refs);

        prefetcher
            .start("img-1", "layer-blob", volume, &trace)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        prefetcher.stop("img-1").unwrap();

        for _ in 0..200 {
            if prefetcher.status("img-1").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(prefetcher.status("img-1").is_none());

        // 10 ms pacing means a 200-entry trace takes ≥ 2 s uncancelled;
        // stopping after ~50 ms must leave most entries unconsumed.
        assert!(matches!(
            prefetcher.stop("img-1"),
            Err(FetchError::JobNotFound(_))
        ));
        engine.shutdown().await;
    }
}
