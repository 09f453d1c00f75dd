//! # strata-daemon
//!
//! Composition root. Every component is constructed here as a value and
//! handed out by explicit handle; nothing is process-global. The daemon
//! also hosts the background tasks: config watcher, cleanup tick and
//! stats tick, all carrying cancellation and joined on shutdown.

pub mod compose;
pub mod registry;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strata_cas::ChunkStore;
use strata_config::{watcher::ConfigWatcher, Config};
use strata_fetch::lazy::LazyLoader;
use strata_fetch::prefetch::Prefetcher;
use strata_fetch::{ChunkFetcher, FetchEngine, HttpChunkFetcher};
use strata_fscache::{CacheBackend, CacheControl, DeviceCacheControl};
use strata_index::ChunkIndex;
use strata_layer::{ImagePacker, LayerBuilder, PackerOptions};
use strata_memdedup::MemoryDeduplicator;
use strata_mount::{HostMountSys, MountManager, MountSys};
use strata_snapshot::{DirComposer, Ingestor, LowerComposer, Snapshotter};
use tokio::sync::watch;
use tracing::{info, warn};

use compose::ImageComposer;
use registry::CacheRegistrar;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const STATS_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Ephemeral build state older than this is swept by the cleanup tick.
const EPHEMERAL_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Adapts the layer builder to the snapshotter's conversion hook.
struct BuilderIngestor(Arc<LayerBuilder>);

impl Ingestor for BuilderIngestor {
    fn has_image(&self, layer_id: &str) -> bool {
        self.0.has_image(layer_id)
    }

    fn convert_tree(
        &self,
        layer_id: &str,
        tree: &Path,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.0.convert_tree(layer_id, tree)?;
        Ok(())
    }
}

/// The assembled snapshot store.
pub struct Daemon {
    config: Config,
    pub index: Arc<ChunkIndex>,
    pub chunk_store: ChunkStore,
    pub mounts: Arc<MountManager>,
    pub builder: Arc<LayerBuilder>,
    pub snapshotter: Arc<Snapshotter>,
    cache: Option<Arc<CacheBackend>>,
    registrar: Option<Arc<CacheRegistrar>>,
    engine: Option<Arc<FetchEngine>>,
    prefetcher: Option<Arc<Prefetcher>>,
    lazy: Option<Arc<LazyLoader>>,
    memdedup: Option<Arc<MemoryDeduplicator>>,
    cancel_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    watcher: Mutex<Option<ConfigWatcher>>,
}

impl Daemon {
    /// Build every component from a validated configuration. Must run
    /// inside a tokio runtime (worker pools spawn immediately).
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let root = config.root.clone();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("cannot acquire root directory {}", root.display()))?;
        std::fs::create_dir_all(&config.prefetch.trace_dir)?;

        let index = Arc::new(
            ChunkIndex::open(root.join("index.db")).context("failed to open chunk index")?,
        );
        let chunk_store = ChunkStore::new(&root).context("failed to open chunk store")?;
        let mounts = Arc::new(MountManager::new(
            &root,
            Arc::new(HostMountSys) as Arc<dyn MountSys>,
        )?);

        let memdedup = if config.enable_mem_dedup {
            let dedup = Arc::new(MemoryDeduplicator::new());
            if let Some(ksm) = dedup.ksm() {
                if config.ksm.enabled {
                    match ksm.enable() {
                        Ok(()) => ksm.tune(
                            config.ksm.scan_interval,
                            config.ksm.pages_to_scan,
                            config.ksm.merge_across_nodes,
                        ),
                        Err(e) => warn!(error = %e, "failed to enable KSM"),
                    }
                }
            }
            Some(dedup)
        } else {
            None
        };

        // The kernel cache is optional: when missing, mounts fall back to
        // loop devices and reads to the lazy path.
        let cache = if config.enable_erofs && config.enable_fscache {
            match CacheBackend::new(&root, Arc::new(DeviceCacheControl) as Arc<dyn CacheControl>) {
                Ok(backend) => Some(Arc::new(backend)),
                Err(e) => {
                    warn!(error = %e, "kernel cache unavailable, falling back to loop mounts");
                    None
                }
            }
        } else {
            None
        };

        let registrar = cache.as_ref().map(|c| CacheRegistrar::new(Arc::clone(c)));

        let packer = ImagePacker::new(PackerOptions::default());
        let mut builder = LayerBuilder::new(
            root.clone(),
            chunk_store.clone(),
            Arc::clone(&index),
            packer,
        )?;
        if let Some(registrar) = &registrar {
            builder = builder
                .with_registrar(Arc::clone(registrar) as Arc<dyn strata_layer::LayerRegistrar>);
        }
        let builder = Arc::new(builder);

        let fetcher: Arc<dyn ChunkFetcher> =
            Arc::new(HttpChunkFetcher::new(config.registry.clone())?);

        let (engine, prefetcher) = match &cache {
            Some(cache) => {
                let engine = FetchEngine::new(
                    config.prefetch.workers,
                    config.prefetch.queue_size,
                    Arc::clone(&fetcher),
                    Arc::clone(cache.control()),
                );
                let prefetcher = Prefetcher::new(Arc::clone(&engine));
                (Some(engine), Some(prefetcher))
            }
            None => (None, None),
        };

        let lazy = if config.enable_lazy && cache.is_none() {
            Some(LazyLoader::new(&root, Arc::clone(&fetcher))?)
        } else {
            None
        };

        let composer: Arc<dyn LowerComposer> = if config.enable_erofs {
            Arc::new(ImageComposer::new(
                &root,
                Arc::clone(&mounts),
                cache.as_ref().map(|_| "strata".to_string()),
                memdedup.clone(),
            ))
        } else {
            Arc::new(DirComposer::new(&root))
        };

        let mut snapshotter = Snapshotter::new(&root, composer)?;
        if config.enable_erofs {
            snapshotter = snapshotter
                .with_ingestor(Arc::new(BuilderIngestor(Arc::clone(&builder))) as Arc<dyn Ingestor>);
        }

        let (cancel_tx, _) = watch::channel(false);

        info!(
            root = %root.display(),
            erofs = config.enable_erofs,
            fscache = cache.is_some(),
            lazy = lazy.is_some(),
            mem_dedup = memdedup.is_some(),
            "daemon assembled"
        );

        Ok(Arc::new(Self {
            config,
            index,
            chunk_store,
            mounts,
            builder,
            snapshotter: Arc::new(snapshotter),
            cache,
            registrar,
            engine,
            prefetcher,
            lazy,
            memdedup,
            cancel_tx,
            tasks: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start the trace-driven prefetch (cache path) or trace replay into
    /// the lazy cache (fallback path) for an image.
    pub fn start_prefetch(&self, image_id: &str) -> Result<()> {
        let trace_path = self
            .config
            .prefetch
            .trace_dir
            .join(format!("{image_id}.trace"));

        if let (Some(prefetcher), Some(registrar)) = (&self.prefetcher, &self.registrar) {
            let volume = registrar
                .volume(image_id)
                .with_context(|| format!("image not registered: {image_id}"))?;
            let layer_digest = self.index.layer(image_id)?.digest;
            prefetcher.start(image_id, &layer_digest, volume, &trace_path)?;
            return Ok(());
        }

        if let Some(lazy) = &self.lazy {
            lazy.prefetch_with_trace(image_id, &trace_path)?;
            return Ok(());
        }

        anyhow::bail!("no prefetch path enabled")
    }

    /// Launch the config watcher, cleanup tick and stats tick.
    pub fn spawn_background(self: &Arc<Self>, config_path: Option<PathBuf>) -> Result<()> {
        if let Some(path) = config_path {
            let watcher = ConfigWatcher::new(path, self.config.clone())?;
            watcher.add_callback(Box::new(|old, new| {
                if old.log_level != new.log_level {
                    info!(old = %old.log_level, new = %new.log_level,
                        "log level changed; restart applies it to existing subscribers");
                }
                if old.registry != new.registry {
                    info!(registry = %new.registry, "registry endpoint updated for future fetches");
                }
            }));
            *self.watcher.lock().unwrap() = Some(watcher);
        }

        let mut tasks = self.tasks.lock().unwrap();

        {
            let daemon = Arc::clone(self);
            let mut cancel_rx = self.cancel_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel_rx.changed() => {
                            if *cancel_rx.borrow() { break; }
                        }
                        _ = tick.tick() => daemon.run_cleanup(),
                    }
                }
            }));
        }

        {
            let daemon = Arc::clone(self);
            let mut cancel_rx = self.cancel_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(STATS_INTERVAL);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel_rx.changed() => {
                            if *cancel_rx.borrow() { break; }
                        }
                        _ = tick.tick() => daemon.report_stats(),
                    }
                }
            }));
        }

        Ok(())
    }

    /// Sweep stale ephemeral state and retry deferred removals.
    pub fn run_cleanup(&self) {
        for sub in ["temp", "extract"] {
            let dir = self.config.root.join(sub);
            sweep_stale(&dir, EPHEMERAL_MAX_AGE);
        }
        match self.chunk_store.sweep_partials() {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "partial chunk files swept"),
            Err(e) => warn!(error = %e, "partial sweep failed"),
        }
        self.snapshotter.reap_deferred();
        info!("cleanup pass finished");
    }

    /// Periodic visibility into store health.
    pub fn report_stats(&self) {
        match self.index.global_stats() {
            Ok(stats) => info!(
                chunks = stats.total_chunks,
                stored_bytes = stats.stored_size,
                logical_bytes = stats.logical_size,
                dedup_ratio = format!("{:.1}%", stats.dedup_ratio),
                layers = stats.layer_count,
                "index stats"
            ),
            Err(e) => warn!(error = %e, "index stats unavailable"),
        }
        info!(active_mounts = self.mounts.active_mounts().len(), "mount stats");
        if let Some(cache) = &self.cache {
            let stats = cache.stats();
            info!(
                volumes = stats.volumes,
                objects = stats.objects,
                complete = stats.complete_objects,
                "cache stats"
            );
        }
        if let Some(engine) = &self.engine {
            info!(queue_free = engine.capacity(), "fetch queue stats");
        }
        if let Some(memdedup) = &self.memdedup {
            let stats = memdedup.stats();
            info!(
                unique_pages = stats.unique_pages,
                merged_pages = stats.merged_pages,
                saved_bytes = stats.saved_bytes,
                "page dedup stats"
            );
        }
    }

    /// Ordered teardown: cancel every token, close the fetch queue and
    /// drain its workers, then close cache, mounts and index.
    pub async fn shutdown(&self) {
        info!("daemon shutting down");
        let _ = self.cancel_tx.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        if let Some(watcher) = self.watcher.lock().unwrap().take() {
            watcher.stop();
        }

        if let Some(prefetcher) = &self.prefetcher {
            prefetcher.shutdown().await;
        }
        if let Some(engine) = &self.engine {
            engine.shutdown().await;
        }
        if let Some(lazy) = &self.lazy {
            lazy.shutdown().await;
        }

        if let Some(cache) = &self.cache {
            cache.close();
        }
        if let Err(e) = self.mounts.unmount_all() {
            warn!(error = %e, "unmount during shutdown failed");
        }
        if let Some(memdedup) = &self.memdedup {
            memdedup.close();
        }
        if let Err(e) = self.index.close() {
            warn!(error = %e, "index close failed");
        }
        info!("daemon stopped");
    }
}

fn sweep_stale(dir: &Path, max_age: Duration) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let now = std::time::SystemTime::now();
    for entry in entries.flatten() {
        let stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| now.duration_since(mtime).ok())
            .map(|age| age > max_age)
            .unwrap_or(false);
        if !stale {
            continue;
        }
        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => info!(path = %path.display(), "stale ephemeral state removed"),
            Err(e) => warn!(path = %path.display(), error = %e, "stale sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::with_root(dir.path().join("data"));
        // Keep unit tests off the kernel paths.
        config.enable_erofs = false;
        config.enable_fscache = false;
        config.enable_lazy = false;
        config.enable_mem_dedup = false;
        config.validate().unwrap();
        config
    }

    #[tokio::test]
    async fn test_daemon_assembles_and_shuts_down() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new(test_config(&dir)).unwrap();

        // Plain-directory composition path end to end.
        let mounts = daemon.snapshotter.prepare("base", None).unwrap();
        assert_eq!(mounts[0].fstype, "overlay");
        daemon.snapshotter.commit("layer-1", "base").unwrap();

        let mounts = daemon
            .snapshotter
            .prepare("container", Some("layer-1"))
            .unwrap();
        assert!(mounts[0]
            .options
            .iter()
            .any(|o| o.starts_with("lowerdir=")));

        daemon.shutdown().await;
        // Clean close removed the index sentinel.
        assert!(!dir.path().join("data/index.db.lock").exists());
    }

    #[tokio::test]
    async fn test_background_tasks_cancelled_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new(test_config(&dir)).unwrap();
        daemon.spawn_background(None).unwrap();
        daemon.shutdown().await;
        assert!(daemon.tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prefetch_without_any_path_fails() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new(test_config(&dir)).unwrap();
        assert!(daemon.start_prefetch("img").is_err());
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_only_stale_entries() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new(test_config(&dir)).unwrap();

        let temp_dir = daemon.config().root.join("temp");
        std::fs::create_dir_all(&temp_dir).unwrap();
        std::fs::write(temp_dir.join("fresh.tar"), b"x").unwrap();

        daemon.run_cleanup();
        // A freshly written archive survives the age-based sweep.
        assert!(temp_dir.join("fresh.tar").exists());
        daemon.shutdown().await;
    }
}
