//! # strata-fscache
//!
//! Kernel page-cache-backed object cache.
//!
//! Two-level hierarchy: a `Backend` owns the cache control handle bound to
//! `<root>/fscache/`; it owns `Volume`s keyed by image id; each volume owns
//! `CacheObject`s keyed by chunk digest. The control pseudo-device speaks a
//! text protocol (`bind <dir>`, `volume <name>`, `open <key>`, `complete`)
//! with scalar payload writes at offset-addressed ranges.
//!
//! A reader observes a populated chunk iff the object is complete. Locks
//! are ordered backend → volume → object. Descriptors close in
//! object → volume → backend order on shutdown.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

const FSCACHE_SYS_PATH: &str = "/sys/fs/fscache";
const CACHEFILES_DEVICE: &str = "/dev/cachefiles";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("kernel cache unavailable: {0}")]
    KernelCacheUnavailable(String),

    #[error("cache object create failed: {0}")]
    ObjectCreateFailed(String),

    #[error("cache write failed: {0}")]
    WriteFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// One open descriptor against the cache control device.
pub trait CacheHandle: Send {
    /// Issue a text command on this descriptor.
    fn command(&mut self, command: &str) -> Result<()>;

    /// Write payload bytes at an absolute offset.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize>;
}

/// Factory for control-device descriptors; the seam tests substitute.
pub trait CacheControl: Send + Sync {
    /// Probe whether the kernel side is present at all.
    fn available(&self) -> Option<String>;

    /// Open a fresh descriptor.
    fn open_handle(&self) -> Result<Box<dyn CacheHandle>>;
}

/// Production control device at `/dev/cachefiles`.
#[derive(Debug, Default)]
pub struct DeviceCacheControl;

struct DeviceHandle(fs::File);

impl CacheHandle for DeviceHandle {
    fn command(&mut self, command: &str) -> Result<()> {
        use std::io::Write;
        self.0
            .write_all(command.as_bytes())
            .map_err(|e| CacheError::WriteFailed(format!("{command:?}: {e}")))
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        self.0
            .write_at(data, offset)
            .map_err(|e| CacheError::WriteFailed(format!("payload at {offset}: {e}")))
    }
}

impl CacheControl for DeviceCacheControl {
    fn available(&self) -> Option<String> {
        if !Path::new(FSCACHE_SYS_PATH).exists() {
            return Some("fscache not available in kernel".to_string());
        }
        if !Path::new(CACHEFILES_DEVICE).exists() {
            return Some("cachefiles module not loaded".to_string());
        }
        None
    }

    fn open_handle(&self) -> Result<Box<dyn CacheHandle>> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(CACHEFILES_DEVICE)
            .map_err(|e| {
                CacheError::KernelCacheUnavailable(format!("open {CACHEFILES_DEVICE}: {e}"))
            })?;
        Ok(Box::new(DeviceHandle(file)))
    }
}

/// A populated-or-pending chunk object inside a volume.
pub struct CacheObject {
    key: String,
    size: u64,
    state: Mutex<ObjectState>,
}

struct ObjectState {
    handle: Box<dyn CacheHandle>,
    complete: bool,
}

impl CacheObject {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Write payload bytes at `offset`.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.handle.write_at(offset, data)
    }

    /// Flip the object to reader-visible. Idempotent.
    pub fn mark_complete(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.complete {
            return Ok(());
        }
        state.handle.command("complete")?;
        state.complete = true;
        debug!(key = %self.key, "cache object complete");
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().unwrap().complete
    }
}

/// Per-image namespace of cache objects.
pub struct Volume {
    name: String,
    path: PathBuf,
    // Held open for the lifetime of the volume cookie.
    _handle: Mutex<Box<dyn CacheHandle>>,
    objects: RwLock<HashMap<String, Arc<CacheObject>>>,
}

impl Volume {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create (or return the existing) object for `key`. Idempotent.
    pub fn create_object(
        &self,
        control: &dyn CacheControl,
        key: &str,
        size: u64,
    ) -> Result<Arc<CacheObject>> {
        {
            let objects = self.objects.read().unwrap();
            if let Some(obj) = objects.get(key) {
                return Ok(Arc::clone(obj));
            }
        }

        let mut objects = self.objects.write().unwrap();
        if let Some(obj) = objects.get(key) {
            return Ok(Arc::clone(obj));
        }

        let mut handle = control.open_handle()?;
        handle
            .command(&format!("open {key}"))
            .map_err(|e| CacheError::ObjectCreateFailed(format!("{key}: {e}")))?;

        let object = Arc::new(CacheObject {
            key: key.to_string(),
            size,
            state: Mutex::new(ObjectState {
                handle,
                complete: false,
            }),
        });
        objects.insert(key.to_string(), Arc::clone(&object));
        debug!(volume = %self.name, key, size, "cache object created");
        Ok(object)
    }

    /// Existing object for `key`, if any.
    pub fn object(&self, key: &str) -> Option<Arc<CacheObject>> {
        self.objects.read().unwrap().get(key).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    fn close(&self) {
        // Objects first, then the volume cookie (dropped with self).
        self.objects.write().unwrap().clear();
    }
}

/// Backend bound to `<root>/fscache/`, owning the volumes.
pub struct CacheBackend {
    control: Arc<dyn CacheControl>,
    volume_dir: PathBuf,
    // Bind cookie for the backend itself.
    _handle: Mutex<Box<dyn CacheHandle>>,
    volumes: RwLock<HashMap<String, Arc<Volume>>>,
}

impl CacheBackend {
    /// Bind the cache at `<root>/fscache/`. Fails with
    /// `KernelCacheUnavailable` when the kernel side is missing; the caller
    /// then runs without an object cache.
    pub fn new<P: AsRef<Path>>(root: P, control: Arc<dyn CacheControl>) -> Result<Self> {
        if let Some(reason) = control.available() {
            return Err(CacheError::KernelCacheUnavailable(reason));
        }

        let cache_dir = root.as_ref().join("fscache");
        let volume_dir = cache_dir.join("volumes");
        fs::create_dir_all(&volume_dir)?;

        let mut handle = control.open_handle()?;
        handle.command(&format!("bind {}", cache_dir.display()))?;

        info!(dir = %cache_dir.display(), "cache backend bound");
        Ok(Self {
            control,
            volume_dir,
            _handle: Mutex::new(handle),
            volumes: RwLock::new(HashMap::new()),
        })
    }

    /// Create (or return the existing) volume for an image. Idempotent.
    pub fn create_volume(&self, name: &str) -> Result<Arc<Volume>> {
        {
            let volumes = self.volumes.read().unwrap();
            if let Some(vol) = volumes.get(name) {
                return Ok(Arc::clone(vol));
            }
        }

        let mut volumes = self.volumes.write().unwrap();
        if let Some(vol) = volumes.get(name) {
            return Ok(Arc::clone(vol));
        }

        let path = self.volume_dir.join(name);
        fs::create_dir_all(&path)?;

        let mut handle = self.control.open_handle()?;
        handle.command(&format!("volume {name}"))?;

        let volume = Arc::new(Volume {
            name: name.to_string(),
            path,
            _handle: Mutex::new(handle),
            objects: RwLock::new(HashMap::new()),
        });
        volumes.insert(name.to_string(), Arc::clone(&volume));
        info!(volume = name, "cache volume created");
        Ok(volume)
    }

    pub fn volume(&self, name: &str) -> Option<Arc<Volume>> {
        self.volumes.read().unwrap().get(name).cloned()
    }

    pub fn control(&self) -> &Arc<dyn CacheControl> {
        &self.control
    }

    /// Aggregate statistics across volumes and objects.
    pub fn stats(&self) -> BackendStats {
        let volumes = self.volumes.read().unwrap();
        let mut stats = BackendStats {
            volumes: volumes.len(),
            ..BackendStats::default()
        };
        for volume in volumes.values() {
            let objects = volume.objects.read().unwrap();
            stats.objects += objects.len();
            for object in objects.values() {
                stats.total_size += object.size;
                if object.is_complete() {
                    stats.complete_objects += 1;
                }
            }
        }
        stats
    }

    /// Release every descriptor in object → volume → backend order.
    pub fn close(&self) {
        let mut volumes = self.volumes.write().unwrap();
        for volume in volumes.values() {
            volume.close();
        }
        volumes.clear();
        info!("cache backend closed");
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackendStats {
    pub volumes: usize,
    pub objects: usize,
    pub complete_objects: usize,
    pub total_size: u64,
}

#[cfg(any(test, feature = "testing"))]
pub mod fake {
    //! In-memory control device recording every command and payload.

    use super::*;

    #[derive(Debug, Default)]
    struct FakeState {
        commands: Mutex<Vec<String>>,
        payloads: Mutex<HashMap<String, Vec<u8>>>,
        unavailable: Mutex<Option<String>>,
    }

    #[derive(Debug, Clone, Default)]
    pub struct FakeCacheControl {
        state: Arc<FakeState>,
    }

    impl FakeCacheControl {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_unavailable(&self, reason: &str) {
            *self.state.unavailable.lock().unwrap() = Some(reason.to_string());
        }

        pub fn commands(&self) -> Vec<String> {
            self.state.commands.lock().unwrap().clone()
        }

        /// Payload written through the handle opened with command `key`
        /// (e.g. `"open <digest>"`).
        pub fn payload(&self, key: &str) -> Option<Vec<u8>> {
            self.state.payloads.lock().unwrap().get(key).cloned()
        }
    }

    pub struct FakeHandle {
        state: Arc<FakeState>,
        scope: Option<String>,
    }

    impl CacheHandle for FakeHandle {
        fn command(&mut self, command: &str) -> Result<()> {
            self.state
                .commands
                .lock()
                .unwrap()
                .push(command.to_string());
            if self.scope.is_none() {
                self.scope = Some(command.to_string());
            }
            Ok(())
        }

        fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
            let scope = self.scope.clone().unwrap_or_default();
            let mut payloads = self.state.payloads.lock().unwrap();
            let buf = payloads.entry(scope).or_default();
            let end = offset as usize + data.len();
            if buf.len() < end {
                buf.resize(end, 0);
            }
            buf[offset as usize..end].copy_from_slice(data);
            Ok(data.len())
        }
    }

    impl CacheControl for FakeCacheControl {
        fn available(&self) -> Option<String> {
            self.state.unavailable.lock().unwrap().clone()
        }

        fn open_handle(&self) -> Result<Box<dyn CacheHandle>> {
            Ok(Box::new(FakeHandle {
                state: Arc::clone(&self.state),
                scope: None,
            }))
        }
    }
}
