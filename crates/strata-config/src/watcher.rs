//! Config file watcher with debounced reloads.
//!
//! Editor save patterns (write + rename storms) are coalesced by a 100 ms
//! debounce window before the file is re-read. Reload callbacks run
//! sequentially under the watcher lock, each receiving `(old, new)`.

use crate::{Config, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const DEBOUNCE: Duration = Duration::from_millis(100);

/// Callback invoked after a successful reload with `(old, new)`.
pub type ReloadCallback = Box<dyn Fn(&Config, &Config) + Send + Sync>;

pub struct ConfigWatcher {
    path: PathBuf,
    config: Arc<RwLock<Config>>,
    callbacks: Arc<Mutex<Vec<ReloadCallback>>>,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
    // Kept alive for the lifetime of the watch.
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Watch `path`, starting from `initial` as the current document.
    pub fn new(path: PathBuf, initial: Config) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<notify::Result<notify::Event>>();

        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .map_err(std::io::Error::other)?;
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(std::io::Error::other)?;

        let config = Arc::new(RwLock::new(initial));
        let callbacks: Arc<Mutex<Vec<ReloadCallback>>> = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let path = path.clone();
            let config = Arc::clone(&config);
            let callbacks = Arc::clone(&callbacks);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("config-watcher".to_string())
                .spawn(move || watch_loop(path, rx, config, callbacks, stop))?
        };

        Ok(Self {
            path,
            config,
            callbacks,
            stop,
            thread: Some(thread),
            _watcher: watcher,
        })
    }

    /// Register a reload callback.
    pub fn add_callback(&self, callback: ReloadCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    /// Current document.
    pub fn config(&self) -> Config {
        self.config.read().unwrap().clone()
    }

    /// Persist a new document and run callbacks, without waiting for the
    /// filesystem event to come back around.
    pub fn update(&self, new_config: Config) -> Result<()> {
        new_config.save(&self.path)?;
        let old = {
            let mut guard = self.config.write().unwrap();
            std::mem::replace(&mut *guard, new_config.clone())
        };
        for callback in self.callbacks.lock().unwrap().iter() {
            callback(&old, &new_config);
        }
        Ok(())
    }

    /// Stop the watcher thread and wait for it to exit.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn watch_loop(
    path: PathBuf,
    rx: mpsc::Receiver<notify::Result<notify::Event>>,
    config: Arc<RwLock<Config>>,
    callbacks: Arc<Mutex<Vec<ReloadCallback>>>,
    stop: Arc<AtomicBool>,
) {
    let mut dirty = false;

    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }

        // When dirty, wait out the debounce window; otherwise block for the
        // next event (with a timeout so the stop flag is observed).
        let timeout = if dirty { DEBOUNCE } else { Duration::from_millis(200) };
        match rx.recv_timeout(timeout) {
            Ok(Ok(event)) => {
                if matches!(
                    event.kind,
                    notify::EventKind::Modify(_) | notify::EventKind::Create(_)
                ) {
                    debug!(path = %path.display(), "config change observed");
                    dirty = true;
                }
            }
            Ok(Err(e)) => {
                error!(error = %e, "config watcher error");
            }
            Err(RecvTimeoutError::Timeout) => {
                if dirty {
                    dirty = false;
                    reload(&path, &config, &callbacks);
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn reload(
    path: &PathBuf,
    config: &Arc<RwLock<Config>>,
    callbacks: &Arc<Mutex<Vec<ReloadCallback>>>,
) {
    info!(path = %path.display(), "config file changed, reloading");

    let new_config = match Config::load(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "config reload failed, keeping previous document");
            return;
        }
    };

    let old = {
        let mut guard = config.write().unwrap();
        std::mem::replace(&mut *guard, new_config.clone())
    };

    // Callbacks run sequentially under the watcher lock.
    for callback in callbacks.lock().unwrap().iter() {
        callback(&old, &new_config);
    }

    info!("config reloaded");
}
