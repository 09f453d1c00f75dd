//! # strata-memdedup
//!
//! Page deduplication for read-only mounts.
//!
//! Regular files are mapped read-only and the mapping is advised as
//! mergeable, so the kernel's same-page merging scan considers it. Page
//! identity is accounted in user space for statistics only; the kernel
//! does the actual merging. Every failure here is soft: the component
//! goes inactive and the rest of the system keeps working.

use memmap2::Mmap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const KSM_SYSFS_DEFAULT: &str = "/sys/kernel/mm/ksm";

#[derive(Debug, thiserror::Error)]
pub enum MemDedupError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("KSM not available: {0}")]
    KsmUnavailable(String),

    #[error("madvise failed: {0}")]
    Madvise(String),
}

pub type Result<T> = std::result::Result<T, MemDedupError>;

/// Accounting entry for one distinct page. Keys are owned hash strings;
/// nothing here points into a mapping.
#[derive(Debug, Clone)]
struct PageInfo {
    size: usize,
    ref_count: u64,
}

/// KSM counters read back from sysfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct KsmStats {
    pub pages_sharing: i64,
    pub pages_shared: i64,
    pub pages_unshared: i64,
    pub saved_bytes: i64,
}

/// Aggregated deduplication statistics.
#[derive(Debug, Clone, Default)]
pub struct DedupStats {
    pub unique_pages: u64,
    pub merged_pages: u64,
    pub saved_bytes: u64,
    pub ksm: Option<KsmStats>,
}

/// Controller over the kernel same-page merging daemon.
pub struct KsmController {
    sysfs: PathBuf,
    enabled: Mutex<bool>,
}

impl KsmController {
    /// Controller over the default sysfs tree.
    pub fn new() -> Result<Self> {
        Self::with_sysfs(PathBuf::from(KSM_SYSFS_DEFAULT))
    }

    /// Controller over an explicit sysfs root; tests point this at a
    /// temp directory.
    pub fn with_sysfs(sysfs: PathBuf) -> Result<Self> {
        if !sysfs.exists() {
            return Err(MemDedupError::KsmUnavailable(format!(
                "{} missing",
                sysfs.display()
            )));
        }
        Ok(Self {
            sysfs,
            enabled: Mutex::new(false),
        })
    }

    fn write_knob(&self, knob: &str, value: &str) -> Result<()> {
        std::fs::write(self.sysfs.join(knob), value)?;
        Ok(())
    }

    fn read_counter(&self, counter: &str) -> Result<i64> {
        let data = std::fs::read_to_string(self.sysfs.join(counter))?;
        data.trim()
            .parse()
            .map_err(|e| MemDedupError::KsmUnavailable(format!("{counter}: {e}")))
    }

    /// Start the merging daemon.
    pub fn enable(&self) -> Result<()> {
        self.write_knob("run", "1")?;
        *self.enabled.lock().unwrap() = true;
        info!("KSM enabled");
        Ok(())
    }

    /// Stop the merging daemon.
    pub fn disable(&self) -> Result<()> {
        self.write_knob("run", "0")?;
        *self.enabled.lock().unwrap() = false;
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock().unwrap()
    }

    /// Tune scan interval, pages per scan and cross-node merging. A knob
    /// that fails to write is logged and skipped.
    pub fn tune(&self, scan_interval_ms: u64, pages_to_scan: u64, merge_across_nodes: bool) {
        if scan_interval_ms > 0 {
            if let Err(e) = self.write_knob("sleep_millisecs", &scan_interval_ms.to_string()) {
                warn!(error = %e, "failed to set KSM scan interval");
            }
        }
        if pages_to_scan > 0 {
            if let Err(e) = self.write_knob("pages_to_scan", &pages_to_scan.to_string()) {
                warn!(error = %e, "failed to set KSM pages_to_scan");
            }
        }
        let flag = if merge_across_nodes { "1" } else { "0" };
        if let Err(e) = self.write_knob("merge_across_nodes", flag) {
            warn!(error = %e, "failed to set KSM merge_across_nodes");
        }
    }

    /// Read back the kernel counters.
    pub fn stats(&self) -> Result<KsmStats> {
        let pages_sharing = self.read_counter("pages_sharing")?;
        let pages_shared = self.read_counter("pages_shared")?;
        let pages_unshared = self.read_counter("pages_unshared")?;
        let page_size = page_size() as i64;
        Ok(KsmStats {
            pages_sharing,
            pages_shared,
            pages_unshared,
            saved_bytes: pages_sharing * page_size,
        })
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no side effects.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 {
        n as usize
    } else {
        4096
    }
}

/// Marks file-backed mappings as mergeable and accounts page identity.
pub struct MemoryDeduplicator {
    page_size: usize,
    pages: RwLock<HashMap<String, PageInfo>>,
    merged_pages: Mutex<u64>,
    saved_bytes: Mutex<u64>,
    ksm: Option<KsmController>,
}

impl MemoryDeduplicator {
    pub fn new() -> Self {
        let ksm = match KsmController::new() {
            Ok(ksm) => Some(ksm),
            Err(e) => {
                warn!(error = %e, "KSM unavailable, madvise-only mode");
                None
            }
        };
        Self::with_ksm(ksm)
    }

    pub fn with_ksm(ksm: Option<KsmController>) -> Self {
        Self {
            page_size: page_size(),
            pages: RwLock::new(HashMap::new()),
            merged_pages: Mutex::new(0),
            saved_bytes: Mutex::new(0),
            ksm,
        }
    }

    pub fn ksm(&self) -> Option<&KsmController> {
        self.ksm.as_ref()
    }

    /// Map a regular file read-only, advise it mergeable and account its
    /// pages. Empty files are skipped.
    pub fn deduplicate_file(&self, path: &Path) -> Result<()> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(());
        }

        // SAFETY: the mapping is private and read-only; the file came from
        // a read-only mount.
        let map = unsafe { Mmap::map(&file) }?;
        self.account_pages(&map);
        mark_mergeable(&map)?;
        debug!(path = %path.display(), bytes = len, "mapping advised mergeable");
        Ok(())
    }

    /// Hash every page into the accounting map. Only the hex digest and
    /// length are retained; the map safely outlives the mapping.
    fn account_pages(&self, data: &[u8]) {
        for page in data.chunks(self.page_size) {
            let digest = hex::encode(Sha256::digest(page));
            let mut pages = self.pages.write().unwrap();
            if let Some(existing) = pages.get_mut(&digest) {
                existing.ref_count += 1;
                *self.merged_pages.lock().unwrap() += 1;
                *self.saved_bytes.lock().unwrap() += page.len() as u64;
            } else {
                pages.insert(
                    digest,
                    PageInfo {
                        size: page.len(),
                        ref_count: 1,
                    },
                );
            }
        }
    }

    /// Sum of distinct page bytes currently accounted.
    pub fn unique_bytes(&self) -> u64 {
        self.pages
            .read()
            .unwrap()
            .values()
            .map(|p| p.size as u64)
            .sum()
    }

    pub fn stats(&self) -> DedupStats {
        let mut stats = DedupStats {
            unique_pages: self.pages.read().unwrap().len() as u64,
            merged_pages: *self.merged_pages.lock().unwrap(),
            saved_bytes: *self.saved_bytes.lock().unwrap(),
            ksm: None,
        };
        if let Some(ksm) = &self.ksm {
            if ksm.is_enabled() {
                match ksm.stats() {
                    Ok(ksm_stats) => {
                        stats.saved_bytes += ksm_stats.saved_bytes.max(0) as u64;
                        stats.ksm = Some(ksm_stats);
                    }
                    Err(e) => warn!(error = %e, "KSM stats unavailable"),
                }
            }
        }
        stats
    }

    /// Disable the merging daemon on shutdown.
    pub fn close(&self) {
        if let Some(ksm) = &self.ksm {
            if let Err(e) = ksm.disable() {
                warn!(error = %e, "failed to disable KSM");
            }
        }
    }
}

impl Default for MemoryDeduplicator {
    fn default() -> Self {
        Self::new()
    }
}

fn mark_mergeable(map: &Mmap) -> Result<()> {
    // SAFETY: the range is exactly the live mapping.
    let rc = unsafe {
        libc::madvise(
            map.as_ptr() as *mut libc::c_void,
            map.len(),
            libc::MADV_MERGEABLE,
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // Kernels without CONFIG_KSM reject the advice; stay soft.
        return Err(MemDedupError::Madvise(err.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_sysfs(dir: &TempDir) -> PathBuf {
        let sysfs = dir.path().join("ksm");
        std::fs::create_dir_all(&sysfs).unwrap();
        for (file, value) in [
            ("run", "0"),
            ("sleep_millisecs", "20"),
            ("pages_to_scan", "100"),
            ("merge_across_nodes", "1"),
            ("pages_sharing", "300"),
            ("pages_shared", "120"),
            ("pages_unshared", "50"),
        ] {
            std::fs::write(sysfs.join(file), value).unwrap();
        }
        sysfs
    }

    #[test]
    fn test_ksm_unavailable_without_sysfs() {
        assert!(matches!(
            KsmController::with_sysfs(PathBuf::from("/nonexistent/ksm")),
            Err(MemDedupError::KsmUnavailable(_))
        ));
    }

    #[test]
    fn test_ksm_enable_disable_and_tune() {
        let dir = TempDir::new().unwrap();
        let sysfs = fake_sysfs(&dir);
        let ksm = KsmController::with_sysfs(sysfs.clone()).unwrap();

        ksm.enable().unwrap();
        assert!(ksm.is_enabled());
        assert_eq!(std::fs::read_to_string(sysfs.join("run")).unwrap(), "1");

        ksm.tune(250, 512, false);
        assert_eq!(
            std::fs::read_to_string(sysfs.join("sleep_millisecs")).unwrap(),
            "250"
        );
        assert_eq!(
            std::fs::read_to_string(sysfs.join("pages_to_scan")).unwrap(),
            "512"
        );
        assert_eq!(
            std::fs::read_to_string(sysfs.join("merge_across_nodes")).unwrap(),
            "0"
        );

        ksm.disable().unwrap();
        assert_eq!(std::fs::read_to_string(sysfs.join("run")).unwrap(), "0");
    }

    #[test]
    fn test_ksm_stats_readback() {
        let dir = TempDir::new().unwrap();
        let ksm = KsmController::with_sysfs(fake_sysfs(&dir)).unwrap();

        let stats = ksm.stats().unwrap();
        assert_eq!(stats.pages_sharing, 300);
        assert_eq!(stats.pages_shared, 120);
        assert_eq!(stats.pages_unshared, 50);
        assert_eq!(stats.saved_bytes, 300 * page_size() as i64);
    }

    #[test]
    fn test_identical_pages_accounted_once() {
        let dedup = MemoryDeduplicator::with_ksm(None);
        let page = vec![0xAAu8; page_size()];

        // Two identical pages and one distinct.
        let mut data = page.clone();
        data.extend(&page);
        data.extend(vec![0xBBu8; page_size()]);

        dedup.account_pages(&data);
        let stats = dedup.stats();
        assert_eq!(stats.unique_pages, 2);
        assert_eq!(stats.merged_pages, 1);
        assert_eq!(stats.saved_bytes, page_size() as u64);
        assert_eq!(dedup.unique_bytes(), 2 * page_size() as u64);
    }

    #[test]
    fn test_deduplicate_file_maps_and_accounts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, vec![0x5Au8; 2 * page_size()]).unwrap();

        let dedup = MemoryDeduplicator::with_ksm(None);
        // madvise(MADV_MERGEABLE) may be unsupported; accounting still ran
        // if it was.
        match dedup.deduplicate_file(&path) {
            Ok(()) => {
                let stats = dedup.stats();
                assert_eq!(stats.unique_pages, 1);
                assert_eq!(stats.merged_pages, 1);
            }
            Err(MemDedupError::Madvise(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_file_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        let dedup = MemoryDeduplicator::with_ksm(None);
        dedup.deduplicate_file(&path).unwrap();
        assert_eq!(dedup.stats().unique_pages, 0);
    }
}
