//! # strata-mount
//!
//! Reference-counted read-only image mounts and union mount composition.
//!
//! The mount table maps `image_id → MountPoint` behind a single read-write
//! lock. `mount_image` is idempotent: a second caller for the same image
//! bumps the refcount and receives the existing mount path. The refcount
//! equals the number of live mount consumers not yet matched by a release.

pub mod sys;

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

pub use sys::{HostMountSys, MountSys};

const IMAGE_FSTYPE: &str = "erofs";
const UPPER_DIR_MODE: u32 = 0o755;
const WORK_DIR_MODE: u32 = 0o700;

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mount point not found for {0}")]
    NotFound(String),

    #[error("syscall failed: {0}")]
    Sys(String),
}

pub type Result<T> = std::result::Result<T, MountError>;

/// A mount to hand back to the runtime: type, source and option list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub fstype: String,
    pub source: String,
    pub options: Vec<String>,
}

/// A live read-only image mount.
#[derive(Debug, Clone)]
pub struct MountPoint {
    pub image_id: String,
    pub image_path: String,
    pub mount_path: PathBuf,
    pub loop_device: Option<String>,
    pub refcount: u32,
}

/// Reference-counted table of mounted read-only images.
pub struct MountManager {
    mounts_dir: PathBuf,
    sys: Arc<dyn MountSys>,
    active: RwLock<HashMap<String, MountPoint>>,
}

impl MountManager {
    pub fn new<P: AsRef<Path>>(root: P, sys: Arc<dyn MountSys>) -> Result<Self> {
        let mounts_dir = root.as_ref().join("mounts");
        fs::create_dir_all(&mounts_dir)?;
        Ok(Self {
            mounts_dir,
            sys,
            active: RwLock::new(HashMap::new()),
        })
    }

    /// Mount an image read-only via a loop device. Idempotent and
    /// reference-counted: an existing record is bumped and returned.
    pub fn mount_image(&self, image_id: &str, image_path: &Path) -> Result<PathBuf> {
        let mut active = self.active.write().unwrap();

        if let Some(mp) = active.get_mut(image_id) {
            mp.refcount += 1;
            debug!(image_id, refcount = mp.refcount, "reusing existing mount");
            return Ok(mp.mount_path.clone());
        }

        let mount_path = self.mounts_dir.join(image_id);
        fs::create_dir_all(&mount_path)?;

        let loop_device = self.sys.attach_loop(image_path)?;
        if let Err(e) = self
            .sys
            .mount(IMAGE_FSTYPE, &loop_device, "ro", &mount_path)
        {
            // Release the device on a failed mount.
            if let Err(detach_err) = self.sys.detach_loop(&loop_device) {
                warn!(loop_device = %loop_device, error = %detach_err, "loop detach after failed mount");
            }
            let _ = fs::remove_dir(&mount_path);
            return Err(e);
        }

        active.insert(
            image_id.to_string(),
            MountPoint {
                image_id: image_id.to_string(),
                image_path: image_path.display().to_string(),
                mount_path: mount_path.clone(),
                loop_device: Some(loop_device.clone()),
                refcount: 1,
            },
        );

        info!(image_id, mount = %mount_path.display(), loop_device = %loop_device, "image mounted");
        Ok(mount_path)
    }

    /// Mount an image through the kernel cache backend's naming instead of
    /// a loop device. Callers fall back to [`mount_image`] on failure.
    ///
    /// [`mount_image`]: MountManager::mount_image
    pub fn mount_image_via_cache(
        &self,
        image_id: &str,
        fsid: &str,
        domain: &str,
    ) -> Result<PathBuf> {
        let mut active = self.active.write().unwrap();

        if let Some(mp) = active.get_mut(image_id) {
            mp.refcount += 1;
            debug!(image_id, refcount = mp.refcount, "reusing existing cache mount");
            return Ok(mp.mount_path.clone());
        }

        let mount_path = self.mounts_dir.join(image_id);
        fs::create_dir_all(&mount_path)?;

        let options = format!("ro,fsid={fsid},domain={domain}");
        if let Err(e) = self.sys.mount(IMAGE_FSTYPE, "none", &options, &mount_path) {
            let _ = fs::remove_dir(&mount_path);
            return Err(e);
        }

        active.insert(
            image_id.to_string(),
            MountPoint {
                image_id: image_id.to_string(),
                image_path: format!("fscache://{domain}/{fsid}"),
                mount_path: mount_path.clone(),
                loop_device: None,
                refcount: 1,
            },
        );

        info!(image_id, mount = %mount_path.display(), fsid, domain, "image mounted via cache backend");
        Ok(mount_path)
    }

    /// Drop one reference; on zero, unmount, detach the loop device and
    /// remove the mount directory. Detach errors are logged, not returned.
    pub fn unmount(&self, image_id: &str) -> Result<()> {
        let mut active = self.active.write().unwrap();

        let remaining = {
            let mp = active
                .get_mut(image_id)
                .ok_or_else(|| MountError::NotFound(image_id.to_string()))?;
            mp.refcount -= 1;
            mp.refcount
        };
        if remaining > 0 {
            debug!(image_id, refcount = remaining, "mount still referenced");
            return Ok(());
        }

        let Some(mp) = active.remove(image_id) else {
            return Ok(());
        };
        self.sys.unmount(&mp.mount_path)?;
        if let Some(loop_device) = &mp.loop_device {
            if let Err(e) = self.sys.detach_loop(loop_device) {
                warn!(image_id, loop_device = %loop_device, error = %e, "loop detach failed");
            }
        }
        let _ = fs::remove_dir_all(&mp.mount_path);

        info!(image_id, "image unmounted");
        Ok(())
    }

    /// Tear down every active mount; used on shutdown.
    pub fn unmount_all(&self) -> Result<()> {
        let mut active = self.active.write().unwrap();
        let mut errors = Vec::new();

        for (image_id, mp) in active.drain() {
            if let Err(e) = self.sys.unmount(&mp.mount_path) {
                errors.push(format!("{image_id}: {e}"));
                continue;
            }
            if let Some(loop_device) = &mp.loop_device {
                if let Err(e) = self.sys.detach_loop(loop_device) {
                    warn!(image_id = %image_id, loop_device = %loop_device, error = %e, "loop detach failed");
                }
            }
            let _ = fs::remove_dir_all(&mp.mount_path);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MountError::Sys(format!(
                "unmount errors: {}",
                errors.join("; ")
            )))
        }
    }

    /// Mount path for an image, if currently mounted.
    pub fn mount_path(&self, image_id: &str) -> Option<PathBuf> {
        self.active
            .read()
            .unwrap()
            .get(image_id)
            .map(|mp| mp.mount_path.clone())
    }

    /// Current refcount for an image, if mounted.
    pub fn refcount(&self, image_id: &str) -> Option<u32> {
        self.active.read().unwrap().get(image_id).map(|mp| mp.refcount)
    }

    /// Snapshot of the active table, for the stats reporter.
    pub fn active_mounts(&self) -> Vec<MountPoint> {
        self.active.read().unwrap().values().cloned().collect()
    }
}

/// Compose a union overlay spec for a snapshot. Lower directories are
/// joined top-first with `:`; upper and work directories are pre-created
/// (0755/0700). With no lowers the spec carries only upper and work.
pub fn compose_union_mount(
    _snapshot_id: &str,
    lower_dirs: &[PathBuf],
    upper_dir: &Path,
    work_dir: &Path,
) -> Result<MountSpec> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(UPPER_DIR_MODE)
        .create(upper_dir)
        .or_else(ignore_exists)?;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(WORK_DIR_MODE)
        .create(work_dir)
        .or_else(ignore_exists)?;

    let mut options = vec![
        format!("upperdir={}", upper_dir.display()),
        format!("workdir={}", work_dir.display()),
    ];

    if !lower_dirs.is_empty() {
        let joined = lower_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        options.push(format!("lowerdir={joined}"));
    }

    Ok(MountSpec {
        fstype: "overlay".to_string(),
        source: "overlay".to_string(),
        options,
    })
}

fn ignore_exists(e: std::io::Error) -> std::io::Result<()> {
    if e.kind() == std::io::ErrorKind::AlreadyExists {
        Ok(())
    } else {
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use super::sys::fake::{FakeMountSys, SysCall};
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> (MountManager, Arc<FakeMountSys>) {
        let sys = Arc::new(FakeMountSys::new());
        let manager = MountManager::new(dir.path(), sys.clone() as Arc<dyn MountSys>).unwrap();
        (manager, sys)
    }

    #[test]
    fn test_mount_image_refcounted_idempotent() {
        let dir = TempDir::new().unwrap();
        let (manager, sys) = manager(&dir);
        let image = dir.path().join("layer.img");

        let first = manager.mount_image("img-1", &image).unwrap();
        let second = manager.mount_image("img-1", &image).unwrap();
        assert_eq!(first, second);
        assert_eq!(manager.refcount("img-1"), Some(2));

        // One attach, one mount.
        let calls = sys.calls();
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, SysCall::AttachLoop(_)))
                .count(),
            1
        );
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, SysCall::Mount { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_unmount_on_last_reference() {
        let dir = TempDir::new().unwrap();
        let (manager, sys) = manager(&dir);
        let image = dir.path().join("layer.img");

        manager.mount_image("img-1", &image).unwrap();
        manager.mount_image("img-1", &image).unwrap();

        manager.unmount("img-1").unwrap();
        assert_eq!(manager.refcount("img-1"), Some(1));
        assert!(sys
            .calls()
            .iter()
            .all(|c| !matches!(c, SysCall::Unmount(_))));

        manager.unmount("img-1").unwrap();
        assert_eq!(manager.refcount("img-1"), None);
        let calls = sys.calls();
        assert!(calls.iter().any(|c| matches!(c, SysCall::Unmount(_))));
        assert!(calls.iter().any(|c| matches!(c, SysCall::DetachLoop(_))));
    }

    #[test]
    fn test_unmount_unknown_image() {
        let dir = TempDir::new().unwrap();
        let (manager, _sys) = manager(&dir);
        assert!(matches!(
            manager.unmount("ghost"),
            Err(MountError::NotFound(_))
        ));
    }

    #[test]
    fn test_failed_mount_releases_loop_device() {
        let dir = TempDir::new().unwrap();
        let (manager, sys) = manager(&dir);
        sys.fail_mount
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let err = manager
            .mount_image("img-1", &dir.path().join("layer.img"))
            .unwrap_err();
        assert!(matches!(err, MountError::Sys(_)));
        assert!(sys
            .calls()
            .iter()
            .any(|c| matches!(c, SysCall::DetachLoop(_))));
        assert_eq!(manager.refcount("img-1"), None);
    }

    #[test]
    fn test_cache_mount_options() {
        let dir = TempDir::new().unwrap();
        let (manager, sys) = manager(&dir);

        manager
            .mount_image_via_cache("img-1", "img-1", "strata")
            .unwrap();

        let calls = sys.calls();
        match &calls[0] {
            SysCall::Mount {
                fstype,
                source,
                options,
                ..
            } => {
                assert_eq!(fstype, "erofs");
                assert_eq!(source, "none");
                assert_eq!(options, "ro,fsid=img-1,domain=strata");
            }
            other => panic!("unexpected call: {other:?}"),
        }
        // No loop device involved.
        assert!(calls
            .iter()
            .all(|c| !matches!(c, SysCall::AttachLoop(_))));
    }

    #[test]
    fn test_compose_union_mount_orders_lowers_top_first() {
        let dir = TempDir::new().unwrap();
        let upper = dir.path().join("fs");
        let work = dir.path().join("work");
        let lowers = vec![PathBuf::from("/mounts/top"), PathBuf::from("/mounts/base")];

        let spec = compose_union_mount("snap-1", &lowers, &upper, &work).unwrap();
        assert_eq!(spec.fstype, "overlay");
        assert_eq!(spec.source, "overlay");
        assert!(spec
            .options
            .contains(&"lowerdir=/mounts/top:/mounts/base".to_string()));

        use std::os::unix::fs::MetadataExt;
        assert_eq!(fs::metadata(&upper).unwrap().mode() & 0o777, 0o755);
        assert_eq!(fs::metadata(&work).unwrap().mode() & 0o777, 0o700);
    }

    #[test]
    fn test_compose_union_mount_without_lowers() {
        let dir = TempDir::new().unwrap();
        let spec = compose_union_mount(
            "snap-1",
            &[],
            &dir.path().join("fs"),
            &dir.path().join("work"),
        )
        .unwrap();
        assert_eq!(spec.options.len(), 2);
        assert!(spec.options.iter().all(|o| !o.starts_with("lowerdir=")));
    }

    #[test]
    fn test_unmount_all_drains_table() {
        let dir = TempDir::new().unwrap();
        let (manager, _sys) = manager(&dir);
        manager
            .mount_image("img-1", &dir.path().join("a.img"))
            .unwrap();
        manager
            .mount_image("img-2", &dir.path().join("b.img"))
            .unwrap();

        manager.unmount_all().unwrap();
        assert!(manager.active_mounts().is_empty());
    }
}
