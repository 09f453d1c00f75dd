//! Narrow wrapper around the mount, umount and loop-device interactions.
//!
//! Everything that touches the kernel goes through [`MountSys`] so the rest
//! of the crate can be exercised against a recording fake.

use crate::{MountError, Result};
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Syscall boundary for image mounts.
pub trait MountSys: Send + Sync {
    /// Attach an image file to a free loop device, returning its path.
    fn attach_loop(&self, image_path: &Path) -> Result<String>;

    /// Detach a loop device.
    fn detach_loop(&self, loop_device: &str) -> Result<()>;

    /// Mount `source` read-only at `target` with the given fstype/options.
    fn mount(&self, fstype: &str, source: &str, options: &str, target: &Path) -> Result<()>;

    /// Unmount `target`.
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// Production implementation shelling out to the host tools.
#[derive(Debug, Default)]
pub struct HostMountSys;

fn run(cmd: &mut Command, what: &str) -> Result<String> {
    let output = cmd
        .output()
        .map_err(|e| MountError::Sys(format!("{what}: failed to start: {e}")))?;
    if !output.status.success() {
        return Err(MountError::Sys(format!(
            "{what}: {} {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

impl MountSys for HostMountSys {
    fn attach_loop(&self, image_path: &Path) -> Result<String> {
        let device = run(
            Command::new("losetup").args(["-f", "--show"]).arg(image_path),
            "losetup",
        )?;
        debug!(image = %image_path.display(), device = %device, "loop device attached");
        Ok(device)
    }

    fn detach_loop(&self, loop_device: &str) -> Result<()> {
        run(Command::new("losetup").args(["-d", loop_device]), "losetup -d")?;
        Ok(())
    }

    fn mount(&self, fstype: &str, source: &str, options: &str, target: &Path) -> Result<()> {
        run(
            Command::new("mount")
                .args(["-t", fstype, "-o", options, source])
                .arg(target),
            "mount",
        )?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        run(Command::new("umount").arg(target), "umount")?;
        Ok(())
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod fake {
    //! Recording fake used by unit tests.

    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    /// One recorded syscall.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SysCall {
        AttachLoop(PathBuf),
        DetachLoop(String),
        Mount {
            fstype: String,
            source: String,
            options: String,
            target: PathBuf,
        },
        Unmount(PathBuf),
    }

    #[derive(Debug, Default)]
    pub struct FakeMountSys {
        pub calls: Mutex<Vec<SysCall>>,
        next_loop: AtomicU32,
        pub fail_mount: AtomicBool,
    }

    impl FakeMountSys {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn calls(&self) -> Vec<SysCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl MountSys for FakeMountSys {
        fn attach_loop(&self, image_path: &Path) -> Result<String> {
            let n = self.next_loop.fetch_add(1, Ordering::SeqCst);
            self.calls
                .lock()
                .unwrap()
                .push(SysCall::AttachLoop(image_path.to_path_buf()));
            Ok(format!("/dev/loop{n}"))
        }

        fn detach_loop(&self, loop_device: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(SysCall::DetachLoop(loop_device.to_string()));
            Ok(())
        }

        fn mount(&self, fstype: &str, source: &str, options: &str, target: &Path) -> Result<()> {
            if self.fail_mount.load(Ordering::SeqCst) {
                return Err(MountError::Sys("mount: injected failure".to_string()));
            }
            self.calls.lock().unwrap().push(SysCall::Mount {
                fstype: fstype.to_string(),
                source: source.to_string(),
                options: options.to_string(),
                target: target.to_path_buf(),
            });
            Ok(())
        }

        fn unmount(&self, target: &Path) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(SysCall::Unmount(target.to_path_buf()));
            Ok(())
        }
    }
}
