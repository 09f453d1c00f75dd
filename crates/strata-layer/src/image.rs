//! Read-only image assembly.
//!
//! The packer is an external binary treated as a pure function from
//! (tree, flags) to image bytes on disk. Its combined output is captured
//! into the error on failure.

use crate::{LayerError, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

const IMAGE_FILE_MODE: u32 = 0o644;

/// Packer parameterisation.
#[derive(Debug, Clone)]
pub struct PackerOptions {
    /// Compression algorithm passed as `-z<name>`.
    pub compression: String,
    /// Normalise all timestamps to zero (`-T 0`).
    pub normalize_timestamps: bool,
    /// Force root ownership on all entries (`--all-root`).
    pub root_owned: bool,
}

impl Default for PackerOptions {
    fn default() -> Self {
        Self {
            compression: "lz4hc".to_string(),
            normalize_timestamps: true,
            root_owned: true,
        }
    }
}

/// Invokes the external read-only image packer.
#[derive(Debug, Clone)]
pub struct ImagePacker {
    binary: String,
    options: PackerOptions,
}

impl ImagePacker {
    pub fn new(options: PackerOptions) -> Self {
        Self {
            binary: "mkfs.erofs".to_string(),
            options,
        }
    }

    /// Use a different packer executable. Tests substitute a stub here.
    pub fn with_binary<S: Into<String>>(mut self, binary: S) -> Self {
        self.binary = binary.into();
        self
    }

    /// Pack `tree` into a read-only image at `output`.
    pub fn pack(&self, tree: &Path, output: &Path) -> Result<()> {
        if let Some(dir) = output.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let mut cmd = Command::new(&self.binary);
        cmd.arg(format!("-z{}", self.options.compression));
        if self.options.normalize_timestamps {
            cmd.args(["-T", "0"]);
        }
        if self.options.root_owned {
            cmd.arg("--all-root");
        }
        cmd.arg(output);
        cmd.arg(tree);

        debug!(binary = %self.binary, tree = %tree.display(), output = %output.display(), "invoking image packer");

        let result = cmd
            .output()
            .map_err(|e| LayerError::ImagePacker(format!("{} failed to start: {e}", self.binary)))?;

        if !result.status.success() {
            let stdout = String::from_utf8_lossy(&result.stdout);
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(LayerError::ImagePacker(format!(
                "{} exited with {}: {stdout}{stderr}",
                self.binary, result.status
            )));
        }

        let mut perms = std::fs::metadata(output)?.permissions();
        perms.set_mode(IMAGE_FILE_MODE);
        std::fs::set_permissions(output, perms)?;

        info!(output = %output.display(), "built read-only image");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// A stand-in packer that records its arguments and touches the output.
    fn stub_packer(dir: &Path) -> String {
        let script = dir.join("fake-mkfs");
        let mut file = std::fs::File::create(&script).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "echo \"$@\" > {}/argv", dir.display()).unwrap();
        // Output path is the second-to-last argument.
        writeln!(file, "out=''; prev=''").unwrap();
        writeln!(file, "for a in \"$@\"; do out=\"$prev\"; prev=\"$a\"; done").unwrap();
        writeln!(file, "touch \"$out\"").unwrap();
        drop(file);
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();
        script.display().to_string()
    }

    #[test]
    fn test_pack_invokes_binary_with_flags() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(&tree).unwrap();
        let output = dir.path().join("images/layer.img");

        let packer =
            ImagePacker::new(PackerOptions::default()).with_binary(stub_packer(dir.path()));
        packer.pack(&tree, &output).unwrap();

        assert!(output.exists());
        let argv = std::fs::read_to_string(dir.path().join("argv")).unwrap();
        assert!(argv.contains("-zlz4hc"));
        assert!(argv.contains("-T 0"));
        assert!(argv.contains("--all-root"));

        use std::os::unix::fs::MetadataExt;
        assert_eq!(std::fs::metadata(&output).unwrap().mode() & 0o777, 0o644);
    }

    #[test]
    fn test_pack_failure_carries_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("failing-mkfs");
        std::fs::write(&script, "#!/bin/sh\necho boom >&2\nexit 1\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let packer = ImagePacker::new(PackerOptions::default())
            .with_binary(script.display().to_string());
        let err = packer
            .pack(dir.path(), &dir.path().join("out.img"))
            .unwrap_err();
        match err {
            LayerError::ImagePacker(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_binary_is_packer_error() {
        let dir = tempfile::tempdir().unwrap();
        let packer = ImagePacker::new(PackerOptions::default())
            .with_binary("/nonexistent/mkfs.erofs");
        assert!(matches!(
            packer.pack(dir.path(), &dir.path().join("out.img")),
            Err(LayerError::ImagePacker(_))
        ));
    }
}
