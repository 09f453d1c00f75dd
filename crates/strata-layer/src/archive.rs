//! Layer archive handling: compression sniffing and tar application with
//! whiteout semantics.
//!
//! Compression is detected from a magic-byte prefix rather than the file
//! name; registries are inconsistent about media types. Whiteout entries
//! (`.wh.<name>`) delete the named sibling, the opaque marker
//! (`.wh..wh..opq`) clears the containing directory.

use crate::{LayerError, Result};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const XZ_MAGIC: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];
const BZIP2_MAGIC: [u8; 3] = [b'B', b'Z', b'h'];

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Compression format of a layer archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd,
    Xz,
    Bzip2,
    None,
}

/// Sniff the compression format from the first bytes of the archive.
pub fn sniff_compression(prefix: &[u8]) -> Compression {
    if prefix.starts_with(&GZIP_MAGIC) {
        Compression::Gzip
    } else if prefix.starts_with(&ZSTD_MAGIC) {
        Compression::Zstd
    } else if prefix.starts_with(&XZ_MAGIC) {
        Compression::Xz
    } else if prefix.starts_with(&BZIP2_MAGIC) {
        Compression::Bzip2
    } else {
        Compression::None
    }
}

/// Open a stored layer archive as a decompressed tar stream.
pub fn open_decompressed(path: &Path) -> Result<Box<dyn Read>> {
    let mut file = File::open(path)?;
    let mut prefix = [0u8; 6];
    let n = file.read(&mut prefix)?;
    file.seek(SeekFrom::Start(0))?;

    let format = sniff_compression(&prefix[..n]);
    debug!(path = %path.display(), ?format, "sniffed layer compression");

    let reader = BufReader::new(file);
    let decoded: Box<dyn Read> = match format {
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
        Compression::Zstd => Box::new(
            zstd::stream::read::Decoder::new(reader)
                .map_err(|e| LayerError::InvalidArchive(format!("zstd: {e}")))?,
        ),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(reader)),
        Compression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(reader)),
        Compression::None => Box::new(reader),
    };
    Ok(decoded)
}

/// Apply a tar stream into `target` with layer semantics: replacements
/// overwrite, whiteouts remove, opaque markers clear directories. Symlinks,
/// permissions and xattrs are preserved by the tar application.
pub fn apply_layer<R: Read>(tar_stream: R, target: &Path) -> Result<u64> {
    let mut archive = tar::Archive::new(tar_stream);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(true);
    archive.set_overwrite(true);

    let mut applied = 0u64;
    for entry in archive
        .entries()
        .map_err(|e| LayerError::InvalidArchive(format!("tar: {e}")))?
    {
        let mut entry = entry.map_err(|e| LayerError::InvalidArchive(format!("tar: {e}")))?;
        let rel = entry
            .path()
            .map_err(|e| LayerError::InvalidArchive(format!("tar path: {e}")))?
            .into_owned();

        let file_name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if file_name == OPAQUE_WHITEOUT {
            let dir = match rel.parent() {
                Some(parent) => target.join(parent),
                None => target.to_path_buf(),
            };
            clear_directory(&dir)?;
            continue;
        }

        if let Some(victim) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let path = match rel.parent() {
                Some(parent) => target.join(parent).join(victim),
                None => target.join(victim),
            };
            if path.symlink_metadata().is_ok() {
                if path.is_dir() {
                    std::fs::remove_dir_all(&path)?;
                } else {
                    std::fs::remove_file(&path)?;
                }
            }
            continue;
        }

        if !entry
            .unpack_in(target)
            .map_err(|e| LayerError::InvalidArchive(format!("unpack {}: {e}", rel.display())))?
        {
            warn!(path = %rel.display(), "tar entry escaped the target, skipped");
            continue;
        }
        applied += 1;
    }

    Ok(applied)
}

fn clear_directory(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tar_with<F: FnOnce(&mut tar::Builder<Vec<u8>>)>(build: F) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        build(&mut builder);
        builder.into_inner().unwrap()
    }

    fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();
    }

    #[test]
    fn test_sniff_magic_bytes() {
        assert_eq!(sniff_compression(&[0x1f, 0x8b, 0x08]), Compression::Gzip);
        assert_eq!(
            sniff_compression(&[0x28, 0xb5, 0x2f, 0xfd, 0x00]),
            Compression::Zstd
        );
        assert_eq!(
            sniff_compression(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]),
            Compression::Xz
        );
        assert_eq!(sniff_compression(b"BZh91AY"), Compression::Bzip2);
        assert_eq!(sniff_compression(b"ustar"), Compression::None);
        assert_eq!(sniff_compression(&[]), Compression::None);
    }

    #[test]
    fn test_open_decompressed_gzip_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let tar_bytes = tar_with(|b| append_file(b, "hello.txt", b"hi"));

        let gz_path = dir.path().join("layer.tar.gz");
        let mut encoder = flate2::write::GzEncoder::new(
            File::create(&gz_path).unwrap(),
            flate2::Compression::default(),
        );
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap();

        let mut decoded = Vec::new();
        open_decompressed(&gz_path)
            .unwrap()
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, tar_bytes);
    }

    #[test]
    fn test_apply_plain_layer() {
        let dir = tempfile::tempdir().unwrap();
        let tar_bytes = tar_with(|b| {
            append_file(b, "etc/motd", b"welcome");
            append_file(b, "bin/tool", b"#!/bin/sh");
        });

        let applied = apply_layer(&tar_bytes[..], dir.path()).unwrap();
        assert_eq!(applied, 2);
        assert_eq!(
            std::fs::read(dir.path().join("etc/motd")).unwrap(),
            b"welcome"
        );
    }

    #[test]
    fn test_whiteout_removes_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(dir.path().join("etc/old.conf"), b"stale").unwrap();

        let tar_bytes = tar_with(|b| append_file(b, "etc/.wh.old.conf", b""));
        apply_layer(&tar_bytes[..], dir.path()).unwrap();

        assert!(!dir.path().join("etc/old.conf").exists());
    }

    #[test]
    fn test_opaque_whiteout_clears_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("opt/app")).unwrap();
        std::fs::write(dir.path().join("opt/app/a"), b"a").unwrap();
        std::fs::write(dir.path().join("opt/app/b"), b"b").unwrap();

        let tar_bytes = tar_with(|b| {
            append_file(b, "opt/app/.wh..wh..opq", b"");
            append_file(b, "opt/app/fresh", b"new");
        });
        apply_layer(&tar_bytes[..], dir.path()).unwrap();

        assert!(!dir.path().join("opt/app/a").exists());
        assert!(!dir.path().join("opt/app/b").exists());
        assert_eq!(
            std::fs::read(dir.path().join("opt/app/fresh")).unwrap(),
            b"new"
        );
    }

    #[test]
    fn test_symlink_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let tar_bytes = tar_with(|b| {
            append_file(b, "usr/bin/python3.11", b"ELF");
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_cksum();
            b.append_link(&mut header, "usr/bin/python3", "python3.11")
                .unwrap();
        });

        apply_layer(&tar_bytes[..], dir.path()).unwrap();
        let link = std::fs::read_link(dir.path().join("usr/bin/python3")).unwrap();
        assert_eq!(link, std::path::PathBuf::from("python3.11"));
    }
}
