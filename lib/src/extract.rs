//! Unpacks a located archive into a destination directory.
//!
//! Two container formats are supported: a gzip-compressed tarball,
//! unpacked in-process, and a squashfs image, which has no pure-Rust
//! reader here and is instead mounted loopback read-only via the
//! external `mount` binary.

use std::fs::File;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use flate2::read::GzDecoder;

use crate::task::Task;
use crate::types::ArchiveFormat;

/// Extracts `archive` (of the given `format`) into `dest_dir`, which
/// must already exist.
#[context("Extracting {archive} into {dest_dir}")]
pub fn extract(archive: &Utf8Path, format: ArchiveFormat, dest_dir: &Utf8Path) -> Result<()> {
    match format {
        ArchiveFormat::Tgz => extract_tgz(archive, dest_dir),
        ArchiveFormat::Squashfs => mount_squashfs(archive, dest_dir),
    }
}

fn extract_tgz(archive: &Utf8Path, dest_dir: &Utf8Path) -> Result<()> {
    let file = File::open(archive).with_context(|| format!("opening {archive}"))?;
    let gz = GzDecoder::new(file);
    let mut tar = tar::Archive::new(gz);
    tar.set_preserve_permissions(true);
    tar.unpack(dest_dir)
        .with_context(|| format!("unpacking {archive} into {dest_dir}"))
}

fn mount_squashfs(archive: &Utf8Path, dest_dir: &Utf8Path) -> Result<()> {
    Task::new_and_run(
        format!("mounting {archive}"),
        "mount",
        ["-t", "squashfs", "-o", "loop,ro", archive.as_str(), dest_dir.as_str()],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tgz() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("a.torcx.tgz");
        {
            let file = File::create(&archive_path).unwrap();
            let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(enc);
            let mut header = tar::Header::new_gnu();
            header.set_size(5);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "hello.txt", &b"world"[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        let dest = dir.path().join("dest");
        std::fs::create_dir(&dest).unwrap();

        let archive = camino::Utf8PathBuf::from_path_buf(archive_path).unwrap();
        let dest_dir = camino::Utf8PathBuf::from_path_buf(dest).unwrap();
        extract(&archive, ArchiveFormat::Tgz, &dest_dir).unwrap();

        let content = std::fs::read_to_string(dest_dir.join("hello.txt")).unwrap();
        assert_eq!(content, "world");
    }
}
