//! Enumerates archive files across the layered store directories and
//! resolves `(name, reference)` lookups to a concrete archive path.

use std::collections::BTreeMap;
use std::fs;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::errors::TorcxError;
use crate::paths::{Paths, DEFAULT_TAG_REF};
use crate::types::{ArchiveFormat, ProfileImage};

/// A located archive file: the image identity plus where it lives on
/// disk and in what container format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    /// Image name.
    pub name: String,
    /// Image reference.
    pub reference: String,
    /// Path to the archive file.
    pub path: Utf8PathBuf,
    /// Container format.
    pub format: ArchiveFormat,
}

/// A read-only snapshot of every archive visible across the store
/// directories, keyed by `(name, reference)`.
#[derive(Debug, Default)]
pub struct StoreCache {
    archives: BTreeMap<(String, String), Archive>,
}

static_assertions::assert_impl_all!(StoreCache: Send, Sync);

impl StoreCache {
    /// Scans `store_dirs` in order and builds a cache. Earlier
    /// directories shadow later ones; within the scan, a squashfs
    /// archive promotes over an already-registered tgz of the same
    /// identity, and any other collision is a skipped duplicate.
    #[context("Building store cache")]
    pub fn build(store_dirs: &[Utf8PathBuf]) -> Result<Self> {
        let mut cache = Self::default();
        for dir in store_dirs {
            cache.scan_dir(dir);
        }
        Ok(cache)
    }

    fn scan_dir(&mut self, dir: &Utf8Path) {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                tracing::info!("skipping unreadable store {dir}: {e}");
                return;
            }
        };
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some((format, base)) = ArchiveFormat::from_filename(file_name) else {
                continue;
            };
            let resolved = match fs::metadata(entry.path()) {
                Ok(m) if m.is_file() => entry.path(),
                _ => continue,
            };
            let Ok(path) = Utf8PathBuf::from_path_buf(resolved) else {
                continue;
            };
            let (name, reference) = parse_archive_identity(base);
            self.insert(name, reference, path, format);
        }
    }

    fn insert(&mut self, name: String, reference: String, path: Utf8PathBuf, format: ArchiveFormat) {
        let key = (name.clone(), reference.clone());
        match self.archives.get(&key) {
            None => {
                self.archives.insert(
                    key,
                    Archive {
                        name,
                        reference,
                        path,
                        format,
                    },
                );
            }
            Some(prior) if prior.format == ArchiveFormat::Tgz && format == ArchiveFormat::Squashfs => {
                tracing::warn!("replacing tgz with squashfs for {name}:{reference}");
                self.archives.insert(
                    key,
                    Archive {
                        name,
                        reference,
                        path,
                        format,
                    },
                );
            }
            Some(_) => {
                tracing::warn!("duplicate archive for {name}:{reference} at {path}, skipping");
            }
        }
    }

    /// Resolves an image to its archive, or `ImageNotFound`.
    pub fn archive_for(&self, image: &ProfileImage) -> Result<&Archive> {
        self.archives
            .get(&(image.name.clone(), image.reference.clone()))
            .ok_or_else(|| {
                TorcxError::ImageNotFound {
                    name: image.name.clone(),
                    reference: image.reference.clone(),
                }
                .into()
            })
    }

    /// All known archives, in no particular order.
    pub fn archives(&self) -> impl Iterator<Item = &Archive> {
        self.archives.values()
    }
}

/// Splits an archive basename (suffix already stripped) into
/// `(name, reference)`. A filename with no `:` gets [`DEFAULT_TAG_REF`].
/// Splitting on the *last* colon (rather than the Go original's
/// last-segment-then-drop-the-rest behavior, which silently discards
/// colons from names that contain more than one) keeps the name intact
/// for the common case while still treating the final segment as the
/// reference.
fn parse_archive_identity(base: &str) -> (String, String) {
    match base.rsplit_once(':') {
        Some((name, reference)) => (name.to_string(), reference.to_string()),
        None => (base.to_string(), DEFAULT_TAG_REF.to_string()),
    }
}

/// Removes versioned store directories under `base_dir/store/<version>`
/// that are not listed in `keep_versions`. With `image_name`, only that
/// image's archives are removed from each non-kept versioned store,
/// leaving the directory and its other images in place; without it,
/// whole non-kept versioned store directories are removed outright.
/// Returns the count of filesystem entries removed.
#[context("Clearing versioned stores under {base_dir}")]
pub fn clear_versioned(
    base_dir: &Utf8Path,
    keep_versions: &[String],
    image_name: Option<&str>,
) -> Result<usize> {
    let store_root = base_dir.join("store");
    let entries = match fs::read_dir(&store_root) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("reading {store_root}")),
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let Ok(version_path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        let Ok(meta) = fs::metadata(&version_path) else {
            continue;
        };
        if !meta.is_dir() {
            continue;
        }
        let version = version_path.file_name().unwrap_or_default();
        if keep_versions.iter().any(|v| v == version) {
            continue;
        }

        match image_name {
            None => {
                fs::remove_dir_all(&version_path)
                    .with_context(|| format!("removing {version_path}"))?;
                removed += 1;
            }
            Some(name) => {
                let prefix = format!("{name}:");
                for file in fs::read_dir(&version_path)
                    .with_context(|| format!("reading {version_path}"))?
                    .flatten()
                {
                    let Ok(file_path) = Utf8PathBuf::from_path_buf(file.path()) else {
                        continue;
                    };
                    let Some(file_name) = file_path.file_name() else {
                        continue;
                    };
                    let matches = ArchiveFormat::from_filename(file_name)
                        .map(|(_, base)| base.starts_with(&prefix))
                        .unwrap_or(false);
                    if matches {
                        fs::remove_file(&file_path).with_context(|| format!("removing {file_path}"))?;
                        removed += 1;
                    }
                }
            }
        }
    }
    Ok(removed)
}

/// Removes the unversioned vendor store path from `store_dirs` unless
/// `override_version` equals the currently running OS version.
pub fn filter_store_versions(
    store_dirs: Vec<Utf8PathBuf>,
    paths: &Paths,
    override_version: Option<&str>,
) -> Vec<Utf8PathBuf> {
    let Some(override_version) = override_version else {
        return store_dirs;
    };
    if Some(override_version) == paths.os_version_id.as_deref() {
        return store_dirs;
    }
    let vendor = paths.vendor_store_path();
    store_dirs.into_iter().filter(|p| *p != vendor).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_defaults_reference() {
        assert_eq!(
            parse_archive_identity("docker"),
            ("docker".to_string(), DEFAULT_TAG_REF.to_string())
        );
    }

    #[test]
    fn identity_splits_on_last_colon() {
        assert_eq!(
            parse_archive_identity("docker:17.06"),
            ("docker".to_string(), "17.06".to_string())
        );
    }

    #[test]
    fn identity_preserves_colons_in_name() {
        assert_eq!(
            parse_archive_identity("registry.example.com:5000/docker:17.06"),
            (
                "registry.example.com:5000/docker".to_string(),
                "17.06".to_string()
            )
        );
    }

    #[test]
    fn squashfs_promotes_over_tgz() {
        let mut cache = StoreCache::default();
        cache.insert(
            "a".into(),
            "v".into(),
            "/store/a:v.torcx.tgz".into(),
            ArchiveFormat::Tgz,
        );
        cache.insert(
            "a".into(),
            "v".into(),
            "/store/a:v.torcx.squashfs".into(),
            ArchiveFormat::Squashfs,
        );
        let image = ProfileImage {
            name: "a".into(),
            reference: "v".into(),
            remote: None,
        };
        assert_eq!(cache.archive_for(&image).unwrap().format, ArchiveFormat::Squashfs);
    }

    #[test]
    fn clear_versioned_removes_non_kept_stores() {
        let dir = tempfile::tempdir().unwrap();
        let base_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(base_dir.join("store/1.0.0")).unwrap();
        fs::create_dir_all(base_dir.join("store/2.0.0")).unwrap();
        fs::write(base_dir.join("store/1.0.0/docker:17.06.torcx.tgz"), b"x").unwrap();

        let removed = clear_versioned(&base_dir, &["2.0.0".to_string()], None).unwrap();
        assert_eq!(removed, 1);
        assert!(!base_dir.join("store/1.0.0").exists());
        assert!(base_dir.join("store/2.0.0").exists());
    }

    #[test]
    fn clear_versioned_by_image_name_keeps_other_images() {
        let dir = tempfile::tempdir().unwrap();
        let base_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(base_dir.join("store/1.0.0")).unwrap();
        fs::write(base_dir.join("store/1.0.0/docker:17.06.torcx.tgz"), b"x").unwrap();
        fs::write(base_dir.join("store/1.0.0/rkt:1.2.torcx.tgz"), b"x").unwrap();

        let removed = clear_versioned(&base_dir, &[], Some("docker")).unwrap();
        assert_eq!(removed, 1);
        assert!(!base_dir.join("store/1.0.0/docker:17.06.torcx.tgz").exists());
        assert!(base_dir.join("store/1.0.0/rkt:1.2.torcx.tgz").exists());
    }

    #[test]
    fn duplicate_tgz_keeps_first() {
        let mut cache = StoreCache::default();
        cache.insert(
            "a".into(),
            "v".into(),
            "/store/1/a:v.torcx.tgz".into(),
            ArchiveFormat::Tgz,
        );
        cache.insert(
            "a".into(),
            "v".into(),
            "/store/2/a:v.torcx.tgz".into(),
            ArchiveFormat::Tgz,
        );
        let image = ProfileImage {
            name: "a".into(),
            reference: "v".into(),
            remote: None,
        };
        assert_eq!(
            cache.archive_for(&image).unwrap().path,
            Utf8PathBuf::from("/store/1/a:v.torcx.tgz")
        );
    }
}
