//! Propagates an image's declared assets from its unpacked root into
//! the well-known runtime directories, as absolute symlinks back into
//! the unpack tree.
//!
//! Two distinct layouts are used. Binaries are recursively flattened
//! to their basename (mirroring a `PATH`-style bin directory, where
//! nested subdirectories inside an image's `bin/` asset list carry no
//! meaning). Everything else - network configs, units, sysusers,
//! tmpfiles, udev rules - keeps one level of directory structure: a
//! directory asset (e.g. a `foo.service.d` drop-in directory) becomes
//! a real directory at the destination, populated with symlinks to
//! its direct entries, rather than a single symlink to the whole
//! directory. A symlink found among the asset's own files is
//! duplicated verbatim (same literal target string) rather than
//! resolved and re-pointed.

use std::fs;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::errors::TorcxError;
use crate::types::Assets;

/// Runtime destination directory for each non-binary asset group.
pub(crate) const NETWORK_DIR: &str = "/run/systemd/network";
pub(crate) const UNITS_DIR: &str = "/run/systemd/system";
pub(crate) const SYSUSERS_DIR: &str = "/run/sysusers.d";
pub(crate) const TMPFILES_DIR: &str = "/run/tmpfiles.d";
pub(crate) const UDEV_RULES_DIR: &str = "/run/udev/rules.d";

/// Propagates every asset group declared by `assets`, whose paths are
/// relative to `unpack_root` (the image's unpacked tree), into the
/// runtime directories. `bin_dir` is the destination for binaries.
/// Already-propagated destinations (another image's first-writer-wins
/// claim) are left untouched.
#[context("Propagating assets for image {image_name}")]
pub fn propagate_assets(
    image_name: &str,
    assets: &Assets,
    unpack_root: &Utf8Path,
    bin_dir: &Utf8Path,
) -> Result<()> {
    propagate_flattened(image_name, &assets.binaries, unpack_root, bin_dir)?;
    propagate_layered(image_name, &assets.network, unpack_root, Utf8Path::new(NETWORK_DIR))?;
    propagate_layered(image_name, &assets.units, unpack_root, Utf8Path::new(UNITS_DIR))?;
    propagate_layered(image_name, &assets.sysusers, unpack_root, Utf8Path::new(SYSUSERS_DIR))?;
    propagate_layered(image_name, &assets.tmpfiles, unpack_root, Utf8Path::new(TMPFILES_DIR))?;
    propagate_layered(image_name, &assets.udev_rules, unpack_root, Utf8Path::new(UDEV_RULES_DIR))?;
    Ok(())
}

/// Binary-style propagation: every file under each declared asset path
/// is walked recursively and symlinked into `dest_dir` under its bare
/// basename, regardless of how deep it was nested.
fn propagate_flattened(
    image_name: &str,
    declared: &[Utf8PathBuf],
    unpack_root: &Utf8Path,
    dest_dir: &Utf8Path,
) -> Result<()> {
    if declared.is_empty() {
        return Ok(());
    }
    fs::create_dir_all(dest_dir).with_context(|| format!("creating {dest_dir}"))?;
    for rel in declared {
        let source = unpack_root.join(rel);
        if !source.exists() {
            return Err(TorcxError::MissingAsset {
                image: image_name.to_string(),
                asset: rel.clone(),
            }
            .into());
        }
        flatten_walk(&source, dest_dir)?;
    }
    Ok(())
}

fn flatten_walk(source: &Utf8Path, dest_dir: &Utf8Path) -> Result<()> {
    let metadata = fs::symlink_metadata(source).with_context(|| format!("stat {source}"))?;
    if metadata.is_dir() {
        let entries = fs::read_dir(source).with_context(|| format!("reading {source}"))?;
        for entry in entries {
            let entry = entry?;
            let child = Utf8PathBuf::from_path_buf(entry.path())
                .map_err(|p| anyhow::anyhow!("non-utf8 path {}", p.display()))?;
            flatten_walk(&child, dest_dir)?;
        }
        return Ok(());
    }
    let basename = source
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("asset path {source} has no file name"))?;
    let dest = dest_dir.join(basename);
    symlink_first_writer_wins(source, &dest)
}

/// Unit-style propagation: each declared path is symlinked directly
/// into `dest_dir`, preserving one level of directory nesting (the
/// asset's own basename) rather than flattening arbitrarily deep
/// structure. A declared path that is itself a symlink is duplicated
/// with its literal (unresolved) target, not followed. A declared path
/// that is a directory is created for real at `dest_dir`, and its
/// direct entries are symlinked into it - the directory itself is
/// "preserved and populated" rather than symlinked wholesale, so a
/// consumer dropping another fragment into the same directory name
/// (from a different image) can still populate it further.
fn propagate_layered(
    image_name: &str,
    declared: &[Utf8PathBuf],
    unpack_root: &Utf8Path,
    dest_dir: &Utf8Path,
) -> Result<()> {
    if declared.is_empty() {
        return Ok(());
    }
    fs::create_dir_all(dest_dir).with_context(|| format!("creating {dest_dir}"))?;
    for rel in declared {
        let source = unpack_root.join(rel);
        let metadata = fs::symlink_metadata(&source);
        if metadata.is_err() {
            return Err(TorcxError::MissingAsset {
                image: image_name.to_string(),
                asset: rel.clone(),
            }
            .into());
        }
        let basename = rel
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("asset path {rel} has no file name"))?;
        let dest = dest_dir.join(basename);
        let metadata = metadata.expect("checked above");
        if metadata.is_symlink() {
            let target = fs::read_link(&source).with_context(|| format!("reading link {source}"))?;
            duplicate_symlink_first_writer_wins(&target, &dest)?;
        } else if metadata.is_dir() {
            populate_layer_dir(&source, &dest)?;
        } else {
            symlink_first_writer_wins(&source, &dest)?;
        }
    }
    Ok(())
}

/// Creates `dest` as a real directory (if not already one) and
/// symlinks every direct entry of `source` into it by basename,
/// without descending further. Symlinked entries are duplicated
/// verbatim; everything else becomes a symlink back into the unpack
/// tree.
fn populate_layer_dir(source: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    if dest.symlink_metadata().map(|m| !m.is_dir()).unwrap_or(false) {
        tracing::debug!("asset destination {dest} already claimed by a non-directory, leaving it in place");
        return Ok(());
    }
    fs::create_dir_all(dest).with_context(|| format!("creating {dest}"))?;
    for entry in fs::read_dir(source).with_context(|| format!("reading {source}"))? {
        let entry = entry?;
        let child = Utf8PathBuf::from_path_buf(entry.path())
            .map_err(|p| anyhow::anyhow!("non-utf8 path {}", p.display()))?;
        let basename = child
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("asset path {child} has no file name"))?;
        let child_dest = dest.join(basename);
        let child_meta = fs::symlink_metadata(&child).with_context(|| format!("stat {child}"))?;
        if child_meta.is_symlink() {
            let target = fs::read_link(&child).with_context(|| format!("reading link {child}"))?;
            duplicate_symlink_first_writer_wins(&target, &child_dest)?;
        } else {
            symlink_first_writer_wins(&child, &child_dest)?;
        }
    }
    Ok(())
}

fn symlink_first_writer_wins(source: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    if dest.symlink_metadata().is_ok() {
        tracing::debug!("asset destination {dest} already claimed, leaving it in place");
        return Ok(());
    }
    std::os::unix::fs::symlink(source, dest).with_context(|| format!("symlinking {dest} -> {source}"))
}

fn duplicate_symlink_first_writer_wins(target: &std::path::Path, dest: &Utf8Path) -> Result<()> {
    if dest.symlink_metadata().is_ok() {
        tracing::debug!("asset destination {dest} already claimed, leaving it in place");
        return Ok(());
    }
    std::os::unix::fs::symlink(target, dest).with_context(|| format!("symlinking {dest}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf8(p: std::path::PathBuf) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(p).unwrap()
    }

    #[test]
    fn flattens_nested_binaries() {
        let dir = tempfile::tempdir().unwrap();
        let unpack = utf8(dir.path().join("unpack"));
        let bindir = utf8(dir.path().join("bin"));
        fs::create_dir_all(unpack.join("bin/nested")).unwrap();
        fs::write(unpack.join("bin/nested/tool"), b"x").unwrap();

        let assets = Assets {
            binaries: vec![Utf8PathBuf::from("bin")],
            ..Default::default()
        };
        propagate_assets("demo", &assets, &unpack, &bindir).unwrap();

        let link = bindir.join("tool");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), unpack.join("bin/nested/tool").as_std_path());
    }

    #[test]
    fn first_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let unpack = utf8(dir.path().join("unpack"));
        let bindir = utf8(dir.path().join("bin"));
        fs::create_dir_all(&unpack).unwrap();
        fs::write(unpack.join("tool"), b"first").unwrap();
        fs::create_dir_all(&bindir).unwrap();
        let existing_target = unpack.join("tool");
        std::os::unix::fs::symlink(&existing_target, bindir.join("tool")).unwrap();

        let unpack2 = utf8(dir.path().join("unpack2"));
        fs::create_dir_all(&unpack2).unwrap();
        fs::write(unpack2.join("tool"), b"second").unwrap();

        let assets = Assets {
            binaries: vec![Utf8PathBuf::from("tool")],
            ..Default::default()
        };
        propagate_assets("second-image", &assets, &unpack2, &bindir).unwrap();

        assert_eq!(fs::read_link(bindir.join("tool")).unwrap(), existing_target.as_std_path());
    }

    #[test]
    fn missing_asset_errors() {
        let dir = tempfile::tempdir().unwrap();
        let unpack = utf8(dir.path().join("unpack"));
        fs::create_dir_all(&unpack).unwrap();
        let bindir = utf8(dir.path().join("bin"));

        let assets = Assets {
            binaries: vec![Utf8PathBuf::from("missing")],
            ..Default::default()
        };
        let err = propagate_assets("demo", &assets, &unpack, &bindir).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn unit_asset_preserves_one_level() {
        let dir = tempfile::tempdir().unwrap();
        let unpack = utf8(dir.path().join("unpack"));
        let dest = utf8(dir.path().join("dest"));
        fs::create_dir_all(unpack.join("units")).unwrap();
        fs::write(unpack.join("units/foo.service"), b"x").unwrap();

        let assets = Assets {
            units: vec![Utf8PathBuf::from("units/foo.service")],
            ..Default::default()
        };
        propagate_layered("demo", &assets.units, &unpack, &dest).unwrap();
        assert!(dest.join("foo.service").symlink_metadata().unwrap().file_type().is_symlink());
    }

    #[test]
    fn unit_dropin_directory_is_preserved_and_populated() {
        let dir = tempfile::tempdir().unwrap();
        let unpack = utf8(dir.path().join("unpack"));
        let dest = utf8(dir.path().join("dest"));
        fs::create_dir_all(unpack.join("units/foo.service.d")).unwrap();
        fs::write(unpack.join("units/foo.service.d/override.conf"), b"x").unwrap();

        let assets = Assets {
            units: vec![Utf8PathBuf::from("units/foo.service.d")],
            ..Default::default()
        };
        propagate_layered("demo", &assets.units, &unpack, &dest).unwrap();

        let dropin_dir = dest.join("foo.service.d");
        assert!(dropin_dir.is_dir());
        assert!(!dropin_dir.symlink_metadata().unwrap().file_type().is_symlink());
        let link = dropin_dir.join("override.conf");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(
            fs::read_link(&link).unwrap(),
            unpack.join("units/foo.service.d/override.conf").as_std_path()
        );
    }
}
