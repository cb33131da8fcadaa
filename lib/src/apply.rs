//! Orchestrates a full apply: clean the unpack tree, lay out runtime
//! paths, merge the configured profiles, unpack and propagate each
//! image's assets, then persist and seal the result.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use anyhow::{Context, Result};
use camino::Utf8Path;

use crate::errors::TorcxError;
use crate::extract;
use crate::mount;
use crate::paths::{Paths, OEM_PROFILE_NAME, VENDOR_PROFILE_NAME};
use crate::profile::{self, ProfileVersion};
use crate::propagate;
use crate::seal::{self, SealInfo};
use crate::store::StoreCache;
use crate::types::{Assets, KindValue, Profile, ProfileImage, IMAGE_MANIFEST_V0_KIND};

/// Which profiles an apply should merge, and how strictly to resolve
/// their names against what actually exists on disk.
#[derive(Debug, Clone)]
pub struct ProfileSelection {
    /// Lower profiles, merged in order.
    pub lower: Vec<String>,
    /// Optional upper profile, merged last.
    pub upper: Option<String>,
    /// Whether a named lower profile that does not exist under the
    /// profile directories is a fatal error, as opposed to silently
    /// contributing nothing.
    pub strict_lower: bool,
}

impl ProfileSelection {
    /// The selection `apply` and `torcx-generator` use by default:
    /// vendor then oem as lower profiles (either may be absent), with
    /// whatever `next-profile` names as upper (also optional).
    pub fn default_for(paths: &Paths) -> Self {
        Self {
            lower: vec![VENDOR_PROFILE_NAME.to_string(), OEM_PROFILE_NAME.to_string()],
            upper: paths.read_next_profile_name(),
            strict_lower: false,
        }
    }

    /// An explicit selection, e.g. from `profile check`, where a named
    /// but missing profile is always an error.
    pub fn explicit(lower: Vec<String>, upper: Option<String>) -> Self {
        Self {
            lower,
            upper,
            strict_lower: true,
        }
    }
}

/// The outcome of calling [`apply`].
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    /// A prior apply already ran this boot (the run directory already
    /// existed); this call did nothing.
    AlreadyApplied,
    /// Apply ran to completion and persisted this merged image list.
    Applied {
        /// The merged images that were unpacked, propagated, and
        /// persisted to the runtime profile.
        images: Vec<ProfileImage>,
    },
}

/// Runs the full apply pipeline: clean, lay out paths, bind-mount,
/// merge profiles, unpack and propagate every image, persist the
/// merged profile, and seal.
///
/// Returns [`ApplyOutcome::AlreadyApplied`] without touching anything
/// if the run directory already exists, matching the seal's "write
/// once per boot" invariant a layer up.
pub fn apply(paths: &Paths, selection: &ProfileSelection) -> Result<ApplyOutcome> {
    if paths.run_dir.exists() {
        return Ok(ApplyOutcome::AlreadyApplied);
    }

    clean(paths)?;
    setup_paths(paths)?;

    let merged = profile::merge_named_profiles(
        &paths.profile_dirs(),
        &selection.lower,
        selection.upper.as_deref(),
        selection.strict_lower,
    )?;

    let store = StoreCache::build(&paths.store_paths())?;
    let run_unpack_dir = paths.run_unpack_dir();
    let run_bin_dir = paths.run_bin_dir();

    let mut failures = 0usize;
    for image in &merged {
        if let Err(e) = apply_one_image(&store, image, &run_unpack_dir, &run_bin_dir) {
            tracing::warn!("failed to apply {}:{}: {e:#}", image.name, image.reference);
            failures += 1;
        }
    }

    let profile_path = paths.merged_profile_path();
    persist_merged_profile(&profile_path, &merged)?;

    let info = SealInfo {
        lower_profiles: &selection.lower,
        upper_profile: selection.upper.as_deref(),
        profile_path: &profile_path,
        bin_dir: &run_bin_dir,
        unpack_dir: &run_unpack_dir,
    };
    seal::seal(&paths.seal_path, &run_unpack_dir, &info)?;

    if failures > 0 {
        return Err(TorcxError::IncompleteApply(failures).into());
    }
    Ok(ApplyOutcome::Applied { images: merged })
}

/// Removes the persistent unpack directory, ignoring a missing one.
fn clean(paths: &Paths) -> Result<()> {
    let unpack_dir = paths.unpack_dir();
    match fs::remove_dir_all(&unpack_dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {unpack_dir}")),
    }
}

/// Creates every runtime directory apply needs (0755, idempotent) and
/// bind-mounts the persistent unpack directory onto its runtime
/// mountpoint with slave propagation.
fn setup_paths(paths: &Paths) -> Result<()> {
    let dirs = [
        paths.run_dir.clone(),
        paths.base_dir.clone(),
        paths.conf_dir.clone(),
        paths.run_bin_dir(),
        paths.unpack_dir(),
        paths.run_unpack_dir(),
        paths.user_profile_dir(),
    ];
    for dir in &dirs {
        create_dir_all_0755(dir)?;
    }
    mount::bind_mount_slave(&paths.unpack_dir(), &paths.run_unpack_dir())
}

fn create_dir_all_0755(dir: &Utf8Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {dir}"))?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o755)).with_context(|| format!("chmod {dir}"))
}

/// Extracts one image's archive into its runtime unpack subdirectory
/// and propagates the assets it declares.
fn apply_one_image(
    store: &StoreCache,
    image: &ProfileImage,
    run_unpack_dir: &Utf8Path,
    bin_dir: &Utf8Path,
) -> Result<()> {
    let archive = store.archive_for(image)?;
    let dest = run_unpack_dir.join(&image.name);
    fs::create_dir_all(&dest).with_context(|| format!("creating {dest}"))?;
    extract::extract(&archive.path, archive.format, &dest)?;
    let assets = read_image_assets(&dest)?;
    propagate::propagate_assets(&image.name, &assets, &dest, bin_dir)
}

/// Reads `.torcx/manifest.json` from an unpacked image root. A missing
/// manifest yields an empty asset set rather than an error.
fn read_image_assets(unpack_root: &Utf8Path) -> Result<Assets> {
    let manifest_path = unpack_root.join(".torcx/manifest.json");
    let data = match fs::read_to_string(&manifest_path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Assets::default()),
        Err(e) => return Err(e).with_context(|| format!("reading {manifest_path}")),
    };
    let envelope: KindValue<Assets> = serde_json::from_str(&data).map_err(|e| TorcxError::BadManifest {
        path: manifest_path.clone(),
        source: e.into(),
    })?;
    if envelope.kind != IMAGE_MANIFEST_V0_KIND {
        return Err(TorcxError::BadManifest {
            path: manifest_path,
            source: anyhow::anyhow!("unknown manifest kind: {}", envelope.kind),
        }
        .into());
    }
    Ok(envelope.value)
}

/// Writes the merged image list as `profile-manifest-v0` to `path`
/// and chmods it to 0444.
fn persist_merged_profile(path: &Utf8Path, images: &[ProfileImage]) -> Result<()> {
    let profile = Profile {
        images: images.to_vec(),
    };
    let rendered = profile::write_profile_string(&profile, ProfileVersion::V0)?;
    fs::write(path, &rendered).with_context(|| format!("writing {path}"))?;
    profile::make_readonly(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn utf8(p: std::path::PathBuf) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(p).unwrap()
    }

    fn img(name: &str, reference: &str) -> ProfileImage {
        ProfileImage {
            name: name.to_string(),
            reference: reference.to_string(),
            remote: None,
        }
    }

    fn write_tgz(path: &Utf8Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(enc);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn empty_apply_persists_no_images() {
        let dir = tempfile::tempdir().unwrap();
        let merged: Vec<ProfileImage> = Vec::new();
        let path = utf8(dir.path().join("profile.json"));
        persist_merged_profile(&path, &merged).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"images\": []") || content.contains("\"images\":[]"));
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o444);
    }

    #[test]
    fn single_image_unpacks_and_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = utf8(dir.path().join("store"));
        fs::create_dir_all(&store_dir).unwrap();
        let archive_path = store_dir.join("empty_vendor:com.coreos.cl.torcx.tgz");
        write_tgz(
            &archive_path,
            &[
                (".torcx/manifest.json", br#"{"kind":"image-manifest-v0","value":{"bin":["bin"]}}"#),
                ("bin/tool", b"binary"),
            ],
        );

        let store = StoreCache::build(&[store_dir]).unwrap();
        let run_unpack_dir = utf8(dir.path().join("run-unpack"));
        let bin_dir = utf8(dir.path().join("bin"));
        fs::create_dir_all(&run_unpack_dir).unwrap();

        let image = img("empty_vendor", "com.coreos.cl");
        apply_one_image(&store, &image, &run_unpack_dir, &bin_dir).unwrap();

        assert!(run_unpack_dir.join("empty_vendor/bin/tool").exists());
        let link = bin_dir.join("tool");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
    }

    #[test]
    fn missing_manifest_yields_empty_assets() {
        let dir = tempfile::tempdir().unwrap();
        let unpack_root = utf8(dir.path().join("unpack"));
        fs::create_dir_all(&unpack_root).unwrap();
        let assets = read_image_assets(&unpack_root).unwrap();
        assert_eq!(assets, Assets::default());
    }

    #[test]
    fn bad_manifest_kind_is_bad_manifest_error() {
        let dir = tempfile::tempdir().unwrap();
        let unpack_root = utf8(dir.path().join("unpack"));
        fs::create_dir_all(unpack_root.join(".torcx")).unwrap();
        fs::write(unpack_root.join(".torcx/manifest.json"), br#"{"kind":"bogus","value":{}}"#).unwrap();
        let err = read_image_assets(&unpack_root).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TorcxError>(),
            Some(TorcxError::BadManifest { .. })
        ));
    }

    #[test]
    fn user_overrides_vendor_selection() {
        let dir = tempfile::tempdir().unwrap();
        let profiles_dir = utf8(dir.path().join("etc/profiles"));
        fs::create_dir_all(&profiles_dir).unwrap();
        fs::write(
            profiles_dir.join("vendor.json"),
            r#"{"kind":"profile-manifest-v0","value":{"images":[{"name":"docker","reference":"17.06"}]}}"#,
        )
        .unwrap();
        fs::write(
            profiles_dir.join("user.json"),
            r#"{"kind":"profile-manifest-v0","value":{"images":[{"name":"docker","reference":"1.12"}]}}"#,
        )
        .unwrap();

        let roots = vec![utf8(dir.path().join("etc"))];
        let merged = profile::merge_named_profiles(
            &roots,
            &["vendor".to_string(), "oem".to_string()],
            Some("user"),
            false,
        )
        .unwrap();
        assert_eq!(merged, vec![img("docker", "1.12")]);
    }

    #[test]
    fn user_removes_vendor_selection() {
        let dir = tempfile::tempdir().unwrap();
        let profiles_dir = utf8(dir.path().join("etc/profiles"));
        fs::create_dir_all(&profiles_dir).unwrap();
        fs::write(
            profiles_dir.join("vendor.json"),
            r#"{"kind":"profile-manifest-v0","value":{"images":[{"name":"docker","reference":"17.06"}]}}"#,
        )
        .unwrap();
        fs::write(
            profiles_dir.join("user.json"),
            r#"{"kind":"profile-manifest-v0","value":{"images":[{"name":"docker","reference":""}]}}"#,
        )
        .unwrap();

        let roots = vec![utf8(dir.path().join("etc"))];
        let merged = profile::merge_named_profiles(&roots, &["vendor".to_string()], Some("user"), false).unwrap();
        assert!(merged.is_empty());
    }

    #[test]
    fn missing_lower_profile_is_tolerated_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let roots = vec![utf8(dir.path().join("etc"))];
        let merged = profile::merge_named_profiles(
            &roots,
            &["vendor".to_string(), "oem".to_string()],
            None,
            false,
        )
        .unwrap();
        assert!(merged.is_empty());
    }

    #[test]
    fn missing_lower_profile_errors_when_strict() {
        let dir = tempfile::tempdir().unwrap();
        let roots = vec![utf8(dir.path().join("etc"))];
        let err = profile::merge_named_profiles(&roots, &["vendor".to_string()], None, true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TorcxError>(),
            Some(TorcxError::ProfileNotFound(_))
        ));
    }
}
