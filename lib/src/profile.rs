//! Reading, writing, merging, and discovering profiles.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::os::unix::fs::PermissionsExt;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::errors::TorcxError;
use crate::types::{
    ImageV0, ImageV1, ImagesV0, ImagesV1, KindValue, Profile, ProfileImage,
    PROFILE_MANIFEST_V0_KIND, PROFILE_MANIFEST_V1_KIND,
};

/// Reads a profile file, dispatching on its `kind` tag. A missing or
/// empty file yields an empty profile rather than an error.
#[context("Reading profile {path}")]
pub fn read_profile(path: &Utf8Path) -> Result<Profile> {
    let data = match fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Profile::default()),
        Err(e) => return Err(e).with_context(|| format!("reading {path}")),
    };
    if data.trim().is_empty() {
        return Ok(Profile::default());
    }
    parse_profile(&data).map_err(|source| {
        TorcxError::BadManifest {
            path: path.to_owned(),
            source,
        }
        .into()
    })
}

fn parse_profile(data: &str) -> Result<Profile> {
    let peek: KindValue<serde_json::Value> = serde_json::from_str(data)?;
    match peek.kind.as_str() {
        PROFILE_MANIFEST_V0_KIND => {
            let images: ImagesV0 = serde_json::from_value(peek.value)?;
            Ok(Profile {
                images: images
                    .images
                    .into_iter()
                    .map(|i| ProfileImage {
                        name: i.name,
                        reference: i.reference,
                        remote: None,
                    })
                    .collect(),
            })
        }
        PROFILE_MANIFEST_V1_KIND => {
            let images: ImagesV1 = serde_json::from_value(peek.value)?;
            Ok(Profile {
                images: images
                    .images
                    .into_iter()
                    .map(|i| ProfileImage {
                        name: i.name,
                        reference: i.reference,
                        remote: i.remote,
                    })
                    .collect(),
            })
        }
        other => Err(TorcxError::UnknownProfileKind(other.to_string()).into()),
    }
}

/// Which wire version a profile should be (re)serialized as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileVersion {
    /// `profile-manifest-v0`, no `remote` field.
    V0,
    /// `profile-manifest-v1`, `remote` field permitted.
    V1,
}

/// Serializes `profile` to its tagged-kind JSON form.
pub fn write_profile_string(profile: &Profile, version: ProfileVersion) -> Result<String> {
    let value = match version {
        ProfileVersion::V0 => {
            let images = ImagesV0 {
                images: profile
                    .images
                    .iter()
                    .map(|i| ImageV0 {
                        name: i.name.clone(),
                        reference: i.reference.clone(),
                    })
                    .collect(),
            };
            serde_json::to_value(images)?
        }
        ProfileVersion::V1 => {
            let images = ImagesV1 {
                images: profile
                    .images
                    .iter()
                    .map(|i| ImageV1 {
                        name: i.name.clone(),
                        reference: i.reference.clone(),
                        remote: i.remote.clone(),
                    })
                    .collect(),
            };
            serde_json::to_value(images)?
        }
    };
    let kind = match version {
        ProfileVersion::V0 => PROFILE_MANIFEST_V0_KIND,
        ProfileVersion::V1 => PROFILE_MANIFEST_V1_KIND,
    };
    let envelope = KindValue {
        kind: kind.to_string(),
        value,
    };
    Ok(serde_json::to_string_pretty(&envelope)?)
}

fn detect_version(data: &str) -> ProfileVersion {
    serde_json::from_str::<KindValue<serde_json::Value>>(data)
        .ok()
        .filter(|e| e.kind == PROFILE_MANIFEST_V1_KIND)
        .map(|_| ProfileVersion::V1)
        .unwrap_or(ProfileVersion::V0)
}

/// Reads `path`, adds or replaces (by name) `image`, and writes the
/// result back preserving the source file's permissions and `kind`
/// version.
#[context("Adding {} to profile {path}", image.name)]
pub fn add_to_profile(path: &Utf8Path, image: ProfileImage) -> Result<()> {
    let (existing, version, perm) = match fs::read_to_string(path) {
        Ok(data) => {
            let version = detect_version(&data);
            let profile = if data.trim().is_empty() {
                Profile::default()
            } else {
                parse_profile(&data)?
            };
            let perm = fs::metadata(path)?.permissions();
            (profile, version, Some(perm))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Profile::default(), ProfileVersion::V1, None),
        Err(e) => return Err(e).with_context(|| format!("reading {path}")),
    };

    let mut profile = existing;
    if let Some(slot) = profile.images.iter_mut().find(|i| i.name == image.name) {
        *slot = image;
    } else {
        profile.images.push(image);
    }

    let rendered = write_profile_string(&profile, version)?;
    fs::write(path, rendered).with_context(|| format!("writing {path}"))?;
    if let Some(perm) = perm {
        fs::set_permissions(path, perm).with_context(|| format!("chmod {path}"))?;
    }
    Ok(())
}

/// Walks every directory in `roots`, descending only into
/// subdirectories literally named `profiles`, and records every
/// `<name>.json` found there (under the parent being `profiles`).
/// Later roots never overwrite an entry an earlier root already
/// produced.
pub fn list_profiles(roots: &[Utf8PathBuf]) -> BTreeMap<String, Utf8PathBuf> {
    let mut profiles = BTreeMap::new();
    for root in roots {
        walk_profiles_root(root, &mut profiles);
    }
    profiles
}

fn walk_profiles_root(root: &Utf8Path, out: &mut BTreeMap<String, Utf8PathBuf>) {
    walk_dir(root, false, out);
}

fn walk_dir(dir: &Utf8Path, in_profiles_dir: bool, out: &mut BTreeMap<String, Utf8PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        if file_type.is_dir() {
            let is_profiles_dir = path.file_name() == Some("profiles");
            if in_profiles_dir || is_profiles_dir {
                walk_dir(&path, true, out);
            }
            // Directories not named `profiles` (and not already inside
            // one) are pruned, matching the reader's walk policy.
        } else if file_type.is_file() && in_profiles_dir {
            if let Some(name) = path.file_name().and_then(|n| n.strip_suffix(".json")) {
                out.entry(name.to_string()).or_insert(path);
            }
        }
    }
}

/// Filters `names` down to those that actually exist under `roots`,
/// per [`list_profiles`]. Used to validate lower/upper profile names
/// before merging.
pub fn existing_profiles(roots: &[Utf8PathBuf]) -> HashSet<String> {
    list_profiles(roots).into_keys().collect()
}

/// Merges a list of lower profiles (applied first, in order) with an
/// optional upper profile, per the precedence rules in the merge
/// algorithm: a later profile may remove an earlier image (same name,
/// empty reference) or override it (same name, non-empty reference,
/// moving the entry to the later profile's position). Images with an
/// empty name are dropped.
pub fn merge_profiles(lower: &[Profile], upper: Option<&Profile>) -> Vec<ProfileImage> {
    let mut layers: Vec<&Profile> = lower.iter().collect();
    if let Some(upper) = upper {
        layers.push(upper);
    }
    merge_layers(&layers)
}

fn merge_layers(layers: &[&Profile]) -> Vec<ProfileImage> {
    // A name's fate (keep/override/remove) is decided by whichever
    // layer mentions it last; earlier mentions are entirely shadowed,
    // which is also what moves an overridden entry to the later
    // layer's position in the output.
    let mut last_writer: BTreeMap<&str, usize> = BTreeMap::new();
    for (idx, layer) in layers.iter().enumerate() {
        for image in &layer.images {
            if !image.name.is_empty() {
                last_writer.insert(image.name.as_str(), idx);
            }
        }
    }

    let mut merged = Vec::new();
    for (idx, layer) in layers.iter().enumerate() {
        for image in &layer.images {
            if image.name.is_empty() || last_writer.get(image.name.as_str()) != Some(&idx) {
                continue;
            }
            if image.reference.is_empty() {
                continue; // removed
            }
            merged.push(image.clone());
        }
    }
    merged
}

/// Resolves `lower_names`/`upper_name` against the profiles found under
/// `roots`, reads each, and merges them per [`merge_profiles`].
///
/// When `strict_lower` is set, a named lower profile that does not
/// exist under `roots` is a [`TorcxError::ProfileNotFound`]; otherwise
/// a missing lower profile is silently treated as empty, which is what
/// lets an apply with no profiles configured at all still succeed.
/// The upper profile, when named, is always resolved strictly: a user
/// explicitly asking for a profile that does not exist is always a
/// mistake worth reporting.
pub fn merge_named_profiles(
    roots: &[Utf8PathBuf],
    lower_names: &[String],
    upper_name: Option<&str>,
    strict_lower: bool,
) -> Result<Vec<ProfileImage>> {
    let found = list_profiles(roots);

    let mut lower = Vec::with_capacity(lower_names.len());
    for name in lower_names {
        match found.get(name) {
            Some(path) => lower.push(read_profile(path)?),
            None if strict_lower => return Err(TorcxError::ProfileNotFound(name.clone()).into()),
            None => continue,
        }
    }

    let upper = match upper_name {
        Some(name) => {
            let path = found
                .get(name)
                .ok_or_else(|| TorcxError::ProfileNotFound(name.to_string()))?;
            Some(read_profile(path)?)
        }
        None => None,
    };

    Ok(merge_profiles(&lower, upper.as_ref()))
}

/// Chmods `path` to 0444, used after persisting the merged profile.
pub fn make_readonly(path: &Utf8Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o444))
        .with_context(|| format!("chmod {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn img(name: &str, reference: &str) -> ProfileImage {
        ProfileImage {
            name: name.to_string(),
            reference: reference.to_string(),
            remote: None,
        }
    }

    #[test]
    fn round_trips_v0() {
        let profile = Profile {
            images: vec![img("docker", "17.06"), img("rkt", "1.2")],
        };
        let rendered = write_profile_string(&profile, ProfileVersion::V0).unwrap();
        let parsed = parse_profile(&rendered).unwrap();
        similar_asserts::assert_eq!(parsed, profile);
    }

    #[test]
    fn round_trips_v1_with_remote() {
        let mut profile = Profile {
            images: vec![img("docker", "17.06")],
        };
        profile.images[0].remote = Some("release".to_string());
        let rendered = write_profile_string(&profile, ProfileVersion::V1).unwrap();
        let parsed = parse_profile(&rendered).unwrap();
        similar_asserts::assert_eq!(parsed, profile);
    }

    #[test]
    fn unknown_kind_rejected() {
        let err = parse_profile(r#"{"kind":"bogus","value":{}}"#).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn user_overrides_vendor() {
        let vendor = Profile {
            images: vec![img("docker", "17.06")],
        };
        let user = Profile {
            images: vec![img("docker", "1.12")],
        };
        let merged = merge_profiles(&[vendor], Some(&user));
        similar_asserts::assert_eq!(merged, vec![img("docker", "1.12")]);
    }

    #[test]
    fn user_removes_vendor() {
        let vendor = Profile {
            images: vec![img("docker", "17.06")],
        };
        let user = Profile {
            images: vec![img("docker", "")],
        };
        let merged = merge_profiles(&[vendor], Some(&user));
        assert!(merged.is_empty());
    }

    #[test]
    fn overridden_entry_moves_to_upper_position() {
        let vendor = Profile {
            images: vec![img("a", "1"), img("b", "1"), img("c", "1")],
        };
        let user = Profile {
            images: vec![img("b", "2")],
        };
        let merged = merge_profiles(&[vendor], Some(&user));
        similar_asserts::assert_eq!(merged, vec![img("a", "1"), img("c", "1"), img("b", "2")]);
    }

    #[test]
    fn empty_name_dropped() {
        let vendor = Profile {
            images: vec![img("", "1"), img("a", "1")],
        };
        let merged = merge_profiles(&[vendor], None);
        assert_eq!(merged, vec![img("a", "1")]);
    }
}
