//! Wire types shared by profiles, image manifests, and remote manifests.
//!
//! Every on-disk document torcx reads or writes is wrapped in the same
//! `{"kind": "...", "value": {...}}` envelope, versioned independently
//! per document kind. The structs here model both the versioned wire
//! shapes and the version-agnostic in-memory shapes the rest of the
//! crate works with.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// The `{"kind": ..., "value": ...}` envelope every torcx document uses.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct KindValue<T> {
    pub(crate) kind: String,
    pub(crate) value: T,
}

/// Archive container format for an image's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    /// A gzip-compressed tarball.
    Tgz,
    /// A squashfs image, extracted via a loopback mount.
    Squashfs,
}

impl ArchiveFormat {
    /// The filename suffix this format is recognized by in a store path.
    pub(crate) fn suffix(self) -> &'static str {
        match self {
            ArchiveFormat::Tgz => ".torcx.tgz",
            ArchiveFormat::Squashfs => ".torcx.squashfs",
        }
    }

    pub(crate) fn from_filename(name: &str) -> Option<(Self, &str)> {
        for fmt in [ArchiveFormat::Tgz, ArchiveFormat::Squashfs] {
            if let Some(base) = name.strip_suffix(fmt.suffix()) {
                return Some((fmt, base));
            }
        }
        None
    }
}

/// One image entry as it appears inside a profile, after normalizing
/// away the v0/v1 wire distinction (v0 has no `remote` field).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileImage {
    /// Image name, e.g. `docker`.
    pub name: String,
    /// Image reference (version string), e.g. `1.12.1`.
    pub reference: String,
    /// Remote this image should be fetched from if not already present
    /// locally. Only representable in profile-manifest-v1.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub remote: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ImageV0 {
    pub(crate) name: String,
    pub(crate) reference: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ImageV1 {
    pub(crate) name: String,
    pub(crate) reference: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub(crate) remote: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ImagesV0 {
    pub(crate) images: Vec<ImageV0>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ImagesV1 {
    pub(crate) images: Vec<ImageV1>,
}

pub(crate) const PROFILE_MANIFEST_V0_KIND: &str = "profile-manifest-v0";
pub(crate) const PROFILE_MANIFEST_V1_KIND: &str = "profile-manifest-v1";
pub(crate) const IMAGE_MANIFEST_V0_KIND: &str = "image-manifest-v0";
pub(crate) const COMMON_CONFIG_V0_KIND: &str = "torcx-config-v0";
pub(crate) const REMOTE_MANIFEST_V0_KIND: &str = "remote-manifest-v0";
pub(crate) const REMOTE_CONTENTS_V1_KIND: &str = "torcx-remote-contents-v1";

/// A complete, in-memory profile: an ordered list of images.
///
/// This is the version-agnostic shape; [`crate::profile`] handles
/// reading/writing either wire version into and out of this struct.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    /// Images listed by this profile, in file order.
    pub images: Vec<ProfileImage>,
}

/// The asset groups an image manifest may declare, each a set of
/// paths relative to the image's unpack root.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assets {
    /// Executables to expose on `PATH`.
    #[serde(default, rename = "bin", skip_serializing_if = "Vec::is_empty")]
    pub binaries: Vec<Utf8PathBuf>,
    /// systemd-networkd configuration fragments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network: Vec<Utf8PathBuf>,
    /// systemd unit files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub units: Vec<Utf8PathBuf>,
    /// sysusers.d fragments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sysusers: Vec<Utf8PathBuf>,
    /// tmpfiles.d fragments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tmpfiles: Vec<Utf8PathBuf>,
    /// udev rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub udev_rules: Vec<Utf8PathBuf>,
}

/// A remote's top-level descriptor, `remote.json` under the remote's
/// own directory. This is the version-agnostic in-memory shape;
/// [`RemoteManifestV0`] is the wire shape it is read from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteManifest {
    /// URL template for this remote's contents manifest and archives.
    /// May contain `${VAR}` placeholders substituted against os-release
    /// and runtime values.
    pub template_url: String,
    /// Armored PGP public keys trusted to sign this remote's content.
    #[serde(default)]
    pub armored_keys: Vec<String>,
}

/// One entry of `remote-manifest-v0`'s `keys` array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct RemoteKeyV0 {
    pub(crate) armored_keyring: String,
}

/// Wire shape of `remote-manifest-v0`'s `value`: `base_url` and
/// `keys[].armored_keyring`, matching the original `RemoteV0`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct RemoteManifestV0 {
    pub(crate) base_url: String,
    #[serde(default)]
    pub(crate) keys: Vec<RemoteKeyV0>,
}

impl From<RemoteManifestV0> for RemoteManifest {
    fn from(wire: RemoteManifestV0) -> Self {
        RemoteManifest {
            template_url: wire.base_url,
            armored_keys: wire.keys.into_iter().map(|k| k.armored_keyring).collect(),
        }
    }
}

/// One fetchable version of an image, as listed under a
/// [`RemoteImageGroup`]'s `versions` array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteVersionEntry {
    /// Image reference (version tag).
    pub version: String,
    /// Archive format served for this version.
    pub format: ArchiveFormat,
    /// Algo-prefixed content hash, as declared by the remote (e.g.
    /// `sha512-abcd...`, hyphen-separated, per the wire format).
    pub hash: String,
    /// Archive location, absolute or relative to the remote's base URL.
    pub location: String,
}

/// All versions of a single image a remote offers, plus which one is
/// the default for a bare (unversioned) reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteImageGroup {
    /// Image name.
    pub name: String,
    /// Reference of the version to use when none is requested.
    #[serde(rename = "defaultVersion")]
    pub default_version: String,
    /// Versions of this image the remote serves.
    pub versions: Vec<RemoteVersionEntry>,
}

/// A remote's signed listing of fetchable images, `contents.json`
/// (clearsigned, verified against the remote's `armored_keys`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteContents {
    /// Images available from this remote.
    #[serde(default)]
    pub images: Vec<RemoteImageGroup>,
}
