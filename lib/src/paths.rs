//! Common configuration and the layered directory lists derived from it.
//!
//! Everything downstream - the store cache, the profile reader, the
//! apply orchestrator - takes a [`Paths`] value rather than reaching
//! for process-wide constants, so tests can point the whole pipeline
//! at a scratch directory tree.

use std::collections::BTreeMap;
use std::env;
use std::fs;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::errors::TorcxError;
use crate::types::{KindValue, COMMON_CONFIG_V0_KIND};

/// Reference tag used when an archive filename carries no `:reference`
/// suffix, and when a remote image is requested by this sentinel.
pub const DEFAULT_TAG_REF: &str = "com.coreos.cl";

/// Name of the bundled, read-only vendor profile.
pub const VENDOR_PROFILE_NAME: &str = "vendor";
/// Name of the OEM profile, populated by the platform image.
pub const OEM_PROFILE_NAME: &str = "oem";

const DEFAULT_BASE_DIR: &str = "/var/lib/torcx";
const DEFAULT_RUN_DIR: &str = "/run/torcx";
const DEFAULT_USR_DIR: &str = "/usr";
const DEFAULT_CONF_DIR: &str = "/etc/torcx";
const DEFAULT_OEM_DIR: &str = "/usr/share/oem/torcx";
const DEFAULT_SEAL_PATH: &str = "/run/metadata/torcx";
const OS_RELEASE_PATH: &str = "/usr/lib/os-release";

/// `torcx-config-v0`, the optional JSON config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct CommonConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) base_dir: Option<Utf8PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) run_dir: Option<Utf8PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) conf_dir: Option<Utf8PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) store_paths: Vec<Utf8PathBuf>,
}

/// The fully resolved set of directories every other component
/// operates against, plus the OS version ID (when known).
#[derive(Debug, Clone)]
pub struct Paths {
    /// Persistent state directory, e.g. `/var/lib/torcx`.
    pub base_dir: Utf8PathBuf,
    /// Runtime (tmpfs-backed) directory, e.g. `/run/torcx`.
    pub run_dir: Utf8PathBuf,
    /// Mountpoint of the vendor `/usr`, e.g. `/usr`.
    pub usr_dir: Utf8PathBuf,
    /// User-writable configuration directory, e.g. `/etc/torcx`.
    pub conf_dir: Utf8PathBuf,
    /// OEM partition torcx directory, e.g. `/usr/share/oem/torcx`.
    pub oem_dir: Utf8PathBuf,
    /// Extra store paths taken verbatim from configuration.
    pub extra_store_paths: Vec<Utf8PathBuf>,
    /// Current OS `VERSION_ID`, if the os-release file carried one.
    pub os_version_id: Option<String>,
    /// Seal file path.
    pub seal_path: Utf8PathBuf,
}

impl Paths {
    /// Build `Paths` from the environment, an optional config file, and
    /// defaults, in that precedence order (env overrides file, file
    /// overrides defaults).
    #[context("Loading torcx configuration")]
    pub fn load() -> Result<Self> {
        let conf_dir = env::var("TORCX_CONFDIR")
            .ok()
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_CONF_DIR));

        let config_path = cmdline_torcx_config().unwrap_or_else(|| conf_dir.join("config.json"));
        let file = read_config_file(&config_path)?;

        let base_dir = env_path("TORCX_BASEDIR")
            .or(file.base_dir.clone())
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_BASE_DIR));
        let run_dir = env_path("TORCX_RUNDIR")
            .or(file.run_dir.clone())
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_RUN_DIR));
        let conf_dir = file.conf_dir.clone().unwrap_or(conf_dir);
        let usr_dir = env_path("TORCX_USR_MOUNTPOINT")
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_USR_DIR));
        let oem_dir = Utf8PathBuf::from(DEFAULT_OEM_DIR);

        let mut extra_store_paths: Vec<Utf8PathBuf> = env::vars()
            .filter(|(k, _)| k == "TORCX_STOREPATH")
            .map(|(_, v)| Utf8PathBuf::from(v))
            .collect();
        extra_store_paths.extend(file.store_paths.iter().cloned());

        for p in [&base_dir, &run_dir, &conf_dir, &usr_dir]
            .into_iter()
            .chain(extra_store_paths.iter())
        {
            if !p.is_absolute() {
                return Err(TorcxError::ConfigInvalid(format!("path is not absolute: {p}")).into());
            }
        }

        let os_version_id = read_os_version_id(Utf8Path::new(OS_RELEASE_PATH)).ok();

        Ok(Self {
            base_dir,
            run_dir,
            usr_dir,
            conf_dir,
            oem_dir,
            extra_store_paths,
            os_version_id,
            seal_path: Utf8PathBuf::from(DEFAULT_SEAL_PATH),
        })
    }

    /// The ordered list of store directories, per §4.1: vendor store,
    /// versioned then unversioned OEM store, versioned then unversioned
    /// base store, then any extra configured paths.
    pub fn store_paths(&self) -> Vec<Utf8PathBuf> {
        let mut v = vec![self.usr_dir.join("share/torcx/store")];
        if let Some(version) = &self.os_version_id {
            v.push(self.oem_dir.join("store").join(version));
        }
        v.push(self.oem_dir.join("store"));
        if let Some(version) = &self.os_version_id {
            v.push(self.base_dir.join("store").join(version));
        }
        v.push(self.base_dir.join("store"));
        v.extend(self.extra_store_paths.iter().cloned());
        v
    }

    /// The single unversioned vendor store path, used by the store
    /// cache's version filter to decide what to drop for an override
    /// version.
    pub fn vendor_store_path(&self) -> Utf8PathBuf {
        self.usr_dir.join("share/torcx/store")
    }

    /// The ordered list of profile-search roots: vendor, OEM, user.
    pub fn profile_dirs(&self) -> Vec<Utf8PathBuf> {
        vec![
            self.usr_dir.join("share/torcx/profiles"),
            self.oem_dir.join("profiles"),
            self.conf_dir.join("profiles"),
        ]
    }

    /// The user-writable profile directory, target of `profile new`
    /// and `profile use-image` when no `--file` is given.
    pub fn user_profile_dir(&self) -> Utf8PathBuf {
        self.conf_dir.join("profiles")
    }

    /// Path to the `next-profile` selector file.
    pub fn next_profile_path(&self) -> Utf8PathBuf {
        self.conf_dir.join("next-profile")
    }

    /// Runtime unpack directory bind-mounted over the persistent one.
    pub fn run_unpack_dir(&self) -> Utf8PathBuf {
        self.run_dir.join("unpack")
    }

    /// Persistent unpack directory, the bind-mount source.
    pub fn unpack_dir(&self) -> Utf8PathBuf {
        self.base_dir.join("unpack")
    }

    /// Runtime bin directory exposed on `PATH`.
    pub fn run_bin_dir(&self) -> Utf8PathBuf {
        self.run_dir.join("bin")
    }

    /// Path the merged profile is persisted to on apply.
    pub fn merged_profile_path(&self) -> Utf8PathBuf {
        self.run_dir.join("profile.json")
    }

    /// Reads `next-profile`, stripping a trailing `.json` if present.
    pub fn read_next_profile_name(&self) -> Option<String> {
        let content = fs::read_to_string(self.next_profile_path()).ok()?;
        let name = content.trim();
        if name.is_empty() {
            return None;
        }
        Some(name.strip_suffix(".json").unwrap_or(name).to_string())
    }

    /// The ordered list of remote-search roots, mirroring
    /// [`Paths::profile_dirs`]: vendor, OEM, user.
    pub fn remote_dirs(&self) -> Vec<Utf8PathBuf> {
        vec![
            self.usr_dir.join("share/torcx/remotes"),
            self.oem_dir.join("remotes"),
            self.conf_dir.join("remotes"),
        ]
    }

    /// Whether `TORCX_CHECK_REMOTE_ONLY` is set, requesting that
    /// `profile populate` only resolve availability without fetching.
    pub fn check_remote_only(&self) -> bool {
        env::var_os("TORCX_CHECK_REMOTE_ONLY").is_some()
    }

    /// Whether the experimental feature `name` is enabled via
    /// `TORCX_EXP_<NAME>` (name is upper-cased for the lookup).
    pub fn has_experimental_feature(&self, name: &str) -> bool {
        let key = format!("TORCX_EXP_{}", name.to_ascii_uppercase());
        env::var_os(key).is_some()
    }
}

fn env_path(key: &str) -> Option<Utf8PathBuf> {
    env::var(key).ok().map(Utf8PathBuf::from)
}

/// Looks for `torcx_config=<path>` on the kernel command line.
fn cmdline_torcx_config() -> Option<Utf8PathBuf> {
    let cmdline = fs::read_to_string("/proc/cmdline").ok()?;
    for token in cmdline.split_whitespace() {
        if let Some(path) = token.strip_prefix("torcx_config=") {
            return Some(Utf8PathBuf::from(path));
        }
    }
    None
}

fn read_config_file(path: &Utf8Path) -> Result<CommonConfigFile> {
    let data = match fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CommonConfigFile::default()),
        Err(e) => return Err(e).with_context(|| format!("reading {path}")),
    };
    let envelope: KindValue<CommonConfigFile> =
        serde_json::from_str(&data).with_context(|| format!("parsing {path}"))?;
    if envelope.kind != COMMON_CONFIG_V0_KIND {
        return Err(TorcxError::UnknownProfileKind(envelope.kind).into());
    }
    Ok(envelope.value)
}

/// Parses shell-style `KEY=VALUE` (optionally quoted) lines into a map.
pub(crate) fn parse_kv_file(content: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"');
        if key.is_empty() || value.is_empty() {
            continue;
        }
        map.insert(key.to_string(), value.to_string());
    }
    map
}

#[context("Reading OS version from {path}")]
fn read_os_version_id(path: &Utf8Path) -> Result<String> {
    let content = fs::read_to_string(path)?;
    parse_kv_file(&content)
        .get("VERSION_ID")
        .cloned()
        .ok_or_else(|| TorcxError::UnknownOsVersionId.into())
}

/// Reads the full set of os-release key/value pairs, used by the
/// remote URL templater.
pub(crate) fn read_os_release(path: &Utf8Path) -> Result<BTreeMap<String, String>> {
    let content = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    Ok(parse_kv_file(&content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_kv() {
        let m = parse_kv_file("FOO=\"bar\"\nBAZ=qux\n# comment\n\nEMPTY=\n");
        assert_eq!(m.get("FOO").unwrap(), "bar");
        assert_eq!(m.get("BAZ").unwrap(), "qux");
        assert!(!m.contains_key("EMPTY"));
    }

    #[test]
    fn store_paths_without_version() {
        let p = Paths {
            base_dir: "/var/lib/torcx".into(),
            run_dir: "/run/torcx".into(),
            usr_dir: "/usr".into(),
            conf_dir: "/etc/torcx".into(),
            oem_dir: "/usr/share/oem/torcx".into(),
            extra_store_paths: vec!["/extra/store".into()],
            os_version_id: None,
            seal_path: "/run/metadata/torcx".into(),
        };
        let paths = p.store_paths();
        assert_eq!(
            paths,
            vec![
                Utf8PathBuf::from("/usr/share/torcx/store"),
                Utf8PathBuf::from("/usr/share/oem/torcx/store"),
                Utf8PathBuf::from("/var/lib/torcx/store"),
                Utf8PathBuf::from("/extra/store"),
            ]
        );
    }

    #[test]
    fn store_paths_with_version() {
        let p = Paths {
            base_dir: "/var/lib/torcx".into(),
            run_dir: "/run/torcx".into(),
            usr_dir: "/usr".into(),
            conf_dir: "/etc/torcx".into(),
            oem_dir: "/usr/share/oem/torcx".into(),
            extra_store_paths: vec![],
            os_version_id: Some("1.2.3".to_string()),
            seal_path: "/run/metadata/torcx".into(),
        };
        let paths = p.store_paths();
        assert_eq!(
            paths,
            vec![
                Utf8PathBuf::from("/usr/share/torcx/store"),
                Utf8PathBuf::from("/usr/share/oem/torcx/store/1.2.3"),
                Utf8PathBuf::from("/usr/share/oem/torcx/store"),
                Utf8PathBuf::from("/var/lib/torcx/store/1.2.3"),
                Utf8PathBuf::from("/var/lib/torcx/store"),
            ]
        );
    }
}
