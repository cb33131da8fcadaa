//! Writes and reads the seal file marking a completed apply, and
//! remounts the unpack tree read-only once it is written.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use libsystemd::logging::Priority;

use crate::errors::TorcxError;
use crate::journal;
use crate::mount;
use crate::paths::parse_kv_file;

/// The fields recorded in the seal file, mirroring the environment
/// variables a consumer (e.g. a profile-aware unit) would expect.
#[derive(Debug, Clone)]
pub struct SealInfo<'a> {
    /// Lower profile names, in merge order, colon-separated on disk.
    pub lower_profiles: &'a [String],
    /// Upper profile name, if one was applied.
    pub upper_profile: Option<&'a str>,
    /// Path the merged profile was persisted to.
    pub profile_path: &'a Utf8Path,
    /// Runtime bin directory exposed on `PATH`.
    pub bin_dir: &'a Utf8Path,
    /// Runtime unpack directory.
    pub unpack_dir: &'a Utf8Path,
}

/// Writes the seal file at `seal_path` and remounts `unpack_dir`
/// read-only. Returns [`TorcxError::AlreadySealed`] if a seal file is
/// already present.
#[context("Sealing torcx state at {seal_path}")]
pub fn seal(seal_path: &Utf8Path, unpack_dir: &Utf8Path, info: &SealInfo<'_>) -> Result<()> {
    if seal_path.exists() {
        return Err(TorcxError::AlreadySealed(seal_path.to_owned()).into());
    }
    if let Some(parent) = seal_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {parent}"))?;
    }

    let mut content = String::new();
    content.push_str(&format!(
        "TORCX_LOWER_PROFILES=\"{}\"\n",
        info.lower_profiles.join(":")
    ));
    content.push_str(&format!(
        "TORCX_UPPER_PROFILE=\"{}\"\n",
        info.upper_profile.unwrap_or("")
    ));
    content.push_str(&format!("TORCX_PROFILE_PATH=\"{}\"\n", info.profile_path));
    content.push_str(&format!("TORCX_BINDIR=\"{}\"\n", info.bin_dir));
    content.push_str(&format!("TORCX_UNPACKDIR=\"{}\"\n", info.unpack_dir));

    let mut file = File::create(seal_path).with_context(|| format!("creating {seal_path}"))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("writing {seal_path}"))?;
    file.sync_all().with_context(|| format!("syncing {seal_path}"))?;

    mount::remount_readonly(unpack_dir)?;

    journal::journal_send(
        Priority::Info,
        "torcx state sealed",
        [("TORCX_PROFILE_PATH", info.profile_path.as_str())].into_iter(),
    );
    Ok(())
}

/// Whether `seal_path` already marks a completed apply for this boot.
pub fn is_sealed(seal_path: &Utf8Path) -> bool {
    seal_path.exists()
}

/// Reads back the seal file's key/value pairs, e.g. for
/// `torcx-generator`'s no-op short-circuit or diagnostics.
pub fn read_seal(seal_path: &Utf8Path) -> Result<BTreeMap<String, String>> {
    let content = fs::read_to_string(seal_path).with_context(|| format!("reading {seal_path}"))?;
    Ok(parse_kv_file(&content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn rejects_double_seal() {
        let dir = tempfile::tempdir().unwrap();
        let seal_path = Utf8PathBuf::from_path_buf(dir.path().join("sealed")).unwrap();
        fs::write(&seal_path, "TORCX_PROFILE_PATH=\"x\"\n").unwrap();
        assert!(is_sealed(&seal_path));
    }

    #[test]
    fn reads_back_seal_fields() {
        let dir = tempfile::tempdir().unwrap();
        let seal_path = Utf8PathBuf::from_path_buf(dir.path().join("sealed")).unwrap();
        fs::write(
            &seal_path,
            "TORCX_LOWER_PROFILES=\"vendor:oem\"\nTORCX_UPPER_PROFILE=\"\"\n",
        )
        .unwrap();
        let kv = read_seal(&seal_path).unwrap();
        assert_eq!(kv.get("TORCX_LOWER_PROFILES").unwrap(), "vendor:oem");
    }
}
