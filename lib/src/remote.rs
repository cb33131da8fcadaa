//! Discovers remotes, evaluates their URL templates, and fetches and
//! verifies their signed contents manifests.

use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use sequoia_openpgp::cert::Cert;
use sequoia_openpgp::parse::stream::{
    GoodChecksum, MessageLayer, MessageStructure, VerificationHelper, VerifierBuilder,
};
use sequoia_openpgp::parse::Parse;
use sequoia_openpgp::policy::StandardPolicy;
use sequoia_openpgp::{Cert as OpenPgpCert, KeyHandle};

use crate::errors::TorcxError;
use crate::paths::{read_os_release, DEFAULT_TAG_REF};
use crate::types::{KindValue, RemoteContents, RemoteManifest, RemoteManifestV0, REMOTE_CONTENTS_V1_KIND};

const CONTENTS_FILENAME: &str = "torcx_remote_contents.json.asc";
const RETRY_BACKOFF: Duration = Duration::from_secs(8);
const CLEARSIGN_END_MARKER: &str = "-----END PGP SIGNATURE-----";

/// A discovered remote: its name, manifest, and base directory.
#[derive(Debug, Clone)]
pub struct Remote {
    /// Remote's logical name (the directory name under the base).
    pub name: String,
    /// Parsed `remote.json`.
    pub manifest: RemoteManifest,
}

/// Scans `remote_base` for `<name>/remote.json` files and keeps the
/// ones whose name is in `filter` (pass an empty filter to keep all).
#[context("Discovering remotes under {remote_base}")]
pub fn discover_remotes(remote_base: &Utf8Path, filter: &[String]) -> Result<Vec<Remote>> {
    let mut remotes = Vec::new();
    let entries = match fs::read_dir(remote_base) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(remotes),
        Err(e) => return Err(e).with_context(|| format!("reading {remote_base}")),
    };
    for entry in entries.flatten() {
        let Ok(dir) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        if !dir.is_dir() {
            continue;
        }
        let name = dir.file_name().unwrap_or_default().to_string();
        if !filter.is_empty() && !filter.contains(&name) {
            continue;
        }
        let manifest_path = dir.join("remote.json");
        let Ok(data) = fs::read_to_string(&manifest_path) else {
            continue;
        };
        let envelope: KindValue<RemoteManifestV0> =
            serde_json::from_str(&data).with_context(|| format!("parsing {manifest_path}"))?;
        if envelope.kind != "remote-manifest-v0" {
            return Err(TorcxError::UnknownProfileKind(envelope.kind).into());
        }
        remotes.push(Remote {
            name,
            manifest: RemoteManifest::from(envelope.value),
        });
    }
    Ok(remotes)
}

/// Substitutes `${VAR}` placeholders in `template` against `vars`.
/// `\$` and `\\` are recognized escapes. A placeholder naming a
/// variable absent from `vars` is an error.
pub fn evaluate_template(template: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('\\') => out.push('\\'),
                Some('$') => out.push('$'),
                Some(other) => bail!("invalid escape \\{other} in URL template"),
                None => bail!("trailing backslash in URL template"),
            },
            '$' if chars.peek() == Some(&'{') => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) if c.is_ascii_alphanumeric() || c == '_' || c == '-' => name.push(c),
                        Some(other) => bail!("invalid character {other:?} in template variable"),
                        None => bail!("unterminated ${{...}} in URL template"),
                    }
                }
                let value = vars
                    .get(&name)
                    .ok_or_else(|| anyhow!("undefined template variable ${{{name}}}"))?;
                out.push_str(value);
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Builds the variable map a remote's URL template may reference:
/// `ID`, `VERSION_ID`, `COREOS_BOARD` from the os-release file, plus
/// `COREOS_USR` pointing at the USR mountpoint.
pub fn template_vars(os_release_path: &Utf8Path, usr_dir: &Utf8Path) -> Result<BTreeMap<String, String>> {
    let mut vars = read_os_release(os_release_path)?;
    vars.insert("COREOS_USR".to_string(), usr_dir.to_string());
    Ok(vars)
}

/// Fetches and verifies a remote's contents manifest.
///
/// `base_url` is the already-templated remote base (e.g.
/// `https://example.com/torcx/1.2.3` or `file:///srv/torcx`).
pub async fn fetch_contents(remote: &Remote, base_url: &str, deadline: Duration) -> Result<RemoteContents> {
    let url = format!("{}/{}", base_url.trim_end_matches('/'), CONTENTS_FILENAME);
    let payload = fetch_text(&url, deadline).await?;
    let verified = verify_clearsign(&payload, &remote.manifest.armored_keys)?;
    let envelope: KindValue<RemoteContents> =
        serde_json::from_str(&verified).with_context(|| format!("parsing contents from {url}"))?;
    if envelope.kind != REMOTE_CONTENTS_V1_KIND {
        return Err(TorcxError::UnknownProfileKind(envelope.kind).into());
    }
    Ok(envelope.value)
}

async fn fetch_text(url: &str, deadline: Duration) -> Result<String> {
    if let Some(path) = url.strip_prefix("file://") {
        return fs::read_to_string(path).with_context(|| format!("reading {path}"));
    }
    if !url.starts_with("https://") && !url.starts_with("http://") {
        bail!("unsupported scheme in remote URL: {url}");
    }
    let client = reqwest::Client::new();
    let deadline_at = tokio::time::Instant::now() + deadline;
    loop {
        let remaining = deadline_at.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            bail!("deadline exceeded fetching {url}");
        }
        let attempt = client.get(url).timeout(remaining).send().await;
        match attempt {
            Ok(resp) if resp.status().is_success() => {
                return resp.text().await.with_context(|| format!("reading body of {url}"));
            }
            Ok(resp) if resp.status().is_server_error() => {
                tracing::warn!("transient {} fetching {url}, retrying", resp.status());
            }
            Ok(resp) => bail!("fetching {url}: HTTP {}", resp.status()),
            Err(e) if e.is_timeout() || e.is_connect() => {
                tracing::warn!("transient network error fetching {url}: {e}, retrying");
            }
            Err(e) => {
                return Err(TorcxError::TransientNetwork {
                    url: url.to_string(),
                    source: e.into(),
                }
                .into())
            }
        }
        tokio::time::sleep(RETRY_BACKOFF.min(remaining)).await;
    }
}

struct KeyringHelper<'a> {
    certs: &'a [Cert],
}

impl<'a> VerificationHelper for KeyringHelper<'a> {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> sequoia_openpgp::Result<Vec<OpenPgpCert>> {
        Ok(self.certs.to_vec())
    }

    fn check(&mut self, structure: MessageStructure) -> sequoia_openpgp::Result<()> {
        for layer in structure.into_iter() {
            if let MessageLayer::SignatureGroup { results } = layer {
                if results.into_iter().any(|r| matches!(r, Ok(GoodChecksum { .. }))) {
                    return Ok(());
                }
            }
        }
        Err(anyhow!("no valid signature found").into())
    }
}

/// Verifies `payload` is a PGP clearsigned block and checks its
/// signature against each of `armored_keys` until one verifies.
/// Trailing bytes after the signed block are rejected. With no keys
/// configured, the payload is accepted unverified (with a warning).
fn verify_clearsign(payload: &str, armored_keys: &[String]) -> Result<String> {
    if armored_keys.is_empty() {
        tracing::warn!("no keyrings configured, accepting remote contents unverified");
        return Ok(payload.to_string());
    }
    reject_trailing_bytes(payload)?;
    let policy = StandardPolicy::new();
    let mut last_err = None;
    for armored in armored_keys {
        let cert = match Cert::from_bytes(armored.as_bytes()) {
            Ok(c) => c,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };
        let helper = KeyringHelper { certs: &[cert] };
        let mut verifier = match VerifierBuilder::from_bytes(payload.as_bytes())
            .and_then(|b| b.with_policy(&policy, None, helper))
        {
            Ok(v) => v,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };
        let mut out = Vec::new();
        if std::io::copy(&mut verifier, &mut out).is_ok() {
            if let Ok(s) = String::from_utf8(out) {
                return Ok(s);
            }
        }
    }
    let _ = last_err;
    Err(TorcxError::SignatureVerificationFailed(Utf8PathBuf::from(CONTENTS_FILENAME)).into())
}

/// Rejects any bytes following the clearsigned block's closing
/// `-----END PGP SIGNATURE-----` line, per §4.4's "trailing bytes after
/// the signed block are fatal".
fn reject_trailing_bytes(payload: &str) -> Result<()> {
    if !payload.trim_end().ends_with(CLEARSIGN_END_MARKER) {
        bail!("trailing bytes after PGP clearsigned block");
    }
    Ok(())
}

/// The result of checking whether an image is available from a
/// remote: its base URL, the (possibly relative) archive location,
/// and the expected algo-prefixed hash.
#[derive(Debug, Clone)]
pub struct Availability {
    /// Archive location, absolute or relative to the remote's base URL.
    pub location: String,
    /// Expected hash, e.g. `sha512-<hex>` as declared by the remote.
    pub hash: String,
}

/// Looks up `name`/`reference` in `contents`, resolving
/// [`DEFAULT_TAG_REF`] to the image's declared default version.
pub fn check_available(contents: &RemoteContents, name: &str, reference: &str) -> Result<Availability> {
    let group = contents
        .images
        .iter()
        .find(|i| i.name == name)
        .ok_or_else(|| anyhow!("remote has no image named {name}"))?;
    let wanted = if reference == DEFAULT_TAG_REF {
        group.default_version.as_str()
    } else {
        reference
    };
    let found = group
        .versions
        .iter()
        .find(|v| v.version == wanted)
        .ok_or_else(|| anyhow!("remote has no version {wanted} of image {name}"))?;
    Ok(Availability {
        location: found.location.clone(),
        hash: found.hash.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_substitution() {
        let mut vars = BTreeMap::new();
        vars.insert("ID".to_string(), "coreos".to_string());
        vars.insert("VERSION_ID".to_string(), "1.2.3".to_string());
        let out = evaluate_template("https://example.com/${ID}/${VERSION_ID}/", &vars).unwrap();
        assert_eq!(out, "https://example.com/coreos/1.2.3/");
    }

    #[test]
    fn template_escapes() {
        let vars = BTreeMap::new();
        let out = evaluate_template(r"literal \$\{not a var\}", &vars).unwrap();
        assert_eq!(out, "literal ${not a var}");
    }

    #[test]
    fn template_missing_var_errors() {
        let vars = BTreeMap::new();
        assert!(evaluate_template("${MISSING}", &vars).is_err());
    }

    #[test]
    fn unverified_without_keys() {
        let out = verify_clearsign("plain json", &[]).unwrap();
        assert_eq!(out, "plain json");
    }

    #[test]
    fn trailing_bytes_after_clearsign_block_rejected() {
        let payload = format!("-----BEGIN PGP SIGNED MESSAGE-----\nx\n{CLEARSIGN_END_MARKER}\ntrailing garbage\n");
        let err = verify_clearsign(&payload, &["not a real keyring".to_string()]).unwrap_err();
        assert!(err.to_string().contains("trailing bytes"));
    }

    #[test]
    fn well_formed_clearsign_shape_passes_trailing_bytes_check() {
        let payload = format!("-----BEGIN PGP SIGNED MESSAGE-----\nx\n{CLEARSIGN_END_MARKER}\n");
        assert!(reject_trailing_bytes(&payload).is_ok());
    }
}
