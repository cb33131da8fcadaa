//! Downloads a single image archive, verifies its content hash, and
//! atomically installs it into a versioned store directory.

use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use futures_util::StreamExt;
use sha2::{Digest, Sha256, Sha512};
use tokio::io::AsyncWriteExt;

use crate::errors::TorcxError;
use crate::remote::Availability;

const RETRY_BACKOFF: Duration = Duration::from_secs(8);

/// Downloads the archive described by `availability` for `name:reference`
/// into `store_dir`, verifying its hash and installing it under its
/// canonical `<name>:<reference>.torcx.<ext>` name.
///
/// `file://` base URLs are a no-op: the archive is assumed pre-staged
/// in the store already.
#[context("Fetching {name}:{reference}")]
pub async fn fetch_image(
    base_url: &str,
    name: &str,
    reference: &str,
    availability: &Availability,
    store_dir: &Utf8Path,
    deadline: Duration,
) -> Result<Utf8PathBuf> {
    if base_url.starts_with("file://") {
        return Ok(resolve_location(base_url, &availability.location));
    }
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        bail!("unsupported remote scheme: {base_url}");
    }

    let url = resolve_url(base_url, &availability.location);
    let ext = if url.ends_with(".torcx.tgz") {
        "tgz"
    } else if url.ends_with(".torcx.squashfs") {
        "squashfs"
    } else {
        bail!("archive location {url} has an unrecognized suffix");
    };

    std::fs::create_dir_all(store_dir).with_context(|| format!("creating {store_dir}"))?;
    let tmp_path = store_dir.join(format!(".fetchimg{}", std::process::id()));
    let final_path = store_dir.join(format!("{name}:{reference}.torcx.{ext}"));

    let result = download_with_retry(&url, &tmp_path, deadline).await;
    if let Err(e) = &result {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(anyhow::anyhow!("{e}"));
    }

    std::fs::set_permissions(&tmp_path, Permissions::from_mode(0o755))
        .with_context(|| format!("chmod {tmp_path}"))?;

    if let Err(e) = verify_hash(&tmp_path, &availability.hash) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }

    std::fs::rename(&tmp_path, &final_path)
        .with_context(|| format!("renaming {tmp_path} to {final_path}"))?;
    Ok(final_path)
}

fn resolve_url(base_url: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        location.to_string()
    } else {
        format!("{}/{}", base_url.trim_end_matches('/'), location.trim_start_matches('/'))
    }
}

fn resolve_location(base_url: &str, location: &str) -> Utf8PathBuf {
    if let Some(path) = location.strip_prefix("file://") {
        return Utf8PathBuf::from(path);
    }
    let base = base_url.strip_prefix("file://").unwrap_or(base_url);
    Utf8PathBuf::from(base).join(location)
}

async fn download_with_retry(url: &str, dest: &Utf8Path, deadline: Duration) -> Result<()> {
    let client = reqwest::Client::new();
    let deadline_at = tokio::time::Instant::now() + deadline;
    loop {
        let remaining = deadline_at.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            bail!("deadline exceeded fetching {url}");
        }
        match try_download(&client, url, dest, remaining).await {
            Ok(()) => return Ok(()),
            Err(e) if e.transient => {
                tracing::warn!("transient error fetching {url}: {}, retrying", e.source);
            }
            Err(e) => {
                return Err(TorcxError::TransientNetwork {
                    url: url.to_string(),
                    source: e.source,
                }
                .into())
            }
        }
        tokio::time::sleep(RETRY_BACKOFF.min(remaining)).await;
    }
}

struct DownloadError {
    transient: bool,
    source: anyhow::Error,
}

async fn try_download(
    client: &reqwest::Client,
    url: &str,
    dest: &Utf8Path,
    timeout: Duration,
) -> std::result::Result<(), DownloadError> {
    let resp = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| DownloadError {
            transient: e.is_timeout() || e.is_connect(),
            source: e.into(),
        })?;
    if resp.status().is_server_error() {
        return Err(DownloadError {
            transient: true,
            source: anyhow::anyhow!("HTTP {}", resp.status()),
        });
    }
    if !resp.status().is_success() {
        return Err(DownloadError {
            transient: false,
            source: anyhow::anyhow!("HTTP {}", resp.status()),
        });
    }

    let mut file = tokio::fs::File::create(dest).await.map_err(|e| DownloadError {
        transient: false,
        source: e.into(),
    })?;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| DownloadError {
            transient: e.is_timeout(),
            source: e.into(),
        })?;
        file.write_all(&chunk).await.map_err(|e| DownloadError {
            transient: false,
            source: e.into(),
        })?;
    }
    file.flush().await.map_err(|e| DownloadError {
        transient: false,
        source: e.into(),
    })?;
    Ok(())
}

/// Validates that `path`'s content hash matches `declared`, a string
/// of the form `<algo>-<hex>` (e.g. `sha512-abcd...`).
fn verify_hash(path: &Utf8Path, declared: &str) -> Result<()> {
    let (algo, expected_hex) = declared
        .split_once('-')
        .with_context(|| format!("malformed hash spec {declared}"))?;
    let data = std::fs::read(path).with_context(|| format!("reading {path}"))?;
    let actual_hex = match algo {
        "sha256" => hex::encode(Sha256::digest(&data)),
        "sha512" => hex::encode(Sha512::digest(&data)),
        other => bail!("unsupported hash algorithm {other}"),
    };
    if actual_hex != expected_hex {
        return Err(TorcxError::HashMismatch {
            name: path.file_name().unwrap_or_default().to_string(),
            expected: format!("{algo}:{expected_hex}"),
            actual: format!("{algo}:{actual_hex}"),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_mismatch_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("a")).unwrap();
        std::fs::write(&path, b"hello world").unwrap();
        let digest = hex::encode(Sha256::digest(b"hello world"));
        assert!(verify_hash(&path, &format!("sha256-{digest}")).is_ok());
        assert!(verify_hash(&path, "sha256-deadbeef").is_err());
    }

    #[test]
    fn resolves_relative_location() {
        let url = resolve_url("https://example.com/store", "docker:1.12.torcx.tgz");
        assert_eq!(url, "https://example.com/store/docker:1.12.torcx.tgz");
    }

    #[test]
    fn resolves_absolute_location() {
        let url = resolve_url("https://example.com/store", "https://cdn.example.com/docker.tgz");
        assert_eq!(url, "https://cdn.example.com/docker.tgz");
    }
}
