//! Typed error taxonomy for torcx's core operations.
//!
//! Most internal plumbing uses [`anyhow::Error`] with [`fn_error_context`]
//! for rich context chains, matching the rest of the crate. `TorcxError`
//! exists for the handful of conditions a caller (the CLI, or the
//! generator entry point) needs to distinguish programmatically -
//! these variants are the ones worth an exit-code or a retry decision,
//! not every failure mode in the crate.

use camino::Utf8PathBuf;

/// Errors that callers may want to match on, as opposed to the general
/// `anyhow::Error` chains used for internal plumbing.
#[derive(thiserror::Error, Debug)]
pub enum TorcxError {
    /// A `torcx.conf` or `/proc/cmdline` override was present but invalid.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A named profile does not exist in any profile directory.
    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    /// A referenced image was not found in any store path.
    #[error("image {name}:{reference} not found")]
    ImageNotFound {
        /// Image name.
        name: String,
        /// Image reference (version).
        reference: String,
    },

    /// `/usr/lib/os-release` does not carry a usable `VERSION_ID`.
    #[error("unable to determine os VERSION_ID")]
    UnknownOsVersionId,

    /// A manifest's `kind` tag was not recognized.
    #[error("unknown manifest kind: {0}")]
    UnknownProfileKind(String),

    /// A remote's clearsigned manifest did not verify against its
    /// configured keyring.
    #[error("signature verification failed for {0}")]
    SignatureVerificationFailed(Utf8PathBuf),

    /// A fetch failed in a way that is safe to retry (connection reset,
    /// timeout, 5xx).
    #[error("transient network error fetching {url}: {source}")]
    TransientNetwork {
        /// The URL being fetched.
        url: String,
        /// Underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// A downloaded archive's content hash did not match the manifest.
    #[error("hash mismatch for {name}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Image name, for diagnostics.
        name: String,
        /// Expected digest, as recorded in the image manifest.
        expected: String,
        /// Digest actually computed from the downloaded bytes.
        actual: String,
    },

    /// One or more images failed to apply; the orchestrator continues
    /// with the remainder and reports the aggregate at the end.
    #[error("apply incomplete: {0} image(s) failed")]
    IncompleteApply(usize),

    /// The seal file already exists and a second seal was attempted
    /// without `--force`.
    #[error("torcx state is already sealed at {0}")]
    AlreadySealed(Utf8PathBuf),

    /// `apply` was invoked but the run directory already carries a
    /// prior seal; used by the generator alias to short-circuit.
    #[error("torcx has already applied for this boot")]
    AlreadyApplied,

    /// An image manifest referenced an asset file that does not exist
    /// in the unpacked archive.
    #[error("missing asset {asset} declared by image {image}")]
    MissingAsset {
        /// Declaring image name.
        image: String,
        /// Asset path that was missing.
        asset: Utf8PathBuf,
    },

    /// A manifest file was present but failed to parse as JSON, or its
    /// `kind`/`value` shape did not match any known version.
    #[error("bad manifest {path}: {source}")]
    BadManifest {
        /// Path to the offending manifest.
        path: Utf8PathBuf,
        /// Underlying (de)serialization error.
        #[source]
        source: anyhow::Error,
    },
}
