//! Command-line interface: argument parsing and subcommand dispatch.
//!
//! Mirrors the binary's argv0 dispatch trick: when invoked as
//! [`GENERATOR_BIN`], the arguments are rewritten to the hidden
//! `torcx-generator` subcommand before clap ever sees them, so a
//! systemd generator drop-in can exec this same binary under an alias
//! and get exactly `apply`'s behavior.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use fn_error_context::context;
use serde::Serialize;

use crate::apply::{self, ApplyOutcome, ProfileSelection};
use crate::errors::TorcxError;
use crate::fetch;
use crate::paths::{Paths, VENDOR_PROFILE_NAME};
use crate::profile::{self, ProfileVersion};
use crate::remote::{self, Remote};
use crate::seal;
use crate::store::{self, StoreCache};
use crate::types::{Profile, ProfileImage, RemoteContents};

include!(concat!(env!("OUT_DIR"), "/version.rs"));

/// Basename under which invoking this binary is equivalent to `apply`,
/// as registered in a systemd generator drop-in.
const GENERATOR_BIN: &str = "torcx-generator";
/// How long `profile populate` waits for every remote fetch to finish.
const POPULATE_DEADLINE: Duration = Duration::from_secs(60);
/// CLI-output-only kind for `image list`'s JSON envelope.
const IMAGE_LIST_KIND: &str = "torcx-image-list-v0";
/// CLI-output-only kind for `profile list`'s JSON envelope.
const PROFILE_LIST_KIND: &str = "torcx-profile-list-v0";
/// The `os-release` file apply and populate read the running `VERSION_ID` from.
const OS_RELEASE_PATH: &str = "/usr/lib/os-release";

/// torcx: compose boot-time addons onto an immutable root filesystem.
#[derive(Debug, Parser)]
#[clap(name = "torcx")]
#[clap(version, long_version = CLAP_LONG_VERSION)]
pub struct Opt {
    /// Increase logging verbosity; repeat for more (`-v` info, `-vv`
    /// debug). Ignored when `RUST_LOG` is set.
    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
enum Command {
    /// Apply the configured profile and seal the runtime state for this boot.
    Apply,
    /// Operate on images across the layered store.
    #[clap(subcommand)]
    Image(ImageCommand),
    /// Operate on profiles.
    #[clap(subcommand)]
    Profile(ProfileCommand),
    /// Equivalent to `apply`; invoked under this name by a systemd generator.
    #[clap(hide = true)]
    TorcxGenerator,
    /// Render man pages into a directory.
    #[cfg(feature = "docgen")]
    #[clap(hide = true)]
    Man(ManOpts),
}

/// Options for man page generation.
#[cfg(feature = "docgen")]
#[derive(Debug, Parser, PartialEq, Eq)]
struct ManOpts {
    /// Output directory.
    #[clap(long)]
    directory: Utf8PathBuf,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
enum ImageCommand {
    /// List every image and reference visible across the store.
    List {
        /// Only list this image's references.
        iname: Option<String>,
        /// Pretend the running OS is this `VERSION_ID` when resolving
        /// versioned store paths.
        #[clap(long = "os-release", short = 'n')]
        os_release: Option<String>,
    },
    /// Remove versioned store entries other than the given versions.
    ClearVersioned {
        /// Store version to keep; repeatable. At least one is required.
        #[clap(long = "keep-version", short = 'k')]
        keep_version: Vec<String>,
        /// Only clear this image name, leaving other images' archives
        /// under the removed versions in place.
        iname: Option<String>,
    },
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
enum ProfileCommand {
    /// List known profiles and the current/next selection.
    List,
    /// Verify that every image a profile references exists in the store.
    Check {
        /// Profile name; defaults to the next profile (or vendor).
        #[clap(long)]
        name: Option<String>,
        /// Profile file path, overriding `--name` lookup.
        #[clap(long)]
        file: Option<Utf8PathBuf>,
        /// Pretend the running OS is this `VERSION_ID`.
        #[clap(long = "os-release", short = 'n')]
        os_release: Option<String>,
    },
    /// Fetch every remote image a profile references into the local store.
    Populate {
        /// Profile name; defaults to the next profile (or vendor).
        #[clap(long)]
        name: Option<String>,
        /// Profile file path, overriding `--name` lookup.
        #[clap(long)]
        file: Option<Utf8PathBuf>,
        /// Pretend the running OS is this `VERSION_ID`.
        #[clap(long = "os-release", short = 'n')]
        os_release: Option<String>,
    },
    /// Create a new, user-writable profile.
    New {
        /// Name of the profile to create.
        name: String,
        /// Duplicate this existing profile's contents.
        #[clap(long, conflicts_with = "from_next")]
        from: Option<String>,
        /// Duplicate whichever profile is currently marked next.
        #[clap(long = "from-next", conflicts_with = "from")]
        from_next: bool,
    },
    /// Add or replace an image entry in a profile.
    UseImage {
        /// Image to add, as `NAME:REFERENCE`.
        image: String,
        /// Profile name; defaults to the next profile (or vendor).
        #[clap(long)]
        name: Option<String>,
        /// Profile file path, overriding `--name` lookup.
        #[clap(long)]
        file: Option<Utf8PathBuf>,
        /// Allow referencing an image absent from the local store, e.g.
        /// `--allow=missing`.
        #[clap(long)]
        allow: Option<String>,
    },
    /// Mark a profile to be applied on the next boot.
    SetNext {
        /// Profile name; must already exist.
        name: String,
    },
}

/// Parses `args`, rewriting them first if argv0 names the generator
/// alias, initializes tracing at the requested verbosity, then runs.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let opt = Opt::parse_including_static(args);
    torcx_utils::initialize_tracing_with_verbosity(opt.verbose);
    run_from_opt(opt).await
}

impl Opt {
    /// Rewrites argv when invoked as [`GENERATOR_BIN`], so clap always
    /// sees the hidden `torcx-generator` subcommand regardless of how
    /// the binary was actually exec'd.
    fn parse_including_static<I>(args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<OsString> + Clone,
    {
        let mut args = args.into_iter();
        let first = args.next().map(Into::into);
        let argv0 = first.as_ref().and_then(|f| f.to_str()).map(|s| match s.rsplit_once('/') {
            Some((_, base)) => base,
            None => s,
        });
        if argv0 == Some(GENERATOR_BIN) {
            let rewritten = ["torcx", "torcx-generator"].into_iter().map(OsString::from);
            return Opt::parse_from(rewritten.chain(args.map(Into::into)));
        }
        Opt::parse_from(first.into_iter().chain(args.map(Into::into)))
    }
}

async fn run_from_opt(opt: Opt) -> Result<()> {
    match opt.command {
        Command::Apply | Command::TorcxGenerator => cmd_apply().await,
        Command::Image(command) => cmd_image(command),
        Command::Profile(command) => cmd_profile(command).await,
        #[cfg(feature = "docgen")]
        Command::Man(opts) => crate::docgen::generate_manpages(&opts.directory),
    }
}

/// Implementation of the `torcx apply` (and `torcx-generator`) command.
#[context("Applying torcx profile")]
async fn cmd_apply() -> Result<()> {
    let paths = Paths::load()?;
    let selection = ProfileSelection::default_for(&paths);
    match apply::apply(&paths, &selection)? {
        ApplyOutcome::AlreadyApplied => {
            tracing::info!("torcx already applied for this boot");
        }
        ApplyOutcome::Applied { images } => {
            tracing::info!("applied {} image(s)", images.len());
        }
    }
    Ok(())
}

fn cmd_image(command: ImageCommand) -> Result<()> {
    let paths = Paths::load()?;
    match command {
        ImageCommand::List { iname, os_release } => {
            cmd_image_list(&paths, iname.as_deref(), os_release.as_deref())
        }
        ImageCommand::ClearVersioned { keep_version, iname } => {
            cmd_image_clear_versioned(&paths, &keep_version, iname.as_deref())
        }
    }
}

fn cmd_image_list(paths: &Paths, iname: Option<&str>, os_release: Option<&str>) -> Result<()> {
    let store_dirs = store::filter_store_versions(paths.store_paths(), paths, os_release);
    let cache = StoreCache::build(&store_dirs)?;

    #[derive(Serialize)]
    struct ImageEntry {
        name: String,
        reference: String,
        filepath: Utf8PathBuf,
    }

    let mut images: Vec<ImageEntry> = cache
        .archives()
        .filter(|a| iname.map(|n| n == a.name).unwrap_or(true))
        .map(|a| ImageEntry {
            name: a.name.clone(),
            reference: a.reference.clone(),
            filepath: a.path.clone(),
        })
        .collect();
    images.sort_by(|a, b| (a.name.as_str(), a.reference.as_str()).cmp(&(b.name.as_str(), b.reference.as_str())));

    print_kind_value(IMAGE_LIST_KIND, &images)
}

#[context("Clearing versioned store entries")]
fn cmd_image_clear_versioned(paths: &Paths, keep_versions: &[String], iname: Option<&str>) -> Result<()> {
    if keep_versions.is_empty() {
        bail!("at least one --keep-version is required");
    }
    let removed = store::clear_versioned(&paths.base_dir, keep_versions, iname)?;
    tracing::info!(
        "removed {removed} entr{} from versioned stores",
        if removed == 1 { "y" } else { "ies" }
    );
    Ok(())
}

async fn cmd_profile(command: ProfileCommand) -> Result<()> {
    let paths = Paths::load()?;
    match command {
        ProfileCommand::List => cmd_profile_list(&paths),
        ProfileCommand::Check { name, file, os_release } => {
            cmd_profile_check(&paths, name.as_deref(), file.as_deref(), os_release.as_deref())
        }
        ProfileCommand::Populate { name, file, os_release } => {
            cmd_profile_populate(&paths, name.as_deref(), file.as_deref(), os_release.as_deref()).await
        }
        ProfileCommand::New { name, from, from_next } => cmd_profile_new(&paths, &name, from.as_deref(), from_next),
        ProfileCommand::UseImage { image, name, file, allow } => {
            cmd_profile_use_image(&paths, &image, name.as_deref(), file.as_deref(), allow.as_deref())
        }
        ProfileCommand::SetNext { name } => cmd_profile_set_next(&paths, &name),
    }
}

fn cmd_profile_list(paths: &Paths) -> Result<()> {
    let (lower_profile_names, user_profile_name, current_profile_path) = if seal::is_sealed(&paths.seal_path) {
        let kv = seal::read_seal(&paths.seal_path)?;
        let lower = kv
            .get("TORCX_LOWER_PROFILES")
            .map(|s| s.split(':').filter(|p| !p.is_empty()).map(String::from).collect())
            .unwrap_or_default();
        let upper = kv.get("TORCX_UPPER_PROFILE").filter(|s| !s.is_empty()).cloned();
        let path = kv.get("TORCX_PROFILE_PATH").filter(|s| !s.is_empty()).map(Utf8PathBuf::from);
        (lower, upper, path)
    } else {
        (Vec::new(), None, None)
    };
    let next_profile_name = paths.read_next_profile_name();
    let profiles: Vec<String> = profile::list_profiles(&paths.profile_dirs()).into_keys().collect();

    #[derive(Serialize)]
    struct ProfileListValue {
        lower_profile_names: Vec<String>,
        user_profile_name: Option<String>,
        current_profile_path: Option<Utf8PathBuf>,
        next_profile_name: Option<String>,
        profiles: Vec<String>,
    }

    print_kind_value(
        PROFILE_LIST_KIND,
        &ProfileListValue {
            lower_profile_names,
            user_profile_name,
            current_profile_path,
            next_profile_name,
            profiles,
        },
    )
}

/// Resolves `--name`/`--file` to a profile path on disk, defaulting to
/// the next profile (or vendor, with a warning) when neither is given.
fn resolve_named_profile_path(paths: &Paths, name: Option<&str>, file: Option<&Utf8Path>) -> Result<Utf8PathBuf> {
    if let Some(file) = file {
        return Ok(file.to_owned());
    }
    let name = name.map(str::to_string).unwrap_or_else(|| default_profile_name(paths));
    profile::list_profiles(&paths.profile_dirs())
        .get(&name)
        .cloned()
        .ok_or_else(|| TorcxError::ProfileNotFound(name).into())
}

fn default_profile_name(paths: &Paths) -> String {
    let name = paths.read_next_profile_name().unwrap_or_else(|| VENDOR_PROFILE_NAME.to_string());
    if name == VENDOR_PROFILE_NAME {
        tracing::warn!("no next profile configured, falling back to {VENDOR_PROFILE_NAME}");
    } else {
        tracing::debug!("using next profile {name:?}");
    }
    name
}

fn cmd_profile_check(paths: &Paths, name: Option<&str>, file: Option<&Utf8Path>, os_release: Option<&str>) -> Result<()> {
    let path = resolve_named_profile_path(paths, name, file)?;
    let profile = profile::read_profile(&path)?;
    if profile.images.is_empty() {
        tracing::warn!("profile {path} specifies no images");
        return Ok(());
    }

    let store_dirs = store::filter_store_versions(paths.store_paths(), paths, os_release);
    let store = StoreCache::build(&store_dirs)?;
    let mut missing = 0usize;
    for image in &profile.images {
        match store.archive_for(image) {
            Ok(archive) => tracing::debug!("{}:{} found at {}", image.name, image.reference, archive.path),
            Err(_) => {
                tracing::error!("{}:{} not found in any store", image.name, image.reference);
                missing += 1;
            }
        }
    }
    if missing > 0 {
        bail!("{missing} image(s) declared by {path} are not available locally");
    }
    Ok(())
}

async fn cmd_profile_populate(
    paths: &Paths,
    name: Option<&str>,
    file: Option<&Utf8Path>,
    os_release: Option<&str>,
) -> Result<()> {
    let path = resolve_named_profile_path(paths, name, file)?;
    let profile = profile::read_profile(&path)?;
    if profile.images.is_empty() {
        tracing::warn!("profile {path} specifies no images");
        return Ok(());
    }

    let store_dirs = store::filter_store_versions(paths.store_paths(), paths, os_release);
    let store = StoreCache::build(&store_dirs)?;

    let mut needed_remotes: Vec<String> = Vec::new();
    for image in &profile.images {
        if store.archive_for(image).is_err() {
            if let Some(remote_name) = &image.remote {
                if !needed_remotes.contains(remote_name) {
                    needed_remotes.push(remote_name.clone());
                }
            }
        }
    }
    if needed_remotes.is_empty() {
        tracing::info!("every image in {path} is already in the local store");
        return Ok(());
    }

    let remotes = discover_layered_remotes(paths, &needed_remotes)?;
    let vars = remote::template_vars(Utf8Path::new(OS_RELEASE_PATH), &paths.usr_dir)?;

    let mut contents: BTreeMap<String, (String, RemoteContents)> = BTreeMap::new();
    for remote_name in &needed_remotes {
        let remote = remotes
            .get(remote_name)
            .ok_or_else(|| anyhow::anyhow!("remote {remote_name} referenced by {path} was not found"))?;
        let base_url = remote::evaluate_template(&remote.manifest.template_url, &vars)?;
        let fetched = remote::fetch_contents(remote, &base_url, POPULATE_DEADLINE).await?;
        contents.insert(remote_name.clone(), (base_url, fetched));
    }

    let versioned_store_dir = match paths.os_version_id.as_deref() {
        Some(version) => paths.base_dir.join("store").join(version),
        None => paths.base_dir.join("store"),
    };

    let mut local = 0usize;
    let mut fetched_count = 0usize;
    for image in &profile.images {
        if store.archive_for(image).is_ok() {
            local += 1;
            continue;
        }
        let remote_name = image.remote.as_deref().ok_or_else(|| {
            anyhow::anyhow!("{}:{} is not in the store and names no remote", image.name, image.reference)
        })?;
        let (base_url, remote_contents) = contents
            .get(remote_name)
            .ok_or_else(|| anyhow::anyhow!("remote {remote_name} was not fetched"))?;
        let availability = remote::check_available(remote_contents, &image.name, &image.reference)?;

        if paths.check_remote_only() {
            tracing::info!(
                "{}:{} is available from {remote_name}, skipping fetch (TORCX_CHECK_REMOTE_ONLY)",
                image.name,
                image.reference
            );
            continue;
        }

        fetch::fetch_image(
            base_url,
            &image.name,
            &image.reference,
            &availability,
            &versioned_store_dir,
            POPULATE_DEADLINE,
        )
        .await?;
        fetched_count += 1;
    }

    tracing::info!("{path}: {local} image(s) already local, {fetched_count} fetched");
    Ok(())
}

/// Discovers `names` across the vendor/OEM/user remote directories,
/// keeping the first (highest-precedence) definition of each name.
fn discover_layered_remotes(paths: &Paths, names: &[String]) -> Result<BTreeMap<String, Remote>> {
    let mut found = BTreeMap::new();
    for dir in paths.remote_dirs() {
        for remote in remote::discover_remotes(&dir, names)? {
            found.entry(remote.name.clone()).or_insert(remote);
        }
    }
    Ok(found)
}

fn cmd_profile_new(paths: &Paths, name: &str, from: Option<&str>, from_next: bool) -> Result<()> {
    let existing = profile::list_profiles(&paths.profile_dirs());
    if existing.contains_key(name) {
        bail!("profile {name} already exists");
    }

    let dest = paths.user_profile_dir().join(format!("{name}.json"));
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {parent}"))?;
    }

    let source_name = if from_next {
        Some(paths.read_next_profile_name().context("no next profile is configured")?)
    } else {
        from.map(str::to_string)
    };

    match source_name {
        Some(source_name) => {
            let source_path = existing
                .get(&source_name)
                .ok_or_else(|| anyhow::anyhow!("profile {source_name} not found"))?;
            std::fs::copy(source_path, &dest).with_context(|| format!("copying {source_path} to {dest}"))?;
        }
        None => {
            let rendered = profile::write_profile_string(&Profile::default(), ProfileVersion::V0)?;
            std::fs::write(&dest, rendered).with_context(|| format!("writing {dest}"))?;
        }
    }

    println!("created {dest}");
    Ok(())
}

fn cmd_profile_use_image(
    paths: &Paths,
    image_ref: &str,
    name: Option<&str>,
    file: Option<&Utf8Path>,
    allow: Option<&str>,
) -> Result<()> {
    let (image_name, reference) = image_ref
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("image must be given as NAME:REFERENCE, got {image_ref:?}"))?;

    if allow != Some("missing") {
        let store = StoreCache::build(&paths.store_paths())?;
        let probe = ProfileImage {
            name: image_name.to_string(),
            reference: reference.to_string(),
            remote: None,
        };
        if store.archive_for(&probe).is_err() {
            bail!("{image_name}:{reference} was not found in the store; pass --allow=missing to add it anyway");
        }
    }

    let path = match file {
        Some(file) => file.to_owned(),
        None => {
            let name = name.map(str::to_string).unwrap_or_else(|| default_profile_name(paths));
            match profile::list_profiles(&paths.profile_dirs()).get(&name) {
                Some(path) => path.clone(),
                None => paths.user_profile_dir().join(format!("{name}.json")),
            }
        }
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {parent}"))?;
    }

    profile::add_to_profile(
        &path,
        ProfileImage {
            name: image_name.to_string(),
            reference: reference.to_string(),
            remote: None,
        },
    )
}

fn cmd_profile_set_next(paths: &Paths, name: &str) -> Result<()> {
    if !profile::list_profiles(&paths.profile_dirs()).contains_key(name) {
        bail!("profile {name} does not exist");
    }
    let path = paths.next_profile_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {parent}"))?;
    }
    std::fs::write(&path, name).with_context(|| format!("writing {path}"))
}

fn print_kind_value<T: Serialize>(kind: &str, value: &T) -> Result<()> {
    #[derive(Serialize)]
    struct Envelope<'a, T> {
        kind: &'a str,
        value: &'a T,
    }
    println!("{}", serde_json::to_string_pretty(&Envelope { kind, value })?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_profile_list() {
        let opt = Opt::parse_including_static(["torcx", "profile", "list"]);
        assert_eq!(opt.verbose, 0);
        assert_eq!(opt.command, Command::Profile(ProfileCommand::List));
    }

    #[test]
    fn parses_repeated_verbose() {
        let opt = Opt::parse_including_static(["torcx", "-vv", "apply"]);
        assert_eq!(opt.verbose, 2);
        assert_eq!(opt.command, Command::Apply);
    }

    #[test]
    fn generator_argv0_dispatches_to_torcx_generator() {
        let opt = Opt::parse_including_static(["/usr/lib/systemd/system-generators/torcx-generator"]);
        assert_eq!(opt.command, Command::TorcxGenerator);
    }

    #[test]
    fn use_image_arg_preserves_embedded_colons() {
        let opt = Opt::parse_including_static(["torcx", "profile", "use-image", "registry:5000/docker:17.06"]);
        match opt.command {
            Command::Profile(ProfileCommand::UseImage { image, .. }) => {
                assert_eq!(image, "registry:5000/docker:17.06");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn use_image_splits_name_on_last_colon_only() {
        let dir = tempfile::tempdir().unwrap();
        let base_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let paths = Paths {
            base_dir,
            run_dir: "/run/torcx".into(),
            usr_dir: "/usr".into(),
            conf_dir: "/etc/torcx".into(),
            oem_dir: "/usr/share/oem/torcx".into(),
            extra_store_paths: vec![],
            os_version_id: None,
            seal_path: "/run/metadata/torcx".into(),
        };
        let dest = paths.base_dir.join("profile.json");
        cmd_profile_use_image(
            &paths,
            "registry:5000/docker:17.06",
            None,
            Some(&dest),
            Some("missing"),
        )
        .unwrap();

        let written = std::fs::read_to_string(&dest).unwrap();
        assert!(written.contains("\"name\": \"registry:5000/docker\""));
        assert!(written.contains("\"reference\": \"17.06\""));
        assert!(!written.contains("\"name\": \"registry\""));
    }

    #[test]
    fn clear_versioned_requires_keep_version() {
        let dir = tempfile::tempdir().unwrap();
        let base_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let paths = Paths {
            base_dir,
            run_dir: "/run/torcx".into(),
            usr_dir: "/usr".into(),
            conf_dir: "/etc/torcx".into(),
            oem_dir: "/usr/share/oem/torcx".into(),
            extra_store_paths: vec![],
            os_version_id: None,
            seal_path: "/run/metadata/torcx".into(),
        };
        assert!(cmd_image_clear_versioned(&paths, &[], None).is_err());
    }
}
