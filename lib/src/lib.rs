//! # torcx
//!
//! torcx composes boot-time addons ("images") onto an otherwise
//! immutable root filesystem. It reads a profile naming a set of
//! images, unpacks their archives from a local store or a remote
//! cache, and propagates the resulting binaries, systemd units, and
//! related assets into well-known runtime directories before sealing
//! the applied state into `/run`.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

pub mod cli;
mod errors;
mod apply;
mod extract;
mod fetch;
mod journal;
mod mount;
mod paths;
mod profile;
mod propagate;
mod remote;
mod seal;
mod store;
mod task;
mod types;

#[cfg(feature = "docgen")]
mod docgen;

pub use errors::TorcxError;
