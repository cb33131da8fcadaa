//! The two mount operations the apply pipeline needs: binding the
//! persistent unpack directory onto its runtime mountpoint with slave
//! propagation, and remounting it read-only once sealed.

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use rustix::mount::{
    mount_bind_recursive, mount_change, mount_remount, MountFlags, MountPropagationFlags,
};

/// Bind-mounts `source` onto `target` (which must already exist) and
/// marks the new mount slave, so that later mounts inside `source` do
/// not leak back into the rest of the mount namespace.
#[context("Bind-mounting {source} onto {target}")]
pub(crate) fn bind_mount_slave(source: &Utf8Path, target: &Utf8Path) -> Result<()> {
    mount_bind_recursive(source.as_std_path(), target.as_std_path())
        .with_context(|| format!("bind-mounting {source} onto {target}"))?;
    mount_change(
        target.as_std_path(),
        MountPropagationFlags::SLAVE | MountPropagationFlags::REC,
    )
    .with_context(|| format!("marking {target} as a slave mount"))?;
    Ok(())
}

/// Remounts `target` (already mounted) read-only in place.
#[context("Remounting {target} read-only")]
pub(crate) fn remount_readonly(target: &Utf8Path) -> Result<()> {
    mount_remount(target.as_std_path(), MountFlags::BIND | MountFlags::RDONLY, "")
        .with_context(|| format!("remounting {target} read-only"))
}
