use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::mount::{mount, MsFlags};
use nix::unistd::{chdir, chroot};

use crate::{is_readonly, Error, LaunchConfig};

/// Host directory with the read-only device template and the empty anchor
/// mountpoint, baked in at build time like the install prefix.
pub const ROOTOVERLAY: &str = match option_env!("ROOTOVERLAY") {
    Some(v) => v,
    None => "/usr/lib/selfdock",
};

pub fn bind_rw(src: &Path, dst: &Path) -> Result<(), Error> {
    Ok(mount(
        Some(src),
        dst,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|v| format!("bindmount «{}» → «{}»: {v}", src.display(), dst.display()))?)
}

/// Bind mounts `src` onto `dst` and remounts the bind read-only.
/// The result is verified: the kernel silently accepted some older requests.
pub fn bind_ro(src: &Path, dst: &Path) -> Result<(), Error> {
    bind_rw(src, dst)?;
    mount(
        None::<&str>,
        dst,
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|v| format!("remount,bind,ro {}: {v}", dst.display()))?;
    if !is_readonly(dst) {
        return Err(format!(
            "remount,bind,ro {}: Still not readonly! This is supported from Linux 2.6.26, see mount(2).",
            dst.display()
        )
        .into());
    }
    Ok(())
}

/// Mounts a fresh tmpfs at `dst`, world-writable so the in-container user
/// may use it.
pub fn tmpfs_at(dst: &Path, options: &str) -> Result<(), Error> {
    mount(
        Some("none"),
        dst,
        Some("tmpfs"),
        MsFlags::MS_NOEXEC,
        Some(options),
    )
    .map_err(|v| format!("{}: {v}", dst.display()))?;
    std::fs::set_permissions(dst, Permissions::from_mode(0o777))
        .map_err(|v| format!("{}: {v}", dst.display()))?;
    Ok(())
}

/// Reverts `/` to private recursive propagation, so nothing mounted in this
/// namespace leaks back to the host. Must run first in a new mount namespace.
pub fn make_rprivate_root() -> Result<(), Error> {
    Ok(mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|v| format!("Failed to mark all mounts private: {v}"))?)
}

/// Assembles the container mount graph and chroots into it.
/// Runs with effective root inside the fresh mount namespace; the order of
/// the steps is significant throughout.
pub fn setup_root(config: &LaunchConfig) -> Result<(), Error> {
    make_rprivate_root()?;

    // Bind the new root over a known-empty anchor, so no scratch directory
    // has to be created per launch.
    let anchor = Path::new(ROOTOVERLAY).join("dev/empty");
    if config.permit_writable {
        bind_rw(&config.oldroot, &anchor)?;
    } else {
        bind_ro(&config.oldroot, &anchor)?;
    }
    chdir(&anchor).map_err(|v| format!("chdir: {}: {v}", anchor.display()))?;

    // A minimal device set, independent of the host's.
    bind_ro(&Path::new(ROOTOVERLAY).join("dev"), Path::new("dev"))?;

    // Bind sources resolve in the host namespace, so binds go before chroot;
    // destinations walk from the anchor.
    for bind in &config.maps {
        bind_ro(&bind.src, in_root(&bind.dst))?;
    }
    for bind in &config.vols {
        bind_rw(&bind.src, in_root(&bind.dst))?;
    }

    chroot(".").map_err(|v| format!("chroot: {}: {v}", anchor.display()))?;

    // proc and devpts go after chroot, so they live inside the new root.
    mount(
        Some("none"),
        "proc",
        Some("proc"),
        MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|v| format!("mount proc: {v}"))?;
    mount(
        Some("none"),
        "dev/pts",
        Some("devpts"),
        MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|v| format!("mount devpts: {v}"))?;

    for tmpfs in &config.tmpfs {
        tmpfs_at(&tmpfs.dst, &tmpfs.options)?;
    }
    if !config.has_tmp {
        tmpfs_at(Path::new("/tmp"), "size=2M")?;
    }
    Ok(())
}

fn in_root(dst: &Path) -> &Path {
    dst.strip_prefix("/").unwrap_or(dst)
}
