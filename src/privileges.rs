use std::path::Path;
use std::sync::OnceLock;

use nix::sys::stat::Mode;
use nix::unistd::{geteuid, getuid, mkdir, seteuid, setuid, Uid};

use crate::Error;

// The euid the binary was installed with (root when installed suid).
// Recorded on the first privilege operation, before any drop.
static GRANTED_EUID: OnceLock<Uid> = OnceLock::new();

fn granted_euid() -> Uid {
    *GRANTED_EUID.get_or_init(geteuid)
}

/// Gives up the setuid-granted effective uid until explicitly reclaimed.
/// Must run at program entry, before anything touches the filesystem.
pub fn drop_effective() -> Result<(), Error> {
    granted_euid();
    seteuid(getuid()).map_err(|v| format!("seteuid: {v}").into())
}

/// Irrevocably becomes the real user: real, effective and saved uid.
/// Nothing that runs after this may require privilege.
pub fn drop_permanently() -> Result<(), Error> {
    setuid(getuid()).map_err(|v| format!("setuid: {v}").into())
}

/// Reclaims the setuid-granted effective uid for one scope.
/// Restores the real uid when dropped, on every exit path.
pub struct Elevated {
    real: Uid,
}

impl Elevated {
    pub fn new() -> Result<Self, Error> {
        let real = getuid();
        seteuid(granted_euid()).map_err(|v| format!("seteuid: {v}"))?;
        Ok(Self { real })
    }
}

impl Drop for Elevated {
    fn drop(&mut self) {
        if seteuid(self.real).is_err() {
            // Must not keep running with effective root.
            eprintln!("seteuid: cannot return to uid {}", self.real);
            std::process::abort();
        }
    }
}

/// Creates a directory with the real uid as the effective uid, so that
/// user-supplied paths are never created with effective root.
pub fn mkdir_as_real_user(path: &Path, mode: Mode) -> nix::Result<()> {
    let real = getuid();
    let effective = geteuid();
    if effective == real {
        return mkdir(path, mode);
    }
    seteuid(real)?;
    let res = mkdir(path, mode);
    seteuid(effective)?;
    res
}
