use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::{chown, mkdir, Pid, Uid};

use crate::{compose, exit, mkdir_as_real_user, Elevated, Error};

/// Registry failures that map to their own exit statuses.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("{}: instance name already in use", .0.display())]
    NameInUse(PathBuf),
    #[error("{0}: not running")]
    NotRunning(String),
    #[error("{0}")]
    Cannot(String),
}

impl InstanceError {
    pub fn exit_status(&self) -> i32 {
        match self {
            Self::NameInUse(_) | Self::NotRunning(_) => exit::NAME_IN_USE,
            Self::Cannot(_) => exit::CANNOT,
        }
    }

    fn cannot(err: impl std::fmt::Display) -> Self {
        Self::Cannot(err.to_string())
    }
}

// Instance names become single path components under the registry
// directory; anything else would escape it.
fn check_name(name: &str) -> Result<(), InstanceError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(InstanceError::Cannot(format!(
            "bad instance name: {name:?}"
        )));
    }
    Ok(())
}

/// The on-disk record of a running named instance: a file under the caller's
/// runtime directory holding the supervised pid. Removed when dropped.
pub struct InstanceFile {
    file: File,
    path: PathBuf,
}

impl InstanceFile {
    /// Registers `name` for `uid`, failing distinctly if it is taken.
    /// The file is created exclusively, mode 0400, owned by the real user.
    pub fn create(name: &str, uid: Uid) -> Result<Self, InstanceError> {
        check_name(name)?;
        let rundir = runtime_dir(uid, true).map_err(InstanceError::cannot)?;
        let dir = compose(&rundir, "selfdock").map_err(InstanceError::cannot)?;
        let path = compose(&dir, name).map_err(InstanceError::cannot)?;
        let _root = Elevated::new().map_err(InstanceError::cannot)?;
        // The registry directory sits under a user-supplied path and is
        // created as the real user, never with effective root.
        match mkdir_as_real_user(&dir, Mode::from_bits_truncate(0o700)) {
            Ok(()) | Err(Errno::EEXIST) => {}
            Err(err) => {
                return Err(InstanceError::Cannot(format!(
                    "mkdir {}: {err}",
                    dir.display()
                )))
            }
        }
        let file = match File::options()
            .write(true)
            .create_new(true)
            .mode(0o400)
            .open(&path)
        {
            Ok(v) => v,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                // A stale file after a crash reads as running; exclusive
                // create wins.
                return Err(InstanceError::NameInUse(path));
            }
            Err(err) => return Err(InstanceError::Cannot(format!("{}: {err}", path.display()))),
        };
        if let Err(err) = chown(&path, Some(uid), None) {
            let _ = std::fs::remove_file(&path);
            return Err(InstanceError::Cannot(format!(
                "chown {}: {err}",
                path.display()
            )));
        }
        Ok(Self { file, path })
    }

    /// Writes the supervised pid, restarting on interrupt and rewinding on a
    /// partial write. The payload is a native-width pid in host byte order.
    pub fn write_pid(&mut self, pid: Pid) -> Result<(), Error> {
        let data = pid.as_raw().to_ne_bytes();
        loop {
            match self.file.write(&data) {
                Ok(n) if n == data.len() => return Ok(()),
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(format!("{}: {err}", self.path.display()).into()),
            }
            self.file
                .seek(SeekFrom::Start(0))
                .map_err(|v| format!("{}: {v}", self.path.display()))?;
        }
    }
}

impl Drop for InstanceFile {
    fn drop(&mut self) {
        // Report but do not fail: the child's status dominates.
        if let Err(err) = std::fs::remove_file(&self.path) {
            eprintln!("{}: {err}", self.path.display());
        }
    }
}

/// Looks up the pid registered under `name` for `uid`.
pub fn get_pid(name: &str, uid: Uid) -> Result<Pid, InstanceError> {
    check_name(name)?;
    let rundir = runtime_dir(uid, false).map_err(InstanceError::cannot)?;
    let path = compose(&rundir, "selfdock")
        .and_then(|dir| compose(&dir, name))
        .map_err(InstanceError::cannot)?;
    let mut file = match File::open(&path) {
        Ok(v) => v,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(InstanceError::NotRunning(name.to_string()));
        }
        Err(err) => return Err(InstanceError::Cannot(format!("{}: {err}", path.display()))),
    };
    let mut buf = [0; std::mem::size_of::<nix::libc::pid_t>()];
    file.read_exact(&mut buf)
        .map_err(|v| InstanceError::Cannot(format!("{}: {v}", path.display())))?;
    Ok(Pid::from_raw(nix::libc::pid_t::from_ne_bytes(buf)))
}

// Resolves the per-user runtime directory, materialising the default when
// asked to. The result is exported back into the environment so the child
// and later cleanup agree on it.
fn runtime_dir(uid: Uid, create: bool) -> Result<PathBuf, Error> {
    if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let path = PathBuf::from(format!("/run/user/{uid}"));
    match std::fs::metadata(&path) {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {
            if create {
                create_runtime_dir(&path, uid)?;
            }
        }
        Err(err) => return Err(format!("{}: {err}", path.display()).into()),
    }
    std::env::set_var("XDG_RUNTIME_DIR", &path);
    Ok(path)
}

fn create_runtime_dir(path: &Path, uid: Uid) -> Result<(), Error> {
    let _root = Elevated::new()?;
    match mkdir("/run/user", Mode::from_bits_truncate(0o755)) {
        Ok(()) | Err(Errno::EEXIST) => {}
        Err(err) => return Err(format!("mkdir /run/user: {err}").into()),
    }
    mkdir_uid(path, Mode::from_bits_truncate(0o700), uid)
}

// Creates a directory owned by `uid`, tolerating that it already exists.
fn mkdir_uid(path: &Path, mode: Mode, uid: Uid) -> Result<(), Error> {
    match mkdir(path, mode) {
        Ok(()) => {}
        Err(Errno::EEXIST) => return Ok(()),
        Err(err) => return Err(format!("mkdir {}: {err}", path.display()).into()),
    }
    if let Err(err) = chown(path, Some(uid), None) {
        // Bad place to fail.
        let _ = std::fs::remove_dir(path);
        return Err(format!("chown {}: {err}", path.display()).into());
    }
    Ok(())
}
