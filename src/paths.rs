use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::stat::stat;

use crate::Error;

/// Joins `segment` onto `base`, refusing results that no longer fit in a
/// kernel path buffer. An absolute `segment` is refused rather than allowed
/// to replace `base`, which is what `Path::join` would do.
pub fn compose(base: &Path, segment: impl AsRef<Path>) -> Result<PathBuf, Error> {
    let segment = segment.as_ref();
    if segment.is_absolute() {
        return Err(format!("{}: must be relative to {}", segment.display(), base.display()).into());
    }
    let path = base.join(segment);
    if path.as_os_str().len() >= nix::libc::PATH_MAX as usize {
        return Err(format!("{}: name too long", path.display()).into());
    }
    Ok(path)
}

/// Tells whether `path` sits on a read-only filesystem by probing its atime.
/// Updates atime if writable, so only suitable when it is not supposed to be.
/// Works on directories, unlike opening for write.
pub fn is_readonly(path: &Path) -> bool {
    let cpath = match CString::new(path.as_os_str().as_bytes()) {
        Ok(v) => v,
        Err(_) => return false,
    };
    let atime = [
        nix::libc::timespec {
            tv_sec: 0,
            tv_nsec: nix::libc::UTIME_NOW,
        },
        nix::libc::timespec {
            tv_sec: 0,
            tv_nsec: nix::libc::UTIME_OMIT,
        },
    ];
    let res =
        unsafe { nix::libc::utimensat(nix::libc::AT_FDCWD, cpath.as_ptr(), atime.as_ptr(), 0) };
    res != 0 && Errno::last() == Errno::EROFS
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecDiagnosis {
    Missing,
    NoSuid,
    Suid,
}

/// Explains a failed exec or clone by inspecting the binary itself.
/// Returns the diagnosis and the errno to report, which may be refined:
/// a directory reached through a pathname gets EISDIR rather than EACCES.
pub fn diagnose_executable(path: &str, errval: Errno) -> (ExecDiagnosis, Errno) {
    let info = match stat(path) {
        Ok(v) => v,
        Err(_) => return (ExecDiagnosis::Missing, errval),
    };
    let errval = if info.st_mode & nix::libc::S_IFMT == nix::libc::S_IFDIR && path.contains('/') {
        Errno::EISDIR
    } else {
        errval
    };
    if info.st_mode & nix::libc::S_ISUID != 0 {
        (ExecDiagnosis::Suid, errval)
    } else {
        (ExecDiagnosis::NoSuid, errval)
    }
}
