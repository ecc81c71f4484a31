use std::path::Path;

use nix::errno::Errno;
use selfdock::{compose, diagnose_executable, exit, ExecDiagnosis};

#[test]
fn test_compose() {
    let path = compose(Path::new("/run/user/1000"), "selfdock").unwrap();
    assert_eq!(path, Path::new("/run/user/1000/selfdock"));
}

#[test]
fn test_compose_rejects_absolute_segments() {
    let err = compose(Path::new("/run/user/1000/selfdock"), "/etc/passwd").unwrap_err();
    assert!(err.to_string().contains("must be relative"), "{err}");
}

#[test]
fn test_compose_rejects_long_names() {
    let long = "x".repeat(5000);
    let err = compose(Path::new("/run/user/1000"), &long).unwrap_err();
    assert!(err.to_string().contains("name too long"), "{err}");
}

#[test]
fn test_diagnose_missing() {
    let (diagnosis, errval) = diagnose_executable("/no/such", Errno::ENOENT);
    assert_eq!(diagnosis, ExecDiagnosis::Missing);
    assert_eq!(errval, Errno::ENOENT);
}

#[test]
fn test_diagnose_directory() {
    // A directory reached through a pathname reports EISDIR, not the
    // EACCES that exec produced.
    let (diagnosis, errval) = diagnose_executable("/etc", Errno::EACCES);
    assert_eq!(diagnosis, ExecDiagnosis::NoSuid);
    assert_eq!(errval, Errno::EISDIR);
}

#[test]
fn test_diagnose_plain_executable() {
    let (diagnosis, errval) = diagnose_executable("/bin/sh", Errno::EACCES);
    assert_eq!(diagnosis, ExecDiagnosis::NoSuid);
    assert_eq!(errval, Errno::EACCES);
}

#[test]
fn test_signal_exit_statuses() {
    assert_eq!(exit::killed_by(nix::libc::SIGTERM), 143);
    assert_eq!(exit::killed_by(nix::libc::SIGKILL), 137);
}
