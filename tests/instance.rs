mod common;

use std::os::unix::fs::MetadataExt;
use std::sync::OnceLock;

use nix::unistd::{getuid, Pid};
use selfdock::{get_pid, InstanceError, InstanceFile};

// All tests in this binary share the process environment, so the runtime
// directory is pointed at one temporary directory exactly once.
fn setup_runtime_dir() -> &'static common::TempDir {
    static DIR: OnceLock<common::TempDir> = OnceLock::new();
    DIR.get_or_init(|| {
        let dir = common::TempDir::new().unwrap();
        std::env::set_var("XDG_RUNTIME_DIR", dir.as_path());
        dir
    })
}

#[test]
fn test_exclusive_create() {
    let dir = setup_runtime_dir();
    let uid = getuid();
    let instance = InstanceFile::create("demo", uid).unwrap();
    let path = dir.join("selfdock/demo");
    let info = std::fs::metadata(&path).unwrap();
    assert_eq!(info.mode() & 0o7777, 0o400);
    assert_eq!(info.uid(), uid.as_raw());
    match InstanceFile::create("demo", uid) {
        Err(InstanceError::NameInUse(v)) => assert_eq!(v, path),
        Err(err) => panic!("expected name collision: {err}"),
        Ok(_) => panic!("expected name collision"),
    }
    drop(instance);
    assert!(!path.exists());
}

#[test]
fn test_registry_directory_mode() {
    let dir = setup_runtime_dir();
    let uid = getuid();
    let _instance = InstanceFile::create("modecheck", uid).unwrap();
    let info = std::fs::metadata(dir.join("selfdock")).unwrap();
    assert_eq!(info.mode() & 0o777, 0o700);
    assert_eq!(info.uid(), uid.as_raw());
}

#[test]
fn test_pid_round_trip() {
    setup_runtime_dir();
    let uid = getuid();
    let mut instance = InstanceFile::create("roundtrip", uid).unwrap();
    instance.write_pid(Pid::from_raw(43210)).unwrap();
    assert_eq!(get_pid("roundtrip", uid).unwrap(), Pid::from_raw(43210));
}

#[test]
fn test_absent_instance() {
    setup_runtime_dir();
    match get_pid("absent", getuid()) {
        Err(InstanceError::NotRunning(name)) => assert_eq!(name, "absent"),
        Err(err) => panic!("expected not running: {err}"),
        Ok(pid) => panic!("expected not running, got pid {pid}"),
    }
    let err = InstanceError::NotRunning("absent".into());
    assert!(err.to_string().contains("not running"));
    assert_eq!(err.exit_status(), 123);
}

#[test]
fn test_names_must_be_single_components() {
    setup_runtime_dir();
    let uid = getuid();
    for name in ["", ".", "..", "a/b", "/etc/cron.d/x", "../escape"] {
        match InstanceFile::create(name, uid) {
            Err(InstanceError::Cannot(msg)) => {
                assert!(msg.contains("bad instance name"), "{name}: {msg}")
            }
            Err(err) => panic!("{name}: expected bad name, got {err}"),
            Ok(_) => panic!("{name}: expected bad name"),
        }
        match get_pid(name, uid) {
            Err(InstanceError::Cannot(msg)) => {
                assert!(msg.contains("bad instance name"), "{name}: {msg}")
            }
            Err(err) => panic!("{name}: expected bad name, got {err}"),
            Ok(pid) => panic!("{name}: expected bad name, got pid {pid}"),
        }
    }
}

#[test]
fn test_collision_exit_status() {
    let err = InstanceError::NameInUse("/run/user/0/selfdock/x".into());
    assert_eq!(err.exit_status(), 123);
    assert_eq!(InstanceError::Cannot("mount failed".into()).exit_status(), 124);
}
