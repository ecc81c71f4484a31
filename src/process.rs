use std::ffi::CString;
use std::fs::File;
use std::panic::catch_unwind;
use std::path::Path;

use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{chdir, chroot, execvp, getuid, Pid, Uid};

use crate::{
    diagnose_executable, drop_permanently, exit, get_pid, setup_root, wait_child, Elevated, Error,
    ExecDiagnosis, InstanceFile, LaunchConfig,
};

#[repr(C, align(8))]
#[derive(Debug, Default)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
    set_tid: u64,
    set_tid_size: u64,
    cgroup: u64,
}

impl CloneArgs {
    fn flag_newns(&mut self) {
        self.flags |= nix::libc::CLONE_NEWNS as u64;
    }

    fn flag_newpid(&mut self) {
        self.flags |= nix::libc::CLONE_NEWPID as u64;
    }
}

enum CloneResult {
    Child,
    Parent { child: Pid },
}

unsafe fn clone3(cl_args: &CloneArgs) -> Result<CloneResult, Errno> {
    let res = nix::libc::syscall(
        nix::libc::SYS_clone3,
        cl_args as *const CloneArgs,
        core::mem::size_of::<CloneArgs>(),
    );
    Errno::result(res).map(|v| match v {
        0 => CloneResult::Child,
        v => CloneResult::Parent {
            child: Pid::from_raw(v as nix::libc::pid_t),
        },
    })
}

/// Starts the configured command in fresh mount and pid namespaces and
/// supervises it to completion. Prints its own diagnostics and returns the
/// exit status to report.
pub fn supervise(config: &LaunchConfig, mut instance: Option<InstanceFile>) -> i32 {
    let child = {
        // The namespace creation and the child's mount work need the
        // granted euid; the child inherits it and drops it itself.
        let _root = match Elevated::new() {
            Ok(v) => v,
            Err(err) => {
                eprintln!("{err}");
                return exit::CANNOT;
            }
        };
        let mut clone_args = CloneArgs::default();
        clone_args.flag_newns();
        clone_args.flag_newpid();
        clone_args.exit_signal = nix::libc::SIGCHLD as u64;
        match unsafe { clone3(&clone_args) } {
            Err(errno) => return report_clone_failure(errno),
            Ok(CloneResult::Child) => {
                // Pid 1 of the new namespaces, with a copy-on-write view of
                // the parent's memory.
                let status = catch_unwind(|| child_main(config)).unwrap_or(exit::CANNOT);
                unsafe { nix::libc::_exit(status) }
            }
            Ok(CloneResult::Parent { child }) => child,
        }
    };
    if let Some(instance) = instance.as_mut() {
        if let Err(err) = instance.write_pid(child) {
            eprintln!("{err}");
            // Without a registry entry the child must not keep running.
            let _ = kill(child, Signal::SIGKILL);
            wait_child(child);
            return exit::CANNOT;
        }
    }
    let status = wait_child(child);
    drop(instance);
    status
}

fn report_clone_failure(errno: Errno) -> i32 {
    let binary = std::env::args().next().unwrap_or_else(|| "selfdock".into());
    match diagnose_executable(&binary, errno) {
        (ExecDiagnosis::NoSuid, _) if errno == Errno::EPERM => {
            eprintln!("No suid. Please check that {binary} is installed correctly.");
        }
        (_, errval) => eprintln!("clone: {}", errval.desc()),
    }
    exit::CMD_NOT_EXEC
}

// Runs as pid 1 of the new namespaces. Returns only on failure; the caller
// turns the status into _exit.
fn child_main(config: &LaunchConfig) -> i32 {
    if let Err(err) = setup_root(config) {
        eprintln!("{err}");
        return exit::CANNOT;
    }
    // Drop effective root. Nothing below may require privilege.
    if let Err(err) = drop_permanently() {
        eprintln!("{err}");
        return exit::CANNOT;
    }
    if let Err(err) = chdir(&config.work_dir) {
        eprintln!("{}: {err}", config.work_dir.display());
        return exit::CANNOT;
    }
    exec_command(&config.command)
}

// Replaces this process with the command, or explains why it could not.
fn exec_command(command: &[String]) -> i32 {
    let prepared = || -> Result<(CString, Vec<CString>), Error> {
        let filename = CString::new(command[0].as_bytes())?;
        let argv =
            Result::<Vec<_>, _>::from_iter(command.iter().map(|v| CString::new(v.as_bytes())))?;
        Ok((filename, argv))
    }();
    let (filename, argv) = match prepared {
        Ok(v) => v,
        Err(err) => {
            eprintln!("exec: {}: {err}", command[0]);
            return exit::CANNOT;
        }
    };
    let errno = match execvp(&filename, &argv) {
        Err(v) => v,
        Ok(infallible) => match infallible {},
    };
    let (diagnosis, errval) = diagnose_executable(&command[0], errno);
    eprintln!("exec: {}: {}", command[0], errval.desc());
    match diagnosis {
        ExecDiagnosis::Missing => exit::CMD_NOT_FOUND,
        _ => exit::CMD_NOT_EXEC,
    }
}

/// Joins the running instance registered under `name` and execs the command
/// inside it. Prints its own diagnostics and returns the exit status to
/// report; the instance itself is unaffected by failures here.
pub fn enter(name: &str, work_dir: &Path, command: &[String]) -> i32 {
    let pid = match get_pid(name, getuid()) {
        Ok(v) => v,
        Err(err) => {
            eprintln!("{err}");
            return err.exit_status();
        }
    };
    if let Err(err) = join_instance(pid) {
        eprintln!("{err}");
        return exit::CANNOT;
    }
    // The chroot made /proc the procfs the instance's init mounted, so
    // /proc/1 is that init. Checked only after the effective uid is back
    // to the real one.
    match nix::sys::stat::stat("/proc/1") {
        Ok(info) if Uid::from_raw(info.st_uid) == getuid() => {}
        Ok(_) => {
            eprintln!("You do not own this instance");
            return exit::CANNOT;
        }
        Err(err) => {
            eprintln!("/proc/1: {err}");
            return exit::CANNOT;
        }
    }
    if let Err(err) = chdir(work_dir) {
        eprintln!("{}: {err}", work_dir.display());
        return exit::CANNOT;
    }
    // The joined pid namespace applies to children only, so the command
    // runs in a fresh child; this process stays behind to reap it.
    let mut clone_args = CloneArgs::default();
    clone_args.exit_signal = nix::libc::SIGCHLD as u64;
    match unsafe { clone3(&clone_args) } {
        Err(errno) => {
            eprintln!("clone: {}", errno.desc());
            exit::CANNOT
        }
        Ok(CloneResult::Child) => {
            let status = catch_unwind(|| exec_command(command)).unwrap_or(exit::CANNOT);
            unsafe { nix::libc::_exit(status) }
        }
        Ok(CloneResult::Parent { child }) => wait_child(child),
    }
}

// Adopts the instance's pid and mount namespaces and its root view.
fn join_instance(pid: Pid) -> Result<(), Error> {
    let _root = Elevated::new()?;
    for ns in ["pid", "mnt"] {
        let path = format!("/proc/{pid}/ns/{ns}");
        let file = File::open(&path).map_err(|v| format!("{path}: {v}"))?;
        nix::sched::setns(&file, CloneFlags::empty()).map_err(|v| format!("setns {path}: {v}"))?;
    }
    // The instance init's working directory is its root view; adopting it
    // avoids re-mounting anything.
    let root = format!("/proc/{pid}/cwd");
    chroot(root.as_str()).map_err(|v| format!("chroot: {root}: {v}"))?;
    // All three uids return to the real user before the elevation guard
    // drops, so the exec'd command cannot reclaim root.
    drop_permanently()?;
    Ok(())
}
