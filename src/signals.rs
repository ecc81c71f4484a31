use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::{exit, Error};

// The pid signals are forwarded to. Zero until a child is published.
static SIGNAL_RECIPIENT: AtomicI32 = AtomicI32::new(0);

const FORWARDED_SIGNALS: [Signal; 6] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGPIPE,
    Signal::SIGTERM,
];

// Kill is async-signal-safe if errno is restored (man 7 signal-safety).
extern "C" fn take_signal(sig: nix::libc::c_int) {
    let restore = Errno::last_raw();
    let pid = SIGNAL_RECIPIENT.load(Ordering::Relaxed);
    if pid != 0 {
        unsafe { nix::libc::kill(pid, sig) };
    }
    Errno::set_raw(restore);
}

/// Installs forwarding of job-control signals to the published child.
/// A signal arriving before any child is published is dropped.
pub fn start_forwarding() -> Result<(), Error> {
    let action = SigAction::new(
        SigHandler::Handler(take_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in FORWARDED_SIGNALS {
        unsafe { sigaction(sig, &action) }.map_err(|v| format!("sigaction(sig={sig}): {v}"))?;
    }
    Ok(())
}

/// Publishes `pid` as the signal recipient, then waits for it to terminate
/// and maps the result to a shell-compatible exit status.
pub fn wait_child(pid: Pid) -> i32 {
    SIGNAL_RECIPIENT.store(pid.as_raw(), Ordering::Relaxed);
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            Err(err) => {
                eprintln!("waitpid: {err}");
                return exit::killed_by(nix::libc::SIGABRT);
            }
            Ok(WaitStatus::Exited(_, status)) => return status,
            Ok(WaitStatus::Signaled(_, sig, _)) => return exit::killed_by(sig as i32),
            Ok(_) => continue,
        }
    }
}
