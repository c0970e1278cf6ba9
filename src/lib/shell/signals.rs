//! This module contains all of the code that manages signal handling in the
//! shell. The handlers installed here only touch lock-free atomics and call
//! async-signal-safe functions; everything else (reaping, unwinding back to the
//! prompt) happens on the shell's own control path once it observes the
//! pending flags.
//!
//! Every handled signal also writes a byte to a non-blocking wake pipe. The
//! shell blocks in `poll` on that pipe instead of in `waitpid` or `read`, so a
//! signal that lands after the pending flags were checked still wakes it.

use super::{job::Job, status::Status};
use nix::{
    errno::Errno,
    fcntl::OFlag,
    libc::{self, c_int},
    poll::{poll, PollFd, PollFlags},
    sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal},
    unistd,
};
use std::{
    os::unix::io::RawFd,
    sync::atomic::{AtomicI32, AtomicU8, Ordering},
};

/// Bit set of signals that have been delivered but not yet acted upon.
pub static PENDING: AtomicU8 = AtomicU8::new(0);
pub const SIGINT: u8 = 1;
pub const SIGQUIT: u8 = 2;
pub const SIGCHLD: u8 = 4;

/// The shell-wide exit code: the status of the last foreground job, or the
/// interrupt code after `SIGINT`.
static EXIT_CODE: AtomicI32 = AtomicI32::new(0);

/// Both ends of the wake pipe, or -1 before the first `install`.
static WAKE_READ: AtomicI32 = AtomicI32::new(-1);
static WAKE_WRITE: AtomicI32 = AtomicI32::new(-1);

const QUIT_NOTICE: &[u8] = b"\nQuit (core dumped)\n";

/// The signals whose dispositions the shell changes and every child resets.
const SHELL_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGCHLD];
const JOB_CONTROL_SIGNALS: [Signal; 3] = [Signal::SIGTSTP, Signal::SIGTTIN, Signal::SIGTTOU];

extern "C" fn handler(signal: c_int) {
    match signal {
        libc::SIGINT => {
            EXIT_CODE.store(Status::INTERRUPTED.as_os_code(), Ordering::SeqCst);
            let _ = unistd::write(libc::STDOUT_FILENO, b"\n");
            PENDING.fetch_or(SIGINT, Ordering::SeqCst);
        }
        libc::SIGQUIT => {
            let _ = unistd::write(libc::STDOUT_FILENO, QUIT_NOTICE);
            // Further quits are ignored by the shell itself; children reset
            // the disposition before exec and react normally.
            unsafe {
                let _ = signal::signal(Signal::SIGQUIT, SigHandler::SigIgn);
            }
            PENDING.fetch_or(SIGQUIT, Ordering::SeqCst);
        }
        libc::SIGCHLD => {
            PENDING.fetch_or(SIGCHLD, Ordering::SeqCst);
        }
        _ => return,
    }

    let wake = WAKE_WRITE.load(Ordering::SeqCst);
    if wake >= 0 {
        // A full pipe already holds a wakeup.
        let _ = unistd::write(wake, &[signal as u8]);
    }
}

/// Creates the wake pipe once per process and returns its read end.
fn wake_pipe() -> nix::Result<RawFd> {
    let reader = WAKE_READ.load(Ordering::SeqCst);
    if reader >= 0 {
        return Ok(reader);
    }
    let (reader, writer) = unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
    WAKE_WRITE.store(writer, Ordering::SeqCst);
    WAKE_READ.store(reader, Ordering::SeqCst);
    Ok(reader)
}

fn drain_wake_pipe(reader: RawFd) {
    let mut buffer = [0u8; 64];
    while let Ok(read) = unistd::read(reader, &mut buffer) {
        if read < buffer.len() {
            break;
        }
    }
}

/// Blocks until one of the shell's signals arrives or, when given, `fd` has
/// input (or has hung up). Returns whether `fd` is ready to read. Callers
/// check the pending flags after every return.
pub fn wait_readable(fd: Option<RawFd>) -> nix::Result<bool> {
    let wake = wake_pipe()?;
    let mut fds = vec![PollFd::new(wake, PollFlags::POLLIN)];
    if let Some(fd) = fd {
        fds.push(PollFd::new(fd, PollFlags::POLLIN));
    }

    match poll(&mut fds, -1) {
        Ok(_) => (),
        Err(Errno::EINTR) => return Ok(false),
        Err(why) => return Err(why),
    }

    if fds[0].revents().map_or(false, |events| !events.is_empty()) {
        drain_wake_pipe(wake);
    }
    let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
    Ok(fds.get(1).and_then(|fd| fd.revents()).map_or(false, |events| events.intersects(ready)))
}

/// Installs the shell's handler for SIGINT, SIGQUIT and SIGCHLD. The handlers
/// are installed without `SA_RESTART`, and each one leaves a byte in the wake
/// pipe for `wait_readable`.
pub fn install() -> nix::Result<()> {
    wake_pipe()?;
    let action = SigAction::new(SigHandler::Handler(handler), SaFlags::empty(), SigSet::empty());
    for &sig in SHELL_SIGNALS.iter() {
        unsafe { signal::sigaction(sig, &action)? };
    }
    Ok(())
}

/// Ignores the terminal job-control signals so the shell can hand the
/// terminal back and forth without being stopped itself.
pub fn ignore_job_control() -> nix::Result<()> {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    for &sig in JOB_CONTROL_SIGNALS.iter() {
        unsafe { signal::sigaction(sig, &ignore)? };
    }
    Ok(())
}

/// Puts every signal the shell touches back to its default disposition. Used
/// in forked children before exec and by the shell on teardown.
pub fn restore_defaults() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for &sig in SHELL_SIGNALS.iter().chain(JOB_CONTROL_SIGNALS.iter()) {
        unsafe {
            let _ = signal::sigaction(sig, &default);
        }
    }
}

/// Returns true if `signal` was pending, clearing it.
pub fn take(signal: u8) -> bool { PENDING.fetch_and(!signal, Ordering::SeqCst) & signal != 0 }

pub fn exit_code() -> Status { Status::from_exit_code(EXIT_CODE.load(Ordering::SeqCst)) }

pub fn set_exit_code(status: Status) { EXIT_CODE.store(status.as_os_code(), Ordering::SeqCst); }

/// Sends `SIGCONT` to a job: to its process group when it has one, otherwise
/// to each member that has not terminated.
pub(crate) fn resume(job: &Job) -> nix::Result<()> {
    if let Some(pgid) = job.pgid {
        return signal::killpg(pgid, Signal::SIGCONT);
    }
    for pid in job.processes.iter().filter(|p| !p.completed).filter_map(|p| p.pid) {
        match signal::kill(pid, Signal::SIGCONT) {
            // Exited but not yet collected.
            Ok(()) | Err(Errno::ESRCH) => (),
            Err(why) => return Err(why),
        }
    }
    Ok(())
}
