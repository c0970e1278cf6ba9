//! Collects children that changed state while the shell was busy elsewhere.
//!
//! The `SIGCHLD` handler only raises a flag. Whoever observes that flag next
//! (the prompt loop, or a foreground wait woken by the signal) drains every ready
//! child here without blocking.

use super::{
    job::Job,
    pipe_exec::{foreground::ActiveChild, job_control::JobTable},
    Shell,
};
use nix::{
    errno::Errno,
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd::Pid,
};
use std::io::{self, Write};
use tracing::{debug, trace, warn};

/// A non-blocking source of child state changes.
pub trait ChildWaiter {
    /// Returns the next child that changed state. `Ok(WaitStatus::StillAlive)`
    /// means children exist but none is ready, `Err(Errno::ECHILD)` means the
    /// shell has no children at all.
    fn wait_any(&mut self) -> nix::Result<WaitStatus>;
}

/// Waits on the real children of this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemWaiter;

impl ChildWaiter for SystemWaiter {
    fn wait_any(&mut self) -> nix::Result<WaitStatus> {
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED;
        loop {
            match waitpid(Pid::from_raw(-1), Some(flags)) {
                Err(Errno::EINTR) => continue,
                result => break result,
            }
        }
    }
}

/// Drains every ready child.
///
/// - A child matching the active-child cell is the one a foreground wait is
///   blocked on; the cell is cleared and the status goes to `foreground`.
/// - Any other child is looked up in the background table, and completions and
///   stops are reported to `out`.
/// - When there are no children at all and nothing was collected during this
///   call, the active-child cell is cleared: its child was already collected by
///   the foreground wait.
///
/// Returns the number of children collected.
pub fn reap_children<W: ChildWaiter + ?Sized>(
    waiter: &mut W,
    active: &ActiveChild,
    jobs: &mut JobTable,
    mut foreground: Option<&mut Job>,
    out: &mut dyn Write,
) -> usize {
    let mut first_iteration = true;
    let mut reaped = 0;

    loop {
        let status = match waiter.wait_any() {
            Ok(WaitStatus::StillAlive) => break,
            Err(Errno::ECHILD) => {
                if first_iteration {
                    active.clear();
                }
                break;
            }
            Err(why) => {
                warn!("failed to reap children: {}", why);
                break;
            }
            Ok(status) => status,
        };
        first_iteration = false;
        reaped += 1;

        let pid = match status.pid() {
            Some(pid) => pid,
            None => continue,
        };

        if active.is(pid) {
            trace!(pid = pid.as_raw(), ?status, "reaped the foreground child");
            active.clear();
            if let Some(job) = foreground.as_mut() {
                job.record(status);
            }
            continue;
        }

        if let Some(job) = foreground.as_mut() {
            if job.record(status) {
                trace!(pid = pid.as_raw(), ?status, "reaped a foreground pipeline member");
                continue;
            }
        }

        match jobs.record(status) {
            Some(event) => {
                debug!(pid = pid.as_raw(), ?status, slot = event.slot(), "reaped a background child");
                if event.is_reported() {
                    let _ = writeln!(out, "{}", event);
                }
            }
            None => trace!(pid = pid.as_raw(), ?status, "reaped a child no job claims"),
        }
    }

    reaped
}

impl Shell {
    /// Runs the reaper against this session's real children, reporting to
    /// standard output.
    pub(crate) fn reap(&mut self, foreground: Option<&mut Job>) -> usize {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let reaped = reap_children(
            &mut SystemWaiter,
            &self.active_child,
            &mut self.background,
            foreground,
            &mut out,
        );
        let _ = out.flush();
        reaped
    }
}
