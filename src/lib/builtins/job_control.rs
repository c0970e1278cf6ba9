//! Contains the `jobs`, `bg`, and `fg` commands that manage job control in the
//! shell.

use super::report;
use crate::shell::{
    job::Process,
    pipe_exec::{job_control::ProcessState, streams::FdWriter},
    status::Status,
    Shell,
};
use std::io::Write;

/// Resolves the job argument of `fg`/`bg`: an explicit slot (optionally
/// written `%N`), or the highest occupied slot when omitted.
fn jobspec(shell: &Shell, process: &Process) -> Result<usize, String> {
    match process.argv.get(1) {
        Some(arg) => arg
            .trim_start_matches('%')
            .parse::<usize>()
            .map_err(|_| format!("{} is not a valid job number", arg)),
        None => shell.background.last_slot().ok_or_else(|| "no current job".to_owned()),
    }
}

/// Display a list of all jobs attached to the background.
pub fn builtin_jobs(shell: &mut Shell, process: &Process) -> Status {
    let mut out = FdWriter(process.fds.stdout());
    for (slot, job) in shell.background.iter() {
        let state = if job.is_stopped() { ProcessState::Stopped } else { ProcessState::Running };
        let _ = writeln!(out, "[{}] {}\t{}", slot, state, job);
    }
    Status::SUCCESS
}

/// Hands the terminal to a background job and waits on it, continuing it first
/// if it was stopped. The job's status becomes the status of `fg`.
pub fn builtin_fg(shell: &mut Shell, process: &Process) -> Status {
    let slot = match jobspec(shell, process) {
        Ok(slot) => slot,
        Err(why) => {
            report(process, "fg", why);
            return Status::FAILURE;
        }
    };
    match shell.resume_foreground(slot) {
        Ok(outcome) => outcome.status(),
        Err(why) => {
            report(process, "fg", why);
            Status::FAILURE
        }
    }
}

/// Resumes a stopped background job, leaving it in the background.
pub fn builtin_bg(shell: &mut Shell, process: &Process) -> Status {
    let slot = match jobspec(shell, process) {
        Ok(slot) => slot,
        Err(why) => {
            report(process, "bg", why);
            return Status::FAILURE;
        }
    };
    match shell.resume_background(slot) {
        Ok(()) => Status::SUCCESS,
        Err(why) => {
            report(process, "bg", why);
            Status::FAILURE
        }
    }
}
