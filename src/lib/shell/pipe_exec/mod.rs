//! The purpose of the pipeline execution module is to take a parsed job and
//! run it. That includes wiring pipes and redirections into each stage's
//! descriptor slots, running builtins in place, forking and executing external
//! programs, managing process group IDs and the controlling terminal, and
//! waiting on foreground jobs or handing them to the background table.

pub mod foreground;
pub mod job_control;
pub mod streams;

use self::{
    job_control::SHELL_TERM,
    streams::{STDERR, STDIN, STDOUT},
};
use super::{job::Job, signals, status::Status, Shell};
use nix::{
    errno::Errno,
    fcntl::OFlag,
    libc,
    sys::signal::Signal,
    unistd::{self, ForkResult, Pid},
};
use std::{env, ffi::CString};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Status reported when a redirection target or a pipe could not be opened.
pub const IO_FAILURE: Status = Status::FAILURE;
/// Status reported when a stage could not be forked.
pub const FORK_FAILURE: Status = Status::COULD_NOT_EXEC;

/// An error that aborted the launch of, or the wait on, a job.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{path}: {}", .source.desc())]
    Redirection {
        path:   String,
        #[source]
        source: nix::Error,
    },
    #[error("failed to create a pipe: {}", .0.desc())]
    Pipe(#[source] nix::Error),
    #[error("failed to fork {name}: {}", .source.desc())]
    Fork {
        name:   String,
        #[source]
        source: nix::Error,
    },
    #[error("failed to wait on the job: {}", .0.desc())]
    WaitPid(#[source] nix::Error),
}

impl PipelineError {
    /// The launcher's result code for this failure.
    pub fn status(&self) -> Status {
        match self {
            PipelineError::Fork { .. } => FORK_FAILURE,
            _ => IO_FAILURE,
        }
    }
}

/// What became of a launched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job ran to completion while the shell waited on it.
    Completed(Status),
    /// The job was registered in the background table under this slot.
    Background(usize),
    /// The job stopped while in the foreground and now sits in this slot.
    Stopped(usize),
    /// An interrupt abandoned the wait; the job's children keep running.
    Interrupted,
}

impl JobOutcome {
    /// The exit code the shell records for this outcome.
    pub fn status(self) -> Status {
        match self {
            JobOutcome::Completed(status) => status,
            JobOutcome::Background(_) => Status::SUCCESS,
            JobOutcome::Stopped(_) => Status::from_signal(Signal::SIGTSTP as i32),
            JobOutcome::Interrupted => Status::INTERRUPTED,
        }
    }
}

/// Puts `pid` into the job's process group, creating the group from `pid` if
/// the job has none yet, and hands the terminal to a foreground job. Both the
/// parent and the freshly forked child call this for the same pid, so whichever
/// runs second only confirms what the first did. Does nothing unless the shell
/// is interactive.
pub(crate) fn join_process_group(
    job: &mut Job,
    pid: Pid,
    interactive: bool,
) -> nix::Result<Option<Pid>> {
    if !interactive {
        return Ok(None);
    }
    let pgid = job.assign_group(pid);
    match unistd::setpgid(pid, pgid) {
        // The child already exec'd; its own call has placed it.
        Ok(()) | Err(Errno::EACCES) => (),
        Err(why) => return Err(why),
    }
    if !job.background {
        let _ = unistd::tcsetpgrp(SHELL_TERM, pgid);
    }
    Ok(Some(pgid))
}

/// Runs in the forked child: resets signals, applies the stage's environment
/// overrides and descriptors, then replaces the process image. Never returns,
/// and never unwinds into the shell's own cleanup.
fn exec_child(job: &mut Job, index: usize, interactive: bool) -> ! {
    let _ = join_process_group(job, unistd::getpid(), interactive);
    signals::restore_defaults();

    let process = &job.processes[index];
    for (key, value) in &process.env {
        env::remove_var(key);
        env::set_var(key, value);
    }

    if let Err(why) = process.fds.redirect_onto_std() {
        eprintln!("jobsh: {}: failed to redirect descriptors: {}", process.name(), why.desc());
        exit_child(Status::FAILURE);
    }

    let args: Result<Vec<CString>, _> =
        process.argv.iter().map(|arg| CString::new(arg.as_bytes())).collect();
    let args = match args {
        Ok(args) => args,
        Err(_) => {
            eprintln!("jobsh: {}: argument contains a nul byte", process.name());
            exit_child(Status::COULD_NOT_EXEC);
        }
    };
    let program = match args.first() {
        Some(program) => program,
        None => exit_child(Status::SUCCESS),
    };

    let why = match unistd::execvp(program, &args) {
        Ok(never) => match never {},
        Err(why) => why,
    };
    eprintln!("jobsh: {}: {}", process.name(), why.desc());
    exit_child(match why {
        Errno::ENOENT => Status::NO_SUCH_COMMAND,
        _ => Status::COULD_NOT_EXEC,
    })
}

fn exit_child(status: Status) -> ! { unsafe { libc::_exit(status.as_os_code()) } }

impl Shell {
    /// Launches a job: opens its redirections, connects its stages with pipes,
    /// runs builtins in place and forks everything else, then waits on it or
    /// sends it to the background.
    ///
    /// A failure to open a redirection aborts before any stage runs. A failure
    /// to fork aborts the remaining stages; stages already forked are left
    /// running.
    pub fn launch(&mut self, mut job: Job) -> Result<JobOutcome, PipelineError> {
        // An interrupt that arrived at the prompt does not belong to this job.
        signals::take(signals::SIGINT);

        if job.processes.is_empty() {
            return Ok(JobOutcome::Completed(Status::SUCCESS));
        }

        let endpoints = streams::open_redirections(&job.redirects)?;
        let last = job.processes.len() - 1;
        job.processes[0].fds.set(STDIN, endpoints.stdin());
        job.processes[last].fds.set(STDOUT, endpoints.stdout());
        job.processes[last].fds.set(STDERR, endpoints.stderr());
        job.wait = !self.opts.interactive || !job.background;

        for index in 0..=last {
            if index != last {
                match unistd::pipe2(OFlag::O_CLOEXEC) {
                    Ok((reader, writer)) => {
                        job.processes[index].fds.set(STDOUT, writer);
                        job.processes[index + 1].fds.set(STDIN, reader);
                    }
                    Err(why) => {
                        job.release_fds(index);
                        return Err(PipelineError::Pipe(why));
                    }
                }
            }

            let dispatched = self.dispatch(&mut job, index);
            job.processes[index].fds.cleanup();
            if let Err(why) = dispatched {
                job.release_fds(index + 1);
                return Err(why);
            }
        }

        if job.is_completed() {
            return Ok(JobOutcome::Completed(job.status()));
        }

        if !job.wait {
            let slot = self.send_to_background(job, false);
            println!("[{}] launched", slot);
            Ok(JobOutcome::Background(slot))
        } else if !self.opts.interactive {
            Ok(match self.wait_for_job(&mut job)? {
                job_control::WaitResult::Completed(status) => JobOutcome::Completed(status),
                job_control::WaitResult::Interrupted => JobOutcome::Interrupted,
                job_control::WaitResult::Stopped => {
                    let slot = self.send_to_background(job, false);
                    println!("[{}] stopped", slot);
                    JobOutcome::Stopped(slot)
                }
            })
        } else {
            self.send_to_foreground(job, false)
        }
    }

    /// Runs one stage: a registered builtin is called in place with the stage's
    /// descriptor slots, anything else is forked and executed.
    fn dispatch(&mut self, job: &mut Job, index: usize) -> Result<(), PipelineError> {
        if let Some(main) = self.builtins.lookup(job.processes[index].name()) {
            trace!(name = job.processes[index].name(), "running builtin");
            let status = main(self, &job.processes[index]);
            job.processes[index].finish(status);
            return Ok(());
        }

        match unsafe { (self.fork)() } {
            Ok(ForkResult::Child) => exec_child(job, index, self.opts.interactive),
            Ok(ForkResult::Parent { child }) => {
                match join_process_group(job, child, self.opts.interactive) {
                    Ok(pgid) => debug!(
                        pid = child.as_raw(),
                        ?pgid,
                        "forked {}",
                        job.processes[index].name()
                    ),
                    Err(why) => warn!(pid = child.as_raw(), "failed to set process group: {}", why),
                }
                job.processes[index].pid = Some(child);
                Ok(())
            }
            Err(source) => {
                Err(PipelineError::Fork { name: job.processes[index].name().to_owned(), source })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::{
        job::{Process, RedirectMode},
        Options,
    };
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use serial_test::serial;
    use std::{
        fs,
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, Instant},
    };

    static FORKS_ALLOWED: AtomicUsize = AtomicUsize::new(0);

    /// Forks until the allowance runs out, then fails the way a full process
    /// table does.
    unsafe fn rationed_fork() -> nix::Result<ForkResult> {
        if FORKS_ALLOWED.load(Ordering::SeqCst) == 0 {
            return Err(Errno::EAGAIN);
        }
        FORKS_ALLOWED.fetch_sub(1, Ordering::SeqCst);
        unistd::fork()
    }

    fn batch_shell() -> Shell { Shell::new(Options { interactive: false, no_exec: false }).unwrap() }

    fn open_fds() -> usize { fs::read_dir("/proc/self/fd").unwrap().count() }

    fn no_children_left() -> bool {
        waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) == Err(Errno::ECHILD)
    }

    #[test]
    #[serial]
    fn builtin_pipelines_run_in_place_without_leaking_descriptors() {
        let mut shell = batch_shell();
        let dir = tempfile::tempdir().unwrap();

        for stages in 1..=5 {
            let output = dir.path().join(format!("help-{}", stages));
            let job = Job::new((0..stages).map(|_| Process::new(vec!["help"])))
                .redirect(STDOUT, &output, RedirectMode::Truncate);

            let before = open_fds();
            let outcome = shell.launch(job).unwrap();
            assert_eq!(outcome, JobOutcome::Completed(Status::SUCCESS));
            assert_eq!(open_fds(), before, "descriptor leaked by a {}-stage job", stages);
            assert!(fs::read_to_string(&output).unwrap().contains("jobsh"));
        }
        assert!(no_children_left());
    }

    #[test]
    #[serial]
    fn external_pipeline_connects_every_stage() {
        let mut shell = batch_shell();
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("count");

        let job = Job::new(vec![
            Process::new(vec!["printf", "b\\na\\nb\\n"]),
            Process::new(vec!["sort", "-u"]),
            Process::new(vec!["wc", "-l"]),
        ])
        .redirect(STDOUT, &output, RedirectMode::Truncate);

        let before = open_fds();
        assert_eq!(shell.launch(job).unwrap(), JobOutcome::Completed(Status::SUCCESS));
        assert_eq!(open_fds(), before);
        assert_eq!(fs::read_to_string(&output).unwrap().trim(), "2");
    }

    #[test]
    #[serial]
    fn missing_input_aborts_before_forking() {
        let mut shell = batch_shell();
        let dir = tempfile::tempdir().unwrap();
        let job = Job::new(vec![Process::new(vec!["cat"]), Process::new(vec!["wc"])])
            .redirect(STDIN, dir.path().join("missing"), RedirectMode::Read);

        let before = open_fds();
        let err = shell.launch(job).unwrap_err();
        assert_eq!(err.status(), IO_FAILURE);
        assert!(matches!(err, PipelineError::Redirection { source: Errno::ENOENT, .. }));
        assert_eq!(open_fds(), before);
        assert!(no_children_left());
    }

    #[test]
    #[serial]
    fn fork_failure_aborts_the_remaining_stages() {
        let mut shell = batch_shell();
        shell.fork = rationed_fork;
        FORKS_ALLOWED.store(1, Ordering::SeqCst);
        let dir = tempfile::tempdir().unwrap();

        let job = Job::new(vec![
            Process::new(vec!["sleep", "1"]),
            Process::new(vec!["cat"]),
            Process::new(vec!["wc", "-l"]),
        ])
        .redirect(STDOUT, dir.path().join("count"), RedirectMode::Truncate);

        let before = open_fds();
        let err = shell.launch(job).unwrap_err();
        assert_eq!(err.status(), FORK_FAILURE);
        match err {
            PipelineError::Fork { name, source } => {
                assert_eq!(name, "cat");
                assert_eq!(source, Errno::EAGAIN);
            }
            other => panic!("expected a fork failure, got {:?}", other),
        }
        assert_eq!(open_fds(), before);

        // The first stage is still running; nothing past the failure was forked.
        let flags = Some(WaitPidFlag::WNOHANG);
        assert_eq!(waitpid(Pid::from_raw(-1), flags), Ok(WaitStatus::StillAlive));
        let finished = loop {
            match waitpid(Pid::from_raw(-1), None) {
                Err(Errno::EINTR) => continue,
                result => break result.unwrap(),
            }
        };
        assert!(matches!(finished, WaitStatus::Exited(_, 0)));
        assert!(no_children_left());
        signals::take(signals::SIGCHLD);
    }

    #[test]
    #[serial]
    fn exit_status_of_the_last_stage_is_reported() {
        let mut shell = batch_shell();
        let job = Job::new(vec![
            Process::new(vec!["sh", "-c", "exit 4"]),
            Process::new(vec!["sh", "-c", "cat >/dev/null; exit 3"]),
        ]);
        assert_eq!(shell.launch(job).unwrap(), JobOutcome::Completed(Status::from_exit_code(3)));
    }

    #[test]
    #[serial]
    fn environment_overrides_reach_the_child() {
        let mut shell = batch_shell();
        env::set_var("JOBSH_TEST_OVERRIDE", "outer");
        let job = Job::new(vec![Process::new(vec![
            "sh",
            "-c",
            "test \"$JOBSH_TEST_OVERRIDE\" = inner",
        ])
        .with_env("JOBSH_TEST_OVERRIDE", "inner")]);

        assert_eq!(shell.launch(job).unwrap(), JobOutcome::Completed(Status::SUCCESS));
        assert_eq!(env::var("JOBSH_TEST_OVERRIDE").unwrap(), "outer");
        env::remove_var("JOBSH_TEST_OVERRIDE");
    }

    #[test]
    #[serial]
    fn unknown_program_exits_with_not_found() {
        let mut shell = batch_shell();
        let job = Job::new(vec![Process::new(vec!["jobsh-no-such-program"])]);
        assert_eq!(shell.launch(job).unwrap(), JobOutcome::Completed(Status::NO_SUCH_COMMAND));
    }

    #[test]
    #[serial]
    fn process_group_assignment_is_idempotent() {
        let mut job = Job::new(vec![Process::new(vec!["sleep"])]).background();
        let mut child_view = job.clone();

        match unsafe { unistd::fork() }.unwrap() {
            ForkResult::Child => {
                let code = match join_process_group(&mut child_view, unistd::getpid(), true) {
                    Ok(Some(pgid)) if pgid == unistd::getpid() => 0,
                    _ => 1,
                };
                std::thread::sleep(Duration::from_millis(200));
                exit_child(Status::from_exit_code(code));
            }
            ForkResult::Parent { child } => {
                let pgid = join_process_group(&mut job, child, true).unwrap();
                assert_eq!(pgid, Some(child));
                assert_eq!(unistd::getpgid(Some(child)).unwrap(), child);
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
                assert_eq!(job.pgid, Some(child));
            }
        }
    }

    #[test]
    #[serial]
    fn interrupt_abandons_the_foreground_wait() {
        let mut shell = batch_shell();
        signals::set_exit_code(Status::SUCCESS);

        let target = unsafe { libc::pthread_self() };
        let interrupter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            unsafe { libc::pthread_kill(target, libc::SIGINT) };
        });

        let started = Instant::now();
        let outcome = shell.launch(Job::new(vec![Process::new(vec!["sleep", "5"])])).unwrap();
        interrupter.join().unwrap();

        assert_eq!(outcome, JobOutcome::Interrupted);
        assert_eq!(signals::exit_code(), Status::INTERRUPTED);
        assert!(started.elapsed() < Duration::from_secs(4));

        // The child was abandoned, not killed, and is still tracked.
        let child = shell.active_child.get().unwrap();
        nix::sys::signal::kill(child, Signal::SIGKILL).unwrap();
        waitpid(child, None).unwrap();
        shell.active_child.clear();
        signals::take(signals::SIGCHLD);
        signals::restore_defaults();
    }
}
