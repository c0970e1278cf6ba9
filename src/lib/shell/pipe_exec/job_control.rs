use super::{super::Shell, JobOutcome, PipelineError};
use crate::shell::{job::Job, signals, status::Status};
use nix::{
    errno::Errno,
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd,
};
use std::{collections::BTreeMap, fmt};
use tracing::{debug, trace};

/// The descriptor whose controlling terminal the shell arbitrates.
pub(crate) const SHELL_TERM: i32 = nix::libc::STDIN_FILENO;

#[derive(Clone, Copy, Hash, Debug, PartialEq, Eq)]
/// Defines whether a background job is running or stopped.
pub enum ProcessState {
    Running,
    Stopped,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ProcessState::Running => write!(f, "Running"),
            ProcessState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// A change to a background job caused by a reaped child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobEvent {
    /// Every member has terminated; the job has left the table.
    Completed { slot: usize, status: Status },
    /// Every remaining member is stopped.
    Stopped { slot: usize },
    /// A member changed state but the job as a whole did not.
    Progressed { slot: usize },
}

impl JobEvent {
    pub fn slot(self) -> usize {
        match self {
            JobEvent::Completed { slot, .. }
            | JobEvent::Stopped { slot }
            | JobEvent::Progressed { slot } => slot,
        }
    }

    /// Whether the user is told about this event.
    pub fn is_reported(self) -> bool {
        match self {
            JobEvent::Progressed { .. } => false,
            _ => true,
        }
    }
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            JobEvent::Completed { slot, status } => {
                write!(f, "[{}] completed. Exit: {}", slot, status)
            }
            JobEvent::Stopped { slot } => write!(f, "[{}] stopped", slot),
            JobEvent::Progressed { slot } => write!(f, "[{}] running", slot),
        }
    }
}

/// Jobs that are attached to, but not waited on by, the shell, keyed by the
/// slot number shown to the user. Slots start at 1 and freed slots are reused.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: BTreeMap<usize, Job>,
}

impl JobTable {
    pub fn new() -> Self { JobTable::default() }

    /// Stores the job under the lowest free slot and returns that slot.
    pub fn insert(&mut self, job: Job) -> usize {
        let slot = (1..).find(|slot| !self.jobs.contains_key(slot)).unwrap_or(1);
        self.jobs.insert(slot, job);
        slot
    }

    pub fn remove(&mut self, slot: usize) -> Option<Job> { self.jobs.remove(&slot) }

    pub fn get(&self, slot: usize) -> Option<&Job> { self.jobs.get(&slot) }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Job> { self.jobs.get_mut(&slot) }

    /// The most recently numbered job, the default target of `fg` and `bg`.
    pub fn last_slot(&self) -> Option<usize> { self.jobs.keys().next_back().copied() }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Job)> {
        self.jobs.iter().map(|(&slot, job)| (slot, job))
    }

    pub fn len(&self) -> usize { self.jobs.len() }

    pub fn is_empty(&self) -> bool { self.jobs.is_empty() }

    /// Applies a wait status to the job owning the reported pid. A job whose
    /// members have all terminated is removed. Returns `None` when no job in
    /// the table owns the pid.
    pub fn record(&mut self, status: WaitStatus) -> Option<JobEvent> {
        let pid = status.pid()?;
        let (slot, job) = self.jobs.iter_mut().find(|(_, job)| job.contains(pid))?;
        let slot = *slot;
        let was_stopped = job.is_stopped();
        job.record(status);

        if job.is_completed() {
            let status = job.status();
            self.jobs.remove(&slot);
            Some(JobEvent::Completed { slot, status })
        } else if job.is_stopped() && !was_stopped {
            Some(JobEvent::Stopped { slot })
        } else {
            Some(JobEvent::Progressed { slot })
        }
    }
}

/// How a blocking wait on a job ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitResult {
    Completed(Status),
    Stopped,
    Interrupted,
}

impl Shell {
    /// Registers a job in the background table without giving it the terminal.
    /// If `cont` is set, the job's process group is sent `SIGCONT` first.
    pub fn send_to_background(&mut self, mut job: Job, cont: bool) -> usize {
        if cont {
            if let Err(why) = signals::resume(&job) {
                eprintln!("jobsh: failed to continue {}: {}", job, why.desc());
            }
            job.mark_running();
        }
        let slot = self.background.insert(job);
        debug!(slot, "job sent to the background");
        slot
    }

    /// Gives the terminal to the job's process group, waits until it completes
    /// or stops, then takes the terminal back. A stopped job is kept in the
    /// background table.
    pub fn send_to_foreground(
        &mut self,
        mut job: Job,
        cont: bool,
    ) -> Result<JobOutcome, PipelineError> {
        let terminal = if self.opts.interactive { job.pgid } else { None };
        if let Some(pgid) = terminal {
            debug!(pgid = pgid.as_raw(), "handing the terminal to the job");
            let _ = unistd::tcsetpgrp(SHELL_TERM, pgid);
        }
        if cont {
            if let Err(why) = signals::resume(&job) {
                eprintln!("jobsh: failed to continue {}: {}", job, why.desc());
            }
            job.mark_running();
        }

        let waited = self.wait_for_job(&mut job);

        if terminal.is_some() {
            let _ = unistd::tcsetpgrp(SHELL_TERM, unistd::getpgrp());
        }

        Ok(match waited? {
            WaitResult::Completed(status) => JobOutcome::Completed(status),
            WaitResult::Interrupted => JobOutcome::Interrupted,
            WaitResult::Stopped => {
                let slot = self.background.insert(job);
                println!("[{}] stopped", slot);
                JobOutcome::Stopped(slot)
            }
        })
    }

    /// Blocks until every forked member of the job has terminated, or until the
    /// job stops, or until an interrupt arrives. The job's tracked pid is
    /// published in the active-child cell while blocked, so the reaper can tell
    /// it apart from background children.
    ///
    /// Members are polled with `WNOHANG`; in between, the shell sleeps on the
    /// signal wake pipe, so no interrupt is missed between the check of the
    /// pending flags and the block.
    pub(crate) fn wait_for_job(&mut self, job: &mut Job) -> Result<WaitResult, PipelineError> {
        if let Some(pid) = job.tracked_pid() {
            self.active_child.set(pid);
        }

        let result = loop {
            if job.is_completed() {
                break WaitResult::Completed(job.status());
            }
            if job.is_stopped() {
                break WaitResult::Stopped;
            }
            // The interrupted job is abandoned, not killed. Its pid stays in
            // the active-child cell so the reaper collects it silently.
            if signals::take(signals::SIGINT) {
                debug!(pgid = ?job.pgid, "foreground wait interrupted");
                return Ok(WaitResult::Interrupted);
            }
            let pid = match job.next_pending() {
                Some(pid) => pid,
                None => break WaitResult::Completed(job.status()),
            };

            match waitpid(pid, Some(WaitPidFlag::WUNTRACED | WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if signals::take(signals::SIGCHLD) {
                        self.reap(Some(&mut *job));
                    } else if let Err(why) = signals::wait_readable(None) {
                        self.active_child.clear();
                        return Err(PipelineError::WaitPid(why));
                    }
                }
                Ok(status) => {
                    trace!(pid = pid.as_raw(), ?status, "foreground child changed state");
                    job.record(status);
                }
                Err(Errno::EINTR) => (),
                Err(Errno::ECHILD) => job.mark_reaped(pid),
                Err(why) => {
                    self.active_child.clear();
                    return Err(PipelineError::WaitPid(why));
                }
            }
        };

        self.active_child.clear();
        Ok(result)
    }

    /// Resumes a stopped background job in place.
    pub fn resume_background(&mut self, slot: usize) -> Result<(), String> {
        let job = self.background.get_mut(slot).ok_or_else(|| format!("job {} does not exist", slot))?;
        if !job.is_stopped() {
            return Err(format!("job {} is already running", slot));
        }
        signals::resume(job)
            .map_err(|why| format!("failed to continue job {}: {}", slot, why.desc()))?;
        job.mark_running();
        Ok(())
    }

    /// Moves a background job to the foreground, continuing it if stopped.
    pub fn resume_foreground(&mut self, slot: usize) -> Result<JobOutcome, String> {
        let job = self.background.remove(slot).ok_or_else(|| format!("job {} does not exist", slot))?;
        let cont = job.is_stopped();
        println!("{}", job);
        self.send_to_foreground(job, cont).map_err(|why| why.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::{
        job::Process,
        reaper::{reap_children, SystemWaiter},
        Options,
    };
    use nix::{sys::signal::Signal, unistd::Pid};
    use serial_test::serial;
    use std::time::Duration;

    fn job_with_pids(pids: &[i32]) -> Job {
        Job::new(pids.iter().map(|&pid| {
            let mut process = Process::new(vec!["cmd"]);
            process.pid = Some(Pid::from_raw(pid));
            process
        }))
        .background()
    }

    #[test]
    fn slots_start_at_one_and_are_reused() {
        let mut table = JobTable::new();
        assert_eq!(table.insert(job_with_pids(&[1])), 1);
        assert_eq!(table.insert(job_with_pids(&[2])), 2);
        assert_eq!(table.insert(job_with_pids(&[3])), 3);
        assert!(table.remove(2).is_some());
        assert_eq!(table.insert(job_with_pids(&[4])), 2);
        assert_eq!(table.last_slot(), Some(3));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn completed_job_leaves_the_table() {
        let mut table = JobTable::new();
        table.insert(job_with_pids(&[10]));
        let slot = table.insert(job_with_pids(&[20, 21]));

        assert_eq!(
            table.record(WaitStatus::Exited(Pid::from_raw(20), 0)),
            Some(JobEvent::Progressed { slot })
        );
        let event = table.record(WaitStatus::Exited(Pid::from_raw(21), 7));
        assert_eq!(event, Some(JobEvent::Completed { slot, status: Status::from_exit_code(7) }));
        assert_eq!(event.unwrap().to_string(), "[2] completed. Exit: 7");
        assert!(table.get(slot).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn stop_is_reported_once() {
        let mut table = JobTable::new();
        let slot = table.insert(job_with_pids(&[30]));
        let stop = WaitStatus::Stopped(Pid::from_raw(30), Signal::SIGTSTP);

        assert_eq!(table.record(stop), Some(JobEvent::Stopped { slot }));
        assert_eq!(table.record(stop), Some(JobEvent::Progressed { slot }));
        assert!(table.get(slot).unwrap().is_stopped());
    }

    #[test]
    fn unknown_pids_are_not_claimed() {
        let mut table = JobTable::new();
        table.insert(job_with_pids(&[40]));
        assert_eq!(table.record(WaitStatus::Exited(Pid::from_raw(41), 0)), None);
        assert_eq!(table.len(), 1);
    }

    fn batch_shell() -> Shell { Shell::new(Options { interactive: false, no_exec: false }).unwrap() }

    /// A job whose only member stops itself once, then exits with `code`.
    fn self_stopping_job(code: i32) -> Job {
        Job::new(vec![Process::new(vec![
            "sh".to_owned(),
            "-c".to_owned(),
            format!("kill -STOP $$; exit {}", code),
        ])])
    }

    #[test]
    #[serial]
    fn job_stopped_in_the_foreground_is_kept_and_resumed_by_fg() {
        let mut shell = batch_shell();

        let outcome = shell.launch(self_stopping_job(5)).unwrap();
        assert_eq!(outcome, JobOutcome::Stopped(1));
        assert_eq!(outcome.status(), Status::from_exit_code(148));
        let stopped = shell.background.get(1).unwrap();
        assert!(stopped.is_stopped());
        assert_eq!(stopped.pgid, None);

        let resumed = shell.resume_foreground(1).unwrap();
        assert_eq!(resumed, JobOutcome::Completed(Status::from_exit_code(5)));
        assert!(shell.background.is_empty());
        assert_eq!(shell.active_child.get(), None);

        signals::take(signals::SIGCHLD);
        signals::restore_defaults();
    }

    #[test]
    #[serial]
    fn bg_continues_a_job_without_a_process_group() {
        let mut shell = batch_shell();
        assert_eq!(shell.launch(self_stopping_job(6)).unwrap(), JobOutcome::Stopped(1));

        shell.resume_background(1).unwrap();
        assert!(!shell.background.get(1).unwrap().is_stopped());
        assert_eq!(shell.resume_background(1), Err("job 1 is already running".to_owned()));

        let mut out = Vec::new();
        for _ in 0..100 {
            reap_children(
                &mut SystemWaiter,
                &shell.active_child,
                &mut shell.background,
                None,
                &mut out,
            );
            if shell.background.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(String::from_utf8(out).unwrap(), "[1] completed. Exit: 6\n");

        signals::take(signals::SIGCHLD);
        signals::restore_defaults();
    }
}
