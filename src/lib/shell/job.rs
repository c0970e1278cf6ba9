use super::{pipe_exec::streams::FdTable, status::Status};
use itertools::Itertools;
use nix::{sys::wait::WaitStatus, unistd::Pid};
use smallvec::SmallVec;
use std::{fmt, path::PathBuf};

/// How a redirection target is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedirectMode {
    /// `< file`: the file must already exist.
    Read,
    /// `> file`: created if missing, truncated otherwise.
    Truncate,
    /// `>> file`: created if missing, written at the end.
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Redirection {
    pub path: PathBuf,
    pub mode: RedirectMode,
}

/// One stage of a pipeline: either a builtin invocation or an external program.
#[derive(Debug, Clone, PartialEq)]
pub struct Process {
    /// The program name followed by its arguments.
    pub argv: Vec<String>,
    /// Variables overridden for this stage only, applied in order before exec.
    pub env: Vec<(String, String)>,
    pub fds: FdTable,
    /// Set once the stage has been forked; builtins never get one.
    pub pid: Option<Pid>,
    pub status: Status,
    pub completed: bool,
    pub stopped: bool,
}

impl Process {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Process {
            argv:      argv.into_iter().map(Into::into).collect(),
            env:       Vec::new(),
            fds:       FdTable::inherited(),
            pid:       None,
            status:    Status::SUCCESS,
            completed: false,
            stopped:   false,
        }
    }

    pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn name(&self) -> &str { self.argv.first().map_or("", String::as_str) }

    pub(crate) fn finish(&mut self, status: Status) {
        self.status = status;
        self.completed = true;
        self.stopped = false;
    }

    /// Applies a wait status reported for this process.
    pub(crate) fn update(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::Stopped(..) => self.stopped = true,
            WaitStatus::Continued(_) => self.stopped = false,
            status => {
                if let Some(code) = Status::from_wait_status(status) {
                    self.finish(code);
                }
            }
        }
    }

    fn is_pending(&self) -> bool { !self.completed && !self.stopped }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.env {
            write!(f, "{}={} ", key, value)?;
        }
        write!(f, "{}", self.argv.iter().join(" "))
    }
}

/// A pipeline of processes sharing one process group.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Stages in pipeline order: the first reads the job's input, the last
    /// writes its output.
    pub processes: SmallVec<[Process; 4]>,
    /// Assigned from the first forked member and never changed afterwards.
    pub pgid: Option<Pid>,
    pub background: bool,
    /// Redirections for the first stage's stdin and the last stage's stdout
    /// and stderr, indexed by descriptor number.
    pub redirects: [Option<Redirection>; 3],
    /// Whether the launcher blocks on this job after dispatching it.
    pub wait: bool,
}

impl Job {
    pub fn new<I: IntoIterator<Item = Process>>(processes: I) -> Self {
        Job {
            processes:  processes.into_iter().collect(),
            pgid:       None,
            background: false,
            redirects:  [None, None, None],
            wait:       true,
        }
    }

    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    pub fn redirect(mut self, fd: usize, path: impl Into<PathBuf>, mode: RedirectMode) -> Self {
        self.redirects[fd] = Some(Redirection { path: path.into(), mode });
        self
    }

    /// Returns the job's process group, making `pid` the group leader if none
    /// has been chosen yet.
    pub(crate) fn assign_group(&mut self, pid: Pid) -> Pid { *self.pgid.get_or_insert(pid) }

    /// The forked process whose status stands for the whole job.
    pub fn tracked_pid(&self) -> Option<Pid> { self.processes.iter().rev().find_map(|p| p.pid) }

    pub fn contains(&self, pid: Pid) -> bool { self.processes.iter().any(|p| p.pid == Some(pid)) }

    pub fn is_completed(&self) -> bool { self.processes.iter().all(|p| p.completed) }

    /// True when nothing is left running but at least one member is stopped.
    pub fn is_stopped(&self) -> bool {
        !self.processes.iter().any(Process::is_pending) && self.processes.iter().any(|p| p.stopped)
    }

    /// The status of the last stage, which is the status of the pipeline.
    pub fn status(&self) -> Status { self.processes.last().map_or(Status::SUCCESS, |p| p.status) }

    /// Records a wait status against the member with a matching pid.
    /// Returns false if no member matches.
    pub fn record(&mut self, status: WaitStatus) -> bool {
        let pid = match status.pid() {
            Some(pid) => pid,
            None => return false,
        };
        match self.processes.iter_mut().find(|p| p.pid == Some(pid)) {
            Some(process) => {
                process.update(status);
                true
            }
            None => false,
        }
    }

    /// The next forked member that is still running, if any.
    pub(crate) fn next_pending(&self) -> Option<Pid> {
        self.processes.iter().filter(|p| p.is_pending()).find_map(|p| p.pid)
    }

    /// Marks a member as gone when it was collected by someone else and its
    /// status could not be recovered.
    pub(crate) fn mark_reaped(&mut self, pid: Pid) {
        if let Some(process) = self.processes.iter_mut().find(|p| p.pid == Some(pid)) {
            process.completed = true;
            process.stopped = false;
        }
    }

    pub(crate) fn mark_running(&mut self) {
        self.processes.iter_mut().for_each(|p| p.stopped = false);
    }

    /// Closes every descriptor still held by the stages from `from` onwards.
    pub(crate) fn release_fds(&mut self, from: usize) {
        self.processes.iter_mut().skip(from).for_each(|p| p.fds.cleanup());
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.processes.iter().join(" | "))?;
        const SYMBOLS: [&str; 3] = ["<", ">", "2>"];
        for (fd, redirect) in self.redirects.iter().enumerate() {
            if let Some(redirect) = redirect {
                let symbol = match (fd, redirect.mode) {
                    (1, RedirectMode::Append) => ">>",
                    (2, RedirectMode::Append) => "2>>",
                    _ => SYMBOLS[fd],
                };
                write!(f, " {} {}", symbol, redirect.path.display())?;
            }
        }
        if self.background {
            write!(f, " &")?;
        }
        Ok(())
    }
}
