pub mod binary;
pub mod directory;
pub mod job;
pub mod pipe_exec;
pub mod reaper;
pub mod signals;
pub mod status;

use self::{
    directory::DirectoryState,
    pipe_exec::{
        foreground::ActiveChild,
        job_control::{JobTable, SHELL_TERM},
        PipelineError,
    },
    status::Status,
};
use crate::{
    builtins::BuiltinMap,
    parser::{self, ParseError},
};
use nix::{
    errno::Errno,
    sys::signal::{self as nix_signal, Signal},
    unistd,
};
use thiserror::Error;
use tracing::debug;

/// Errors from execution
#[derive(Debug, Error)]
pub enum ShellError {
    /// Parsing failed
    #[error("syntax error: {0}")]
    InvalidSyntax(#[from] ParseError),
    /// Failed to run a pipeline
    #[error("{0}")]
    PipelineExecutionError(#[from] PipelineError),
    /// The signal handlers could not be installed
    #[error("failed to install signal handlers: {}", .0.desc())]
    SignalSetup(#[source] nix::Error),
    /// The terminal could not be taken over
    #[error("failed to take control of the terminal: {}", .0.desc())]
    Terminal(#[source] nix::Error),
}

impl ShellError {
    /// The exit status recorded when a command line fails this way.
    pub fn status(&self) -> Status {
        match self {
            ShellError::InvalidSyntax(_) => Status::BAD_ARG,
            ShellError::PipelineExecutionError(why) => why.status(),
            ShellError::SignalSetup(_) | ShellError::Terminal(_) => Status::FAILURE,
        }
    }
}

/// Options for the shell
#[derive(Debug, Clone, Copy, Default, Hash, PartialEq, Eq)]
pub struct Options {
    /// Whether the shell owns a terminal: jobs get their own process groups
    /// and foreground jobs get the terminal.
    pub interactive: bool,
    /// Do not execute any commands given to the shell.
    pub no_exec: bool,
}

/// The state of one shell session. It is created once at startup, and lives
/// until the shell exits.
pub struct Shell {
    /// Contains a list of built-in commands that were registered when the
    /// shell started.
    pub(crate) builtins: BuiltinMap,
    /// Jobs that are attached to, but not waited on by, the shell.
    pub(crate) background: JobTable,
    /// The pid a foreground wait is currently blocked on.
    pub(crate) active_child: ActiveChild,
    /// Remembers the prior working directory for `cd -`.
    pub(crate) directory: DirectoryState,
    pub(crate) opts: Options,
    /// Creates the process for each external stage.
    pub(crate) fork: ForkFn,
}

/// The signature of `nix::unistd::fork`.
pub(crate) type ForkFn = unsafe fn() -> nix::Result<unistd::ForkResult>;

impl Shell {
    /// Create a new shell with the standard builtins
    pub fn new(opts: Options) -> Result<Self, ShellError> {
        Self::with_builtins(opts, BuiltinMap::new())
    }

    /// Create a shell with custom builtins. Installs the handlers for
    /// `SIGINT`, `SIGQUIT` and `SIGCHLD`.
    pub fn with_builtins(opts: Options, builtins: BuiltinMap) -> Result<Self, ShellError> {
        signals::install().map_err(ShellError::SignalSetup)?;
        Ok(Shell {
            builtins,
            background: JobTable::new(),
            active_child: ActiveChild::new(),
            directory: DirectoryState::new(),
            opts,
            fork: unistd::fork,
        })
    }

    pub fn opts(&self) -> &Options { &self.opts }

    pub fn background_jobs(&self) -> &JobTable { &self.background }

    /// The status of the last foreground command, or the interrupt code.
    pub fn previous_status(&self) -> Status { signals::exit_code() }

    /// Makes an interactive shell the owner of its terminal: waits until it is
    /// in the foreground, ignores the terminal stop signals, moves into its own
    /// process group and takes the terminal.
    pub fn init_terminal(&mut self) -> Result<(), ShellError> {
        if !self.opts.interactive {
            return Ok(());
        }

        loop {
            let owner = unistd::tcgetpgrp(SHELL_TERM).map_err(ShellError::Terminal)?;
            if owner == unistd::getpgrp() {
                break;
            }
            let _ = nix_signal::killpg(unistd::getpgrp(), Signal::SIGTTIN);
        }

        signals::ignore_job_control().map_err(ShellError::Terminal)?;
        let pid = unistd::getpid();
        match unistd::setpgid(pid, pid) {
            // A session leader already leads its own group.
            Ok(()) | Err(Errno::EPERM) => (),
            Err(why) => return Err(ShellError::Terminal(why)),
        }
        unistd::tcsetpgrp(SHELL_TERM, pid).map_err(ShellError::Terminal)?;
        debug!(pgid = pid.as_raw(), "took control of the terminal");
        Ok(())
    }

    /// Puts the signal dispositions back the way the shell found them.
    pub fn teardown(&mut self) {
        debug!(jobs = self.background.len(), "tearing down the session");
        signals::restore_defaults();
    }

    /// Collects any children that changed state since the last call.
    pub fn reap_pending(&mut self) -> usize {
        if signals::take(signals::SIGCHLD) {
            self.reap(None)
        } else {
            0
        }
    }

    /// Parses and runs one command line, recording its exit status as the
    /// shell's exit code. An empty line leaves the exit code untouched.
    pub fn execute_command(&mut self, line: &str) -> Result<Status, ShellError> {
        let job = match parser::parse(line)? {
            Some(job) => job,
            None => return Ok(self.previous_status()),
        };
        if self.opts.no_exec {
            return Ok(Status::SUCCESS);
        }

        debug!(command = %job, "launching");
        let status = self.launch(job)?.status();
        signals::set_exit_code(status);
        Ok(status)
    }

    /// Runs a command line and reports any failure on stderr.
    pub fn on_command(&mut self, line: &str) -> Status {
        match self.execute_command(line) {
            Ok(status) => status,
            Err(why) => {
                eprintln!("jobsh: {}", why);
                let status = why.status();
                signals::set_exit_code(status);
                status
            }
        }
    }
}
