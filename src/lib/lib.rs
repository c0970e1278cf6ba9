//! `jobsh` is a small interactive shell built around its job execution and
//! process-group control subsystem: pipelines are wired up with pipes and
//! redirections, builtins run inside the shell process, external programs are
//! forked into a shared process group, and children are reaped as `SIGCHLD`
//! arrives.

#![allow(unknown_lints)]

pub mod builtins;
pub mod parser;
pub mod shell;

pub use crate::shell::{
    binary::{Binary, MAN_JOBSH},
    job::{Job, Process, RedirectMode, Redirection},
    pipe_exec::{job_control::JobTable, JobOutcome, PipelineError},
    status::Status,
    Options, Shell, ShellError,
};

pub fn version() -> &'static str { include!(concat!(env!("OUT_DIR"), "/version_string")) }
