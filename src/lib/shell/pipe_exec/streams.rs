//! The three standard descriptor slots of a pipeline stage, and the opening of
//! redirection targets that feed them.

use super::PipelineError;
use crate::shell::job::{RedirectMode, Redirection};
use nix::{
    fcntl::{self, OFlag},
    sys::stat::Mode,
    unistd,
};
use std::{io, os::unix::io::RawFd};

pub const STDIN: usize = 0;
pub const STDOUT: usize = 1;
pub const STDERR: usize = 2;

/// Permission bits for files created by output redirection, before the umask.
const FILE_MASK: u32 = 0o666;

/// Descriptor slots for stdin, stdout and stderr. A slot holding its own index
/// is inherited from the shell; anything else is owned by the slot and closed
/// exactly once by `cleanup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdTable([RawFd; 3]);

impl Default for FdTable {
    fn default() -> Self { Self::inherited() }
}

impl FdTable {
    pub const fn inherited() -> Self { FdTable([0, 1, 2]) }

    pub fn stdin(&self) -> RawFd { self.0[STDIN] }

    pub fn stdout(&self) -> RawFd { self.0[STDOUT] }

    pub fn stderr(&self) -> RawFd { self.0[STDERR] }

    /// Stores `fd` in `slot`. Whatever the slot owned before must already be
    /// accounted for by the caller.
    pub fn set(&mut self, slot: usize, fd: RawFd) { self.0[slot] = fd; }

    pub fn is_owned(&self, slot: usize) -> bool { self.0[slot] != slot as RawFd }

    /// Closes every owned slot and resets it to the inherited descriptor, so a
    /// second call is a no-op.
    pub fn cleanup(&mut self) {
        for (slot, fd) in self.0.iter_mut().enumerate() {
            if *fd != slot as RawFd {
                if let Err(why) = unistd::close(*fd) {
                    tracing::warn!(fd = *fd, "failed to close descriptor: {}", why);
                }
                *fd = slot as RawFd;
            }
        }
    }

    /// Duplicates the owned slots onto descriptors 0, 1 and 2. Only called in a
    /// freshly forked child; the originals are close-on-exec.
    pub fn redirect_onto_std(&self) -> nix::Result<()> {
        for (slot, &fd) in self.0.iter().enumerate() {
            if fd != slot as RawFd {
                unistd::dup2(fd, slot as RawFd)?;
            }
        }
        Ok(())
    }
}

fn open_flags(mode: RedirectMode) -> OFlag {
    let flags = match mode {
        RedirectMode::Read => OFlag::O_RDONLY,
        RedirectMode::Truncate => OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
        RedirectMode::Append => OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND,
    };
    flags | OFlag::O_CLOEXEC
}

/// Opens the redirection targets of a job, in stdin/stdout/stderr order.
/// Slots without a redirection stay inherited. If any target fails to open,
/// everything opened so far is closed again and the error is returned.
pub fn open_redirections(redirects: &[Option<Redirection>; 3]) -> Result<FdTable, PipelineError> {
    let mut table = FdTable::inherited();
    for (slot, redirect) in redirects.iter().enumerate() {
        let redirect = match redirect {
            Some(redirect) => redirect,
            None => continue,
        };
        let mode = Mode::from_bits_truncate(FILE_MASK as _);
        match fcntl::open(redirect.path.as_path(), open_flags(redirect.mode), mode) {
            Ok(fd) => table.set(slot, fd),
            Err(source) => {
                table.cleanup();
                return Err(PipelineError::Redirection {
                    path: redirect.path.display().to_string(),
                    source,
                });
            }
        }
    }
    Ok(table)
}

/// A non-owning writer over a raw descriptor, used by builtins to write into
/// whatever their stdout or stderr slot points at.
#[derive(Debug, Clone, Copy)]
pub struct FdWriter(pub RawFd);

impl io::Write for FdWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match unistd::write(self.0, buf) {
                Ok(written) => break Ok(written),
                Err(nix::Error::EINTR) => continue,
                Err(errno) => break Err(io::Error::from_raw_os_error(errno as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}
