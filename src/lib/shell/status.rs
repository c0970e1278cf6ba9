use nix::sys::wait::WaitStatus;
use std::fmt;

/// The exit status of a command, a pipeline, or the shell itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct Status(i32);

impl Status {
    pub const BAD_ARG: Self = Status(2);
    pub const COULD_NOT_EXEC: Self = Status(126);
    pub const FAILURE: Self = Status(1);
    /// Forced onto the shell when an interrupt arrives.
    pub const INTERRUPTED: Self = Status(130);
    pub const NO_SUCH_COMMAND: Self = Status(127);
    pub const SUCCESS: Self = Status(0);
    pub const TERMINATED: Self = Status(143);

    pub fn from_signal(signal: i32) -> Self { Status(128 + signal) }

    pub fn from_exit_code(code: i32) -> Self { Status(code) }

    /// Converts a terminal wait status into an exit status. Stops, continues and
    /// "still alive" answers carry no exit status.
    pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Status(code)),
            WaitStatus::Signaled(_, signal, _) => Some(Self::from_signal(signal as i32)),
            _ => None,
        }
    }

    pub fn as_os_code(self) -> i32 { self.0 }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}
