//! Contains the logic for tracking the foreground child.

use nix::unistd::Pid;
use std::sync::atomic::{AtomicI32, Ordering};

const NONE: i32 = 0;

/// The pid the launcher is currently blocked on. Written by the launcher before
/// it waits and cleared by whichever path collects that child first: the
/// foreground wait itself or the reaper. Zero means no child is tracked.
#[derive(Debug, Default)]
pub struct ActiveChild(AtomicI32);

impl ActiveChild {
    pub const fn new() -> Self { ActiveChild(AtomicI32::new(NONE)) }

    pub fn set(&self, pid: Pid) { self.0.store(pid.as_raw(), Ordering::SeqCst); }

    pub fn get(&self) -> Option<Pid> {
        match self.0.load(Ordering::SeqCst) {
            NONE => None,
            pid => Some(Pid::from_raw(pid)),
        }
    }

    pub fn is(&self, pid: Pid) -> bool { self.0.load(Ordering::SeqCst) == pid.as_raw() }

    pub fn clear(&self) { self.0.store(NONE, Ordering::SeqCst); }
}
