//! Per-thread syscall-stop parity.
//!
//! Syscall-enter-stop and syscall-exit-stop are indistinguishable from each other by the
//! tracer. From the ptrace(2) manual:
//!
//! > The tracer needs to keep track of the sequence of ptrace-stops in order to not
//! > misinterpret syscall-enter-stop as syscall-exit-stop or vice versa.  In general,
//! > a syscall-enter-stop is always followed by syscall-exit-stop, PTRACE_EVENT stop,
//! > or the tracee's death; no other kinds of ptrace-stop can occur in between.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::ptracer::Pid;

/// Which half of a syscall the next syscall-stop of a thread represents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    AwaitingEnter,
    AwaitingExit,
}

impl Default for Phase {
    fn default() -> Self {
        Phase::AwaitingEnter
    }
}

impl Phase {
    fn flipped(self) -> Self {
        match self {
            Phase::AwaitingEnter => Phase::AwaitingExit,
            Phase::AwaitingExit => Phase::AwaitingEnter,
        }
    }
}

/// Phase of every known thread, and the threads whose attach-stop is still pending.
///
/// A thread with no entry is in [`Phase::AwaitingEnter`].
#[derive(Clone, Debug, Default)]
pub struct PhaseTracker {
    phases: BTreeMap<i32, Phase>,

    // New threads start with a `SIGSTOP` which must not reach the app.
    attaching: BTreeSet<i32>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, pid: Pid) -> Phase {
        self.phases.get(&pid.as_raw()).copied().unwrap_or_default()
    }

    pub fn is_known(&self, pid: Pid) -> bool {
        self.phases.contains_key(&pid.as_raw()) || self.attaching.contains(&pid.as_raw())
    }

    /// Start tracking `pid` in [`Phase::AwaitingEnter`].
    pub fn insert(&mut self, pid: Pid) {
        self.phases.insert(pid.as_raw(), Phase::AwaitingEnter);
    }

    /// Record a syscall-stop of `pid`, returning the phase it is now in.
    ///
    /// A result of [`Phase::AwaitingExit`] means this stop was a syscall-enter-stop.
    pub fn flip(&mut self, pid: Pid) -> Phase {
        let entry = self.phases.entry(pid.as_raw()).or_default();
        *entry = entry.flipped();
        let phase = *entry;

        trace!(pid = pid.as_raw(), ?phase, "syscall-stop");

        phase
    }

    /// Note a thread announced by a clone event, if it hasn't already been seen.
    pub fn mark_new_thread(&mut self, pid: Pid) {
        if !self.is_known(pid) {
            self.expect_attach_stop(pid);
        }
    }

    /// Expect the next `SIGSTOP` of `pid` to be its attach-stop.
    pub fn expect_attach_stop(&mut self, pid: Pid) {
        self.attaching.insert(pid.as_raw());
        self.phases.entry(pid.as_raw()).or_default();
    }

    /// Decide whether a `SIGSTOP` for `pid` is its attach-stop, consuming the expectation.
    ///
    /// The attach-stop of a new thread may be reported before the clone event of its
    /// creator. A thread we have never seen is therefore also in its attach-stop.
    pub fn take_attach_stop(&mut self, pid: Pid) -> bool {
        if self.attaching.remove(&pid.as_raw()) {
            return true;
        }

        if !self.phases.contains_key(&pid.as_raw()) {
            self.insert(pid);
            return true;
        }

        false
    }

    /// Stop tracking an exiting thread.
    pub fn forget(&mut self, pid: Pid) {
        self.phases.remove(&pid.as_raw());
        self.attaching.remove(&pid.as_raw());
    }

    /// Move the state of `old` to `new`, after a non-leader thread execs and takes over
    /// the thread group id.
    pub fn rename(&mut self, old: Pid, new: Pid) {
        let phase = self.phases.remove(&old.as_raw()).unwrap_or_default();
        self.attaching.remove(&old.as_raw());
        self.phases.insert(new.as_raw(), phase);
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}
