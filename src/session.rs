//! Attach to an app and run its syscall-stop event loop.

use nix::errno::Errno;
use nix::sys::wait::WaitStatus;
use tracing::{debug, error, info, warn};

use crate::abi;
use crate::config::Config;
use crate::error::{AttachError, Error, Result, ResultExt};
use crate::handshake::HandshakeRegion;
use crate::phase::{Phase, PhaseTracker};
use crate::ptracer::{is_group_stop, ExitType, Pid, Ptrace, Ptracer, Restart, Signal};
use crate::rewrite::{self, PathPolicy, Rewrite};

/// Counters kept over the life of a session, logged on teardown.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    pub syscall_stops: u64,
    pub open_calls: u64,
    pub rewrites: u64,
    pub rewrite_failures: u64,
    pub threads_created: u64,
    pub threads_exited: u64,
}

/// A traced app, from attach until its last thread exits.
///
/// Must be driven from the thread that attached. Never shared across threads.
pub struct TracerSession<P: Ptrace = Ptracer> {
    ptrace: P,
    pid: Pid,
    scratch: Vec<u8>,
    live_threads: usize,
    phases: PhaseTracker,
    policy: Box<dyn PathPolicy>,
    config: Config,
    stats: Stats,

    // Signal reported before the attach-stop, delivered on the first restart.
    initial_signal: Option<Signal>,
}

impl<P: Ptrace> TracerSession<P> {
    /// Attach to the app `pid` once it reports ready through `region`.
    ///
    /// The app is released by posting tracer-ready. On failure it is still released if
    /// [`Config::release_app_on_failure()`] is set, and then runs untraced. `region` is
    /// dropped before returning on every path.
    pub fn attach<F>(
        mut ptrace: P,
        region: HandshakeRegion,
        pid: Pid,
        policy: F,
        config: Config,
    ) -> std::result::Result<Self, AttachError>
    where
        F: PathPolicy + 'static,
    {
        let attached = attach_stopped(&mut ptrace, &region, pid, &config);

        let (initial_signal, scratch) = match attached {
            Ok(attached) => attached,
            Err(err) => {
                error!(pid = pid.as_raw(), %err, "could not attach to app");

                if config.release_app_on_failure() {
                    if let Err(err) = region.tracer_signal().post() {
                        warn!(pid = pid.as_raw(), %err, "could not release app");
                    } else {
                        warn!(pid = pid.as_raw(), "releasing app untraced");
                    }
                }

                return Err(err);
            },
        };

        region.tracer_signal().post().map_err(AttachError::Handshake)?;
        drop(region);

        info!(pid = pid.as_raw(), "attached to app");

        let mut phases = PhaseTracker::new();
        phases.insert(pid);

        if initial_signal.is_some() {
            phases.expect_attach_stop(pid);
        }

        Ok(Self {
            ptrace,
            pid,
            scratch,
            live_threads: 1,
            phases,
            policy: Box::new(policy),
            config,
            stats: Stats::default(),
            initial_signal,
        })
    }

    /// Thread group id of the traced app.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Threads that have been created and not yet reported exiting.
    pub fn live_threads(&self) -> usize {
        self.live_threads
    }

    /// Trace until every thread of the app has exited.
    ///
    /// Returns early with an error if a thread is killed by a signal, or on any failure
    /// that leaves the thread bookkeeping unreliable.
    pub fn run(&mut self) -> Result<()> {
        if !abi::SUPPORTED {
            warn!("syscall interposition is unsupported on this architecture, only tracing");
        }

        let signal = self.initial_signal.take();
        self.restart(self.pid, Restart::Syscall, signal)?;

        while self.live_threads > 0 {
            let status = self.wait()?;
            self.handle(status)?;
        }

        info!(pid = self.pid.as_raw(), "all app threads exited");

        Ok(())
    }

    /// End the session, releasing the scratch buffer.
    pub fn teardown(self) -> Stats {
        let stats = self.stats;

        info!(
            pid = self.pid.as_raw(),
            syscall_stops = stats.syscall_stops,
            open_calls = stats.open_calls,
            rewrites = stats.rewrites,
            rewrite_failures = stats.rewrite_failures,
            threads_created = stats.threads_created,
            threads_exited = stats.threads_exited,
            "tracer session ended",
        );

        stats
    }

    fn wait(&mut self) -> Result<WaitStatus> {
        loop {
            match self.ptrace.wait_any() {
                Err(Errno::EINTR) => continue,
                res => return res.map_err(Error::Wait),
            }
        }
    }

    fn restart(&mut self, pid: Pid, restart: Restart, signal: Option<Signal>) -> Result<()> {
        let res = self.ptrace.restart(pid, restart, signal).died_if_esrch(pid);

        match res {
            Err(err) if err.tracee_died() => {
                debug!(pid = pid.as_raw(), "thread died before restart");
                Ok(())
            },
            res => res,
        }
    }

    fn handle(&mut self, status: WaitStatus) -> Result<()> {
        match status {
            WaitStatus::PtraceSyscall(pid) =>
                self.on_syscall_stop(pid),
            WaitStatus::PtraceEvent(pid, _, event) if event == libc::PTRACE_EVENT_CLONE =>
                self.on_clone(pid),
            WaitStatus::PtraceEvent(pid, _, event) if event == libc::PTRACE_EVENT_EXIT =>
                self.on_exit(pid),
            WaitStatus::PtraceEvent(pid, _, event) if event == libc::PTRACE_EVENT_EXEC =>
                self.on_exec(pid),
            WaitStatus::Stopped(pid, signal) =>
                self.on_signal_stop(pid, signal),
            WaitStatus::Exited(pid, code) => {
                debug!(pid = pid.as_raw(), code, "thread reaped");
                Ok(())
            },
            WaitStatus::Signaled(pid, signal, core_dumped) => {
                error!(pid = pid.as_raw(), %signal, core_dumped, "app thread killed by signal");
                Err(Error::Signaled { pid, signal })
            },
            status => {
                error!(?status, live_threads = self.live_threads, "unexpected wait status");
                Err(Error::UnexpectedStatus { status: format!("{:?}", status) })
            },
        }
    }

    fn on_syscall_stop(&mut self, pid: Pid) -> Result<()> {
        self.stats.syscall_stops += 1;

        if self.phases.flip(pid) == Phase::AwaitingExit && abi::SUPPORTED {
            let res = rewrite::interpose_on_open(
                &mut self.ptrace,
                pid,
                &mut self.scratch,
                self.policy.as_mut(),
                &self.config,
            );

            match res {
                Ok(Rewrite::NotOpen) => {},
                Ok(Rewrite::Redirected { .. }) => {
                    self.stats.open_calls += 1;
                    self.stats.rewrites += 1;
                },
                Ok(_) => {
                    self.stats.open_calls += 1;
                },
                Err(err) if err.tracee_died() => {
                    debug!(pid = pid.as_raw(), "thread died in syscall-enter-stop");
                    return Ok(());
                },
                Err(err @ Error::CommitRegisters { .. }) => {
                    self.stats.open_calls += 1;
                    self.stats.rewrite_failures += 1;
                    error!(pid = pid.as_raw(), %err, "replacement staged but not installed");
                },
                Err(err @ Error::ReplacementTooLong { .. }) | Err(err @ Error::InvalidReplacement) => {
                    self.stats.open_calls += 1;
                    self.stats.rewrite_failures += 1;
                    error!(pid = pid.as_raw(), %err, "policy returned an unusable replacement");
                },
                Err(err) if err.is_transient() => {
                    self.stats.open_calls += 1;
                    self.stats.rewrite_failures += 1;
                    warn!(pid = pid.as_raw(), %err, "leaving open unmodified");
                },
                Err(err) => return Err(err),
            }
        }

        self.restart(pid, Restart::Syscall, None)
    }

    fn on_clone(&mut self, pid: Pid) -> Result<()> {
        let msg = self
            .ptrace
            .event_message(pid)
            .died_if_esrch_or(pid, |source| Error::EventMessage { pid, source });

        // The new thread exists even if its creator has since died.
        self.live_threads += 1;
        self.stats.threads_created += 1;

        match msg {
            Ok(tid) => {
                let tid = Pid::from_raw(tid as i32);
                debug!(pid = pid.as_raw(), tid = tid.as_raw(), live_threads = self.live_threads, "new thread");
                self.phases.mark_new_thread(tid);
            },
            Err(err) if err.tracee_died() => {
                debug!(pid = pid.as_raw(), "thread died in clone event stop");
                return Ok(());
            },
            Err(err) => return Err(err),
        }

        self.restart(pid, Restart::Syscall, None)
    }

    fn on_exit(&mut self, pid: Pid) -> Result<()> {
        match self.ptrace.event_message(pid) {
            Ok(status) => match ExitType::parse(status as u16) {
                Ok(exit) => debug!(pid = pid.as_raw(), ?exit, "thread exiting"),
                Err(_) => debug!(pid = pid.as_raw(), status, "thread exiting"),
            },
            Err(err) => debug!(pid = pid.as_raw(), %err, "thread exiting, status unknown"),
        }

        self.live_threads = match self.live_threads.checked_sub(1) {
            Some(live) => live,
            None => internal_error!("exit event with no live threads"),
        };
        self.stats.threads_exited += 1;
        self.phases.forget(pid);

        // Syscall-stops are not re-armed, so the thread can finish exiting.
        self.restart(pid, Restart::Continue, None)
    }

    fn on_exec(&mut self, pid: Pid) -> Result<()> {
        let msg = self
            .ptrace
            .event_message(pid)
            .died_if_esrch_or(pid, |source| Error::EventMessage { pid, source });

        let former = match msg {
            Ok(former) => Pid::from_raw(former as i32),
            Err(err) if err.tracee_died() => {
                debug!(pid = pid.as_raw(), "thread died in exec event stop");
                return Ok(());
            },
            Err(err) => return Err(err),
        };

        if former != pid {
            debug!(pid = pid.as_raw(), former = former.as_raw(), "non-leader thread exec'd");
            self.phases.rename(former, pid);
        } else {
            debug!(pid = pid.as_raw(), "exec");
        }

        self.restart(pid, Restart::Syscall, None)
    }

    fn on_signal_stop(&mut self, pid: Pid, signal: Signal) -> Result<()> {
        if signal == Signal::SIGSTOP && self.phases.take_attach_stop(pid) {
            debug!(pid = pid.as_raw(), "attach-stop");
            return self.restart(pid, Restart::Syscall, None);
        }

        let group_stop = match is_group_stop(&mut self.ptrace, pid, signal) {
            Ok(group_stop) => group_stop,
            Err(Errno::ESRCH) => {
                debug!(pid = pid.as_raw(), "thread died in signal-delivery-stop");
                return Ok(());
            },
            Err(err) => return Err(Error::OS(err)),
        };

        if group_stop {
            debug!(pid = pid.as_raw(), %signal, "group-stop");
            return self.restart(pid, Restart::Syscall, None);
        }

        debug!(pid = pid.as_raw(), %signal, "delivering signal");
        self.restart(pid, Restart::Syscall, Some(signal))
    }
}

// Attach and configure, leaving the app in its attach-stop.
fn attach_stopped<P: Ptrace + ?Sized>(
    ptrace: &mut P,
    region: &HandshakeRegion,
    pid: Pid,
    config: &Config,
) -> std::result::Result<(Option<Signal>, Vec<u8>), AttachError> {
    region.app_signal().wait().map_err(AttachError::Handshake)?;

    debug!(pid = pid.as_raw(), "app ready, attaching");

    ptrace
        .attach(pid)
        .map_err(|source| AttachError::AttachFailed { pid, source })?;

    let res = configure(ptrace, pid, config);

    if res.is_err() {
        if let Err(err) = ptrace.detach(pid, None) {
            debug!(pid = pid.as_raw(), %err, "could not detach after failed attach");
        }
    }

    res
}

fn configure<P: Ptrace + ?Sized>(
    ptrace: &mut P,
    pid: Pid,
    config: &Config,
) -> std::result::Result<(Option<Signal>, Vec<u8>), AttachError> {
    let initial_signal = wait_attach_stop(ptrace, pid)?;

    ptrace
        .set_options(pid, config.options())
        .map_err(|source| AttachError::OptionsFailed { pid, source })?;

    let len = config.max_path();
    let mut scratch = Vec::new();
    scratch
        .try_reserve_exact(len)
        .map_err(|source| AttachError::ScratchAllocFailed { len, source })?;

    Ok((initial_signal, scratch))
}

// Wait for the first stop after `PTRACE_ATTACH`.
//
// If it is some other signal, the attach-stop is still pending, and the signal must be
// delivered on the first restart.
fn wait_attach_stop<P: Ptrace + ?Sized>(ptrace: &mut P, pid: Pid) -> std::result::Result<Option<Signal>, AttachError> {
    let status = loop {
        match ptrace.wait_for(pid) {
            Err(Errno::EINTR) => continue,
            Err(source) => return Err(AttachError::WaitFailed { pid, source }),
            Ok(status) => break status,
        }
    };

    match status {
        WaitStatus::Stopped(_, Signal::SIGSTOP) => Ok(None),
        WaitStatus::Stopped(_, signal) => {
            debug!(pid = pid.as_raw(), %signal, "signal-delivery-stop before attach-stop");
            Ok(Some(signal))
        },
        status => {
            warn!(pid = pid.as_raw(), ?status, "app did not stop after attach");
            Err(AttachError::WaitFailed { pid, source: Errno::ESRCH })
        },
    }
}
