//! Scripted `Ptrace` backend for unit tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::wait::WaitStatus;

use crate::memory::WORD;
use crate::ptracer::{Options, Pid, Ptrace, Registers, Restart, Siginfo, Signal};

/// In-memory tracee state. Every thread shares one address space.
pub(crate) struct FakePtrace {
    regions: Vec<(u64, Vec<u8>)>,
    registers: BTreeMap<i32, Registers>,
    events: BTreeMap<i32, libc::c_long>,
    group_stops: BTreeSet<i32>,
    dead: BTreeSet<i32>,

    /// Returned in order by `wait_any()`. An empty queue is `ECHILD`.
    pub statuses: VecDeque<nix::Result<WaitStatus>>,

    /// Returned by `wait_for()` after a successful attach.
    pub attach_status: nix::Result<WaitStatus>,

    pub fail_attach: Option<Errno>,
    pub fail_set_options: Option<Errno>,
    pub fail_registers: Option<Errno>,
    pub fail_set_registers: Option<Errno>,

    pub attached: Vec<Pid>,
    pub detached: Vec<Pid>,
    pub options: Option<Options>,
    pub restarts: Vec<(Pid, Restart, Option<Signal>)>,
    pub peeks: usize,
    pub pokes: usize,
    pub register_commits: usize,
}

impl FakePtrace {
    pub fn new() -> Self {
        Self {
            regions: vec![],
            registers: BTreeMap::new(),
            events: BTreeMap::new(),
            group_stops: BTreeSet::new(),
            dead: BTreeSet::new(),
            statuses: VecDeque::new(),
            attach_status: Err(Errno::ECHILD),
            fail_attach: None,
            fail_set_options: None,
            fail_registers: None,
            fail_set_registers: None,
            attached: vec![],
            detached: vec![],
            options: None,
            restarts: vec![],
            peeks: 0,
            pokes: 0,
            register_commits: 0,
        }
    }

    /// Map `len` zeroed bytes at `base`.
    pub fn map(&mut self, base: u64, len: usize) {
        self.regions.push((base, vec![0; len]));
    }

    /// Copy `bytes` into mapped memory, bypassing the ptrace interface.
    pub fn write(&mut self, addr: u64, bytes: &[u8]) {
        let (region, offset) = self.region_mut(addr, bytes.len()).expect("unmapped write");
        region[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Copy `len` bytes out of mapped memory, bypassing the ptrace interface.
    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        let (region, offset) = self.region(addr, len).expect("unmapped read");
        region[offset..offset + len].to_vec()
    }

    pub fn kill(&mut self, pid: Pid) {
        self.dead.insert(pid.as_raw());
    }

    pub fn set_regs(&mut self, pid: Pid, regs: Registers) {
        self.registers.insert(pid.as_raw(), regs);
    }

    /// Registers of `pid`. Threads never given any are zeroed.
    pub fn regs(&self, pid: Pid) -> Registers {
        self.registers
            .get(&pid.as_raw())
            .copied()
            .unwrap_or_else(zeroed_registers)
    }

    pub fn set_event_message(&mut self, pid: Pid, msg: libc::c_long) {
        self.events.insert(pid.as_raw(), msg);
    }

    /// Make `siginfo()` for `pid` fail with `EINVAL`, as in a group-stop.
    pub fn group_stop(&mut self, pid: Pid) {
        self.group_stops.insert(pid.as_raw());
    }

    pub fn push_status(&mut self, status: WaitStatus) {
        self.statuses.push_back(Ok(status));
    }

    fn region(&self, addr: u64, len: usize) -> Option<(&Vec<u8>, usize)> {
        self.regions.iter().find_map(|(base, data)| {
            let end = base + data.len() as u64;

            if addr >= *base && addr.checked_add(len as u64)? <= end {
                Some((data, (addr - base) as usize))
            } else {
                None
            }
        })
    }

    fn region_mut(&mut self, addr: u64, len: usize) -> Option<(&mut Vec<u8>, usize)> {
        self.regions.iter_mut().find_map(|(base, data)| {
            let end = *base + data.len() as u64;

            if addr >= *base && addr.checked_add(len as u64)? <= end {
                Some((data, (addr - *base) as usize))
            } else {
                None
            }
        })
    }

    fn check_alive(&self, pid: Pid) -> nix::Result<()> {
        if self.dead.contains(&pid.as_raw()) {
            return Err(Errno::ESRCH);
        }

        Ok(())
    }
}

impl Ptrace for FakePtrace {
    fn attach(&mut self, pid: Pid) -> nix::Result<()> {
        self.check_alive(pid)?;

        if let Some(errno) = self.fail_attach {
            return Err(errno);
        }

        self.attached.push(pid);
        Ok(())
    }

    fn detach(&mut self, pid: Pid, _signal: Option<Signal>) -> nix::Result<()> {
        self.check_alive(pid)?;
        self.detached.push(pid);
        Ok(())
    }

    fn wait_for(&mut self, _pid: Pid) -> nix::Result<WaitStatus> {
        self.attach_status
    }

    fn wait_any(&mut self) -> nix::Result<WaitStatus> {
        self.statuses.pop_front().unwrap_or(Err(Errno::ECHILD))
    }

    fn set_options(&mut self, pid: Pid, options: Options) -> nix::Result<()> {
        self.check_alive(pid)?;

        if let Some(errno) = self.fail_set_options {
            return Err(errno);
        }

        self.options = Some(options);
        Ok(())
    }

    fn event_message(&mut self, pid: Pid) -> nix::Result<libc::c_long> {
        self.check_alive(pid)?;
        self.events.get(&pid.as_raw()).copied().ok_or(Errno::EINVAL)
    }

    fn siginfo(&mut self, pid: Pid) -> nix::Result<Siginfo> {
        self.check_alive(pid)?;

        if self.group_stops.contains(&pid.as_raw()) {
            return Err(Errno::EINVAL);
        }

        Ok(unsafe { std::mem::zeroed() })
    }

    fn restart(&mut self, pid: Pid, restart: Restart, signal: Option<Signal>) -> nix::Result<()> {
        self.check_alive(pid)?;
        self.restarts.push((pid, restart, signal));
        Ok(())
    }

    fn registers(&mut self, pid: Pid) -> nix::Result<Registers> {
        self.check_alive(pid)?;

        if let Some(errno) = self.fail_registers {
            return Err(errno);
        }

        Ok(self.regs(pid))
    }

    fn set_registers(&mut self, pid: Pid, regs: &Registers) -> nix::Result<()> {
        self.check_alive(pid)?;

        if let Some(errno) = self.fail_set_registers {
            return Err(errno);
        }

        self.register_commits += 1;
        self.registers.insert(pid.as_raw(), *regs);
        Ok(())
    }

    fn peek(&mut self, pid: Pid, addr: u64) -> nix::Result<libc::c_long> {
        self.check_alive(pid)?;
        self.peeks += 1;

        let (region, offset) = self.region(addr, WORD).ok_or(Errno::EIO)?;
        let mut word = [0u8; WORD];
        word.copy_from_slice(&region[offset..offset + WORD]);

        Ok(libc::c_long::from_ne_bytes(word))
    }

    fn poke(&mut self, pid: Pid, addr: u64, word: libc::c_long) -> nix::Result<()> {
        self.check_alive(pid)?;
        self.pokes += 1;

        let (region, offset) = self.region_mut(addr, WORD).ok_or(Errno::EIO)?;
        region[offset..offset + WORD].copy_from_slice(&word.to_ne_bytes());

        Ok(())
    }
}

fn zeroed_registers() -> Registers {
    // SAFETY: every register struct is plain integers.
    unsafe { std::mem::zeroed() }
}

/// Raw view of `regs`, for comparing register structs that lack `PartialEq`.
pub(crate) fn registers_bytes(regs: &Registers) -> Vec<u8> {
    let len = std::mem::size_of::<Registers>();
    let ptr = regs as *const Registers as *const u8;

    unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec()
}

/// Log output of a `tracing` subscriber, kept in memory.
#[derive(Clone, Default)]
pub(crate) struct CapturedLogs {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    /// A plain-text subscriber writing every event into this buffer.
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        let logs = self.clone();

        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .without_time()
            .with_writer(move || logs.clone())
            .finish()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().unwrap().is_empty()
    }

    pub fn line_containing(&self, needle: &str) -> Option<String> {
        let buf = self.buf.lock().unwrap();

        String::from_utf8_lossy(&buf)
            .lines()
            .find(|line| line.contains(needle))
            .map(str::to_owned)
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
