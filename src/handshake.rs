//! Process-shared readiness signals that order attach before the app resumes.
//!
//! The forker creates a [`HandshakeRegion`] before forking the app and the tracer. The
//! app posts *app-ready* and waits on *tracer-ready*; the tracer waits on *app-ready*,
//! attaches, then posts *tracer-ready*. Every process holding the mapping releases it
//! once, after its last use of the signals.

use std::cell::UnsafeCell;
use std::io;
use std::mem::ManuallyDrop;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::{
    sys::mman::{self, MapFlags, ProtFlags},
    unistd::{self, SysconfVar},
};
use tracing::{debug, warn};

use crate::error::SetupError;

const FALLBACK_PAGE_SIZE: usize = 4096;

/// A single-permit, process-shared POSIX semaphore.
#[repr(transparent)]
pub struct Semaphore {
    sem: UnsafeCell<libc::sem_t>,
}

impl Semaphore {
    // SAFETY: caller must pass a pointer to writable memory for a `sem_t`, which
    // outlives every use of the semaphore.
    unsafe fn init(sem: *mut Semaphore) -> io::Result<()> {
        let res = libc::sem_init(sem as *mut libc::sem_t, 1, 0);

        if res == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    fn as_ptr(&self) -> *mut libc::sem_t {
        self.sem.get()
    }

    /// Increment the semaphore, waking one waiter.
    pub fn post(&self) -> io::Result<()> {
        let res = unsafe { libc::sem_post(self.as_ptr()) };

        if res == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Block until the semaphore can be decremented.
    pub fn wait(&self) -> io::Result<()> {
        loop {
            let res = unsafe { libc::sem_wait(self.as_ptr()) };

            if res == 0 {
                return Ok(());
            }

            let err = io::Error::last_os_error();

            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Decrement the semaphore if it is positive. Returns `false` if it was zero.
    pub fn try_wait(&self) -> io::Result<bool> {
        let res = unsafe { libc::sem_trywait(self.as_ptr()) };

        if res == 0 {
            return Ok(true);
        }

        let err = io::Error::last_os_error();

        if err.raw_os_error() == Some(libc::EAGAIN) {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

#[repr(C)]
struct Signals {
    app: Semaphore,
    tracer: Semaphore,
}

/// One page of `MAP_SHARED | MAP_ANONYMOUS` memory holding the two readiness signals.
///
/// The mapping survives `fork()`. Dropping the region unmaps this process's view; the
/// semaphores are never destroyed, since the peer process may still be using them.
pub struct HandshakeRegion {
    signals: NonNull<Signals>,
    len: usize,
}

impl HandshakeRegion {
    /// Map the region and initialize both signals to zero.
    pub fn create() -> Result<Self, SetupError> {
        let len = page_size().max(std::mem::size_of::<Signals>());
        let length = NonZeroUsize::new(len).ok_or(SetupError::Map(nix::Error::EINVAL))?;

        debug!(len, "mapping shared handshake region");

        let addr = unsafe {
            mman::mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )
        }
        .map_err(SetupError::Map)?;

        let signals = NonNull::new(addr as *mut Signals)
            .ok_or(SetupError::Map(nix::Error::ENOMEM))?;

        // From here on, dropping `region` unmaps the page on error.
        let region = Self { signals, len };

        let raw = signals.as_ptr();

        unsafe { Semaphore::init(std::ptr::addr_of_mut!((*raw).app)) }
            .map_err(|source| SetupError::Semaphore { which: "app", source })?;

        unsafe { Semaphore::init(std::ptr::addr_of_mut!((*raw).tracer)) }
            .map_err(|source| SetupError::Semaphore { which: "tracer", source })?;

        debug!("handshake region ready");

        Ok(region)
    }

    /// Signal posted by the app once it is initialized, and awaited by the tracer.
    pub fn app_signal(&self) -> &Semaphore {
        unsafe { &self.signals.as_ref().app }
    }

    /// Signal posted by the tracer once attached, and awaited by the app.
    pub fn tracer_signal(&self) -> &Semaphore {
        unsafe { &self.signals.as_ref().tracer }
    }

    /// The app side of the handshake: post app-ready, then wait for tracer-ready.
    ///
    /// Only makes `sem_post()` and `sem_wait()` calls, so it may run in a child forked
    /// from a multithreaded process.
    pub fn app_handshake(&self) -> io::Result<()> {
        self.app_signal().post()?;
        self.tracer_signal().wait()
    }

    /// Release the app's view of the region after [`app_handshake()`](Self::app_handshake).
    ///
    /// Does not log, so it is safe to call between `fork()` and `exec()`. An unmap
    /// failure is ignored.
    pub fn app_cleanup(self) {
        let region = ManuallyDrop::new(self);
        let _ = region.unmap();
    }

    /// Release the forker's view of the region once both children are forked.
    pub fn zygote_cleanup(self) {
        debug!("releasing forker view of handshake region");
        drop(self)
    }

    fn unmap(&self) -> nix::Result<()> {
        unsafe { mman::munmap(self.signals.as_ptr() as *mut libc::c_void, self.len) }
    }
}

impl Drop for HandshakeRegion {
    fn drop(&mut self) {
        if let Err(err) = self.unmap() {
            warn!(%err, "could not unmap handshake region");
        }
    }
}

fn page_size() -> usize {
    match unistd::sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => FALLBACK_PAGE_SIZE,
    }
}
