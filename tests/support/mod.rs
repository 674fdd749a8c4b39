use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::FromRawFd;

use anyhow::Result;
use nix::unistd::{self, fork, ForkResult, Pid};
use storage_tracer::HandshakeRegion;

/// Fork an app which completes its side of the handshake, then execs `argv`.
///
/// Returns the app pid, the parent's view of `region`, and the read end of a pipe
/// connected to the app's stdout.
#[allow(unused)]
pub fn fork_app(region: HandshakeRegion, argv: &[&str]) -> Result<(Pid, HandshakeRegion, File)> {
    let args = argv
        .iter()
        .map(|arg| CString::new(*arg))
        .collect::<Result<Vec<_>, _>>()?;

    let mut ptrs: Vec<*const libc::c_char> = args.iter().map(|arg| arg.as_ptr()).collect();
    ptrs.push(std::ptr::null());

    let (read_fd, write_fd) = unistd::pipe()?;

    // The test harness is multithreaded, so the child must not allocate before `exec()`.
    match unsafe { fork() }? {
        ForkResult::Child => unsafe {
            libc::close(read_fd);
            libc::dup2(write_fd, libc::STDOUT_FILENO);
            libc::close(write_fd);

            if region.app_handshake().is_ok() {
                region.app_cleanup();
                libc::execvp(ptrs[0], ptrs.as_ptr());
            }

            libc::_exit(127)
        },
        ForkResult::Parent { child } => {
            unistd::close(write_fd)?;
            let stdout = unsafe { File::from_raw_fd(read_fd) };

            Ok((child, region, stdout))
        },
    }
}
