//! Word-granular access to tracee memory.
//!
//! `PTRACE_PEEKDATA` and `PTRACE_POKEDATA` move one `long` at a time. All chunking and
//! partial-word handling lives here; callers deal in byte slices.

use std::convert::TryInto;

use crate::error::{Error, Result, ResultExt};
use crate::ptracer::{Pid, Ptrace};

/// Bytes transferred by a single peek or poke.
pub const WORD: usize = std::mem::size_of::<libc::c_long>();

fn peek<P: Ptrace + ?Sized>(ptrace: &mut P, pid: Pid, addr: u64) -> Result<[u8; WORD]> {
    let word = ptrace
        .peek(pid, addr)
        .died_if_esrch_or(pid, |source| Error::ReadMemory { pid, addr, source })?;

    Ok(word.to_ne_bytes())
}

fn poke<P: Ptrace + ?Sized>(ptrace: &mut P, pid: Pid, addr: u64, bytes: [u8; WORD]) -> Result<()> {
    let word = libc::c_long::from_ne_bytes(bytes);

    ptrace
        .poke(pid, addr, word)
        .died_if_esrch_or(pid, |source| Error::WriteMemory { pid, addr, source })
}

/// Read `len` bytes of tracee memory starting at `addr`.
pub fn read_target_bytes<P: Ptrace + ?Sized>(ptrace: &mut P, pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(len);

    while data.len() < len {
        let word = peek(ptrace, pid, addr.wrapping_add(data.len() as u64))?;
        let take = WORD.min(len - data.len());
        data.extend_from_slice(&word[..take]);
    }

    Ok(data)
}

/// Write `bytes` to tracee memory starting at `addr`.
///
/// Bytes past the end of `bytes` in the final word are preserved. Writes are not atomic:
/// if a word faults, the words before it have already been written.
pub fn write_target_bytes<P: Ptrace + ?Sized>(ptrace: &mut P, pid: Pid, addr: u64, bytes: &[u8]) -> Result<()> {
    let mut chunks = bytes.chunks_exact(WORD);
    let mut offset = 0u64;

    for chunk in &mut chunks {
        let word: [u8; WORD] = chunk.try_into().unwrap_or([0; WORD]);
        poke(ptrace, pid, addr.wrapping_add(offset), word)?;
        offset += WORD as u64;
    }

    let tail = chunks.remainder();

    if !tail.is_empty() {
        let at = addr.wrapping_add(offset);
        let mut word = peek(ptrace, pid, at)?;
        word[..tail.len()].copy_from_slice(tail);
        poke(ptrace, pid, at, word)?;
    }

    Ok(())
}

/// Read the NUL-terminated string at `addr` into `buf`, returning its length.
///
/// `buf` is cleared first, and receives the string without its NUL. At most `max` bytes
/// are examined, counting the NUL; a longer string is [`Error::UnterminatedPath`].
pub fn read_target_cstr<P: Ptrace + ?Sized>(
    ptrace: &mut P,
    pid: Pid,
    addr: u64,
    buf: &mut Vec<u8>,
    max: usize,
) -> Result<usize> {
    buf.clear();

    loop {
        let word = peek(ptrace, pid, addr.wrapping_add(buf.len() as u64))?;

        for &byte in &word {
            if byte == 0 {
                return Ok(buf.len());
            }

            // No room left for the NUL.
            if buf.len() + 1 >= max {
                return Err(Error::UnterminatedPath { pid, addr, max });
            }

            buf.push(byte);
        }
    }
}
