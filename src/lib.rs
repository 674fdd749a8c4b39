#[macro_use]
pub mod error;

pub mod abi;
#[cfg(target_arch = "aarch64")]
pub mod aarch64;
pub mod config;
pub mod handshake;
pub mod memory;
pub mod phase;
pub mod ptracer;
pub mod rewrite;
pub mod session;
#[cfg(target_arch = "x86_64")]
pub mod x86;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{AttachError, Error, SetupError};
pub use handshake::{HandshakeRegion, Semaphore};
pub use ptracer::{Pid, Ptrace, Ptracer, Registers, Restart, Signal};
pub use rewrite::{PathPolicy, Rewrite};
pub use session::{Stats, TracerSession};
