use std::ffi::CString;

use anyhow::{bail, Context, Result};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, fork, ForkResult};
use storage_tracer::{Config, Error, HandshakeRegion, Ptracer, TracerSession};
use structopt::StructOpt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Run a command, redirecting its opens of external-storage paths.
#[derive(StructOpt, Debug)]
struct Opt {
    /// Rewrite paths under PREFIX to start with REPLACEMENT instead, as PREFIX=REPLACEMENT.
    #[structopt(short, long, parse(try_from_str = parse_mapping))]
    map: Vec<(String, String)>,

    /// Treat only these prefixes as external storage.
    #[structopt(short, long)]
    prefix: Vec<String>,

    #[structopt(min_values = 1)]
    argv: Vec<String>,
}

fn parse_mapping(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((from, to)) => Ok((from.to_owned(), to.to_owned())),
        None => bail!("expected PREFIX=REPLACEMENT, got `{}`", s),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::from_args();

    let argv = opt
        .argv
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .context("argument contains a NUL byte")?;

    if argv.is_empty() {
        bail!("no command given");
    }

    let mut config = Config::default();

    if !opt.prefix.is_empty() {
        config.set_prefixes(opt.prefix.clone());
    }

    let region = HandshakeRegion::create()?;

    match unsafe { fork() }? {
        ForkResult::Child => {
            // Only async-signal-safe calls until `exec()`.
            if region.app_handshake().is_ok() {
                region.app_cleanup();
                let _ = execvp(&argv[0], &argv);
            }

            unsafe { libc::_exit(127) }
        },
        ForkResult::Parent { child } => {
            let maps = opt.map;
            let policy = move |path: &str, _mode: i32| {
                maps.iter().find_map(|(from, to)| {
                    path.strip_prefix(from.as_str()).map(|rest| format!("{}{}", to, rest))
                })
            };

            let mut session = TracerSession::attach(Ptracer::new(), region, child, policy, config)?;
            let res = session.run();
            let stats = session.teardown();

            match res {
                Ok(()) => {},
                // Already reaped by the tracer.
                Err(Error::Signaled { signal, .. }) => bail!("command killed by {}", signal),
                Err(err) => warn!(%err, "tracing ended early"),
            }

            info!(rewrites = stats.rewrites, "done");

            match waitpid(child, None)? {
                WaitStatus::Exited(_, code) => std::process::exit(code),
                WaitStatus::Signaled(_, signal, _) => bail!("command killed by {}", signal),
                status => bail!("unexpected wait status: {:?}", status),
            }
        },
    }
}
