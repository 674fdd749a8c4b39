use crate::ptracer::{Options, REQUIRED_OPTIONS};

/// Mount points of external storage. Only paths under one of these are ever rewritten.
pub const EXTERNAL_STORAGE_PREFIXES: &[&str] = &[
    "/mnt/sdcard/",
    "/storage/self/primary/",
    "/data/media/0/",
    "/storage/emulated/0/",
    "/mnt/user/0/primary/",
];

/// Bytes left untouched below the stack pointer when staging a replacement path.
///
/// Signal frames and the x86-64 ABI red zone both live here.
pub const DEFAULT_RED_ZONE: u64 = 128;

/// Maximum path length, including the terminating NUL.
pub const DEFAULT_MAX_PATH: usize = libc::PATH_MAX as usize;

/// Settings for a tracer session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    options: Options,
    max_path: usize,
    red_zone: u64,
    prefixes: Vec<String>,
    release_app_on_failure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            options: REQUIRED_OPTIONS,
            max_path: DEFAULT_MAX_PATH,
            red_zone: DEFAULT_RED_ZONE,
            prefixes: EXTERNAL_STORAGE_PREFIXES.iter().map(|&p| p.to_owned()).collect(),
            release_app_on_failure: true,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ptrace options set on the target at attach, and inherited by its threads.
    pub fn options(&self) -> Options {
        self.options
    }

    /// Set the ptrace options applied at attach.
    ///
    /// **NOTE:** [`REQUIRED_OPTIONS`] are always set, even if unset in the passed value.
    pub fn set_options(&mut self, options: Options) {
        self.options = options | REQUIRED_OPTIONS;
    }

    /// Size of the scratch buffer, and the longest path (with NUL) read or written.
    pub fn max_path(&self) -> usize {
        self.max_path
    }

    pub fn set_max_path(&mut self, max_path: usize) {
        self.max_path = max_path;
    }

    pub fn red_zone(&self) -> u64 {
        self.red_zone
    }

    pub fn set_red_zone(&mut self, red_zone: u64) {
        self.red_zone = red_zone;
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    /// Replace the recognized path prefixes. Matching is exact and case-sensitive.
    pub fn set_prefixes<I, S>(&mut self, prefixes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefixes = prefixes.into_iter().map(Into::into).collect();
    }

    /// Whether a failed attach still posts tracer-ready, so the app runs untraced.
    pub fn release_app_on_failure(&self) -> bool {
        self.release_app_on_failure
    }

    pub fn set_release_app_on_failure(&mut self, release: bool) {
        self.release_app_on_failure = release;
    }

    /// `true` if `path` starts with one of the recognized prefixes.
    pub fn is_external(&self, path: &[u8]) -> bool {
        self.prefixes.iter().any(|p| path.starts_with(p.as_bytes()))
    }
}
