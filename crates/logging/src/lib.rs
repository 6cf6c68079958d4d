//! Brume Logging
//!
//! Shared `tracing` setup for everything built on the Brume crates.
//!
//! Pool layers log every build step at `debug`, slot readiness at `info`,
//! retries and consensus disagreements at `warn`. The level set here applies
//! to the `brume*` targets only; third-party crates (hyper in particular)
//! stay at `warn` unless `RUST_LOG` says otherwise.
//!
//! ## Usage
//!
//! ```no_run
//! use brume_logging::{init, LogLevel};
//!
//! init(LogLevel::Info);
//!
//! // Or from a CLI-style verbosity count
//! init(LogLevel::from_verbosity(2));
//! ```

use tracing_subscriber::EnvFilter;

/// Crate targets that follow the configured level
const BRUME_TARGETS: &[&str] = &["brume", "brume_pool", "brume_tor", "brume_rpc", "brume_core"];

/// Log level for the Brume targets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    /// Slot readiness and disagreements (default)
    #[default]
    Info,
    /// Every dial, handshake, extension and self-test round
    Debug,
    Trace,
}

impl LogLevel {
    /// `false` → `Info`, `true` → `Debug`
    pub fn from_verbose(verbose: bool) -> Self {
        if verbose {
            Self::Debug
        } else {
            Self::Info
        }
    }

    /// `0` → `Info`, `1` → `Debug`, `2+` → `Trace`
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => Self::Info,
            1 => Self::Debug,
            _ => Self::Trace,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    /// Filter directives: `warn` globally, this level for the Brume targets
    fn directives(&self) -> String {
        let mut directives = String::from("warn");
        for target in BRUME_TARGETS {
            directives.push(',');
            directives.push_str(target);
            directives.push('=');
            directives.push_str(self.as_str());
        }
        directives
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.directives()))
    }
}

/// Initialize logging with the specified level
///
/// # Panics
///
/// Panics if a global subscriber is already installed. Use [`try_init`]
/// when that can happen.
pub fn init(level: LogLevel) {
    try_init(level).expect("Failed to initialize logging");
}

/// Try to initialize logging, returning an error if already initialized
pub fn try_init(level: LogLevel) -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(level.filter())
        .with_target(false)
        .try_init()
        .map_err(|e| e.to_string())
}

/// Initialize logging, optionally printing the emitting module
pub fn init_with_target(level: LogLevel, show_target: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(level.filter())
        .with_target(show_target)
        .init();
}

/// Debug-level logging captured by the test harness; safe to call from every test
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(LogLevel::Debug.filter())
        .with_test_writer()
        .try_init();
}
