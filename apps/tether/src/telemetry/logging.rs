//! Process-wide `tracing` setup for the tether binary.
//!
//! Our own crates follow the requested verbosity. At `trace` everything else
//! drops to `debug`, and the WebRTC stack is held at `info` unless
//! `TETHER_TRACE_DEPS` asks for its packet-level output too.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;

const FILTER_VAR: &str = "TETHER_LOG_FILTER";
const TRACE_DEPS_VAR: &str = "TETHER_TRACE_DEPS";

/// Log targets of our own code.
const OWN_TARGETS: &[&str] = &["tether", "tether_core"];

/// Crates behind the peer connection; chatty at debug and below.
const WEBRTC_STACK: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_srtp",
    "webrtc_mdns",
    "webrtc_util",
    "interceptor",
    "rtp",
    "rtcp",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
    /// Raw `EnvFilter` directives; replaces the level-derived filter.
    pub filter: Option<String>,
    /// Let the WebRTC stack log below `info` at trace level.
    pub trace_dependencies: bool,
}

impl LogConfig {
    /// Flag values plus the `TETHER_LOG_FILTER` and `TETHER_TRACE_DEPS`
    /// overrides from the environment.
    pub fn from_env(level: LogLevel, file: Option<PathBuf>) -> Self {
        Self {
            level,
            file,
            filter: std::env::var(FILTER_VAR)
                .ok()
                .filter(|filter| !filter.trim().is_empty()),
            trace_dependencies: super::env_truthy(TRACE_DEPS_VAR).unwrap_or(false),
        }
    }

    /// `EnvFilter` directives for this configuration.
    pub fn directives(&self) -> String {
        if let Some(filter) = &self.filter {
            return filter.clone();
        }
        let own = LevelFilter::from(self.level);
        let rest = match self.level {
            LogLevel::Trace if self.trace_dependencies => LevelFilter::TRACE,
            LogLevel::Trace => LevelFilter::DEBUG,
            LogLevel::Debug => LevelFilter::INFO,
            _ => own,
        };

        let mut directives = vec![rest.to_string().to_lowercase()];
        if own != rest {
            directives.extend(
                OWN_TARGETS
                    .iter()
                    .map(|target| format!("{target}={}", own.to_string().to_lowercase())),
            );
        }
        if self.holds_back_webrtc() {
            directives.extend(WEBRTC_STACK.iter().map(|target| format!("{target}=info")));
        }
        directives.join(",")
    }

    fn holds_back_webrtc(&self) -> bool {
        self.filter.is_none() && self.level == LogLevel::Trace && !self.trace_dependencies
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

/// Keeps the background writer flushing for the life of the process.
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Only the first successful call has an
/// effect.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let (writer, guard) = open_writer(config.file.as_deref())?;
    let verbose = config.level >= LogLevel::Debug;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.directives()))
        .with_target(verbose)
        .with_thread_ids(config.level == LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;
    let _ = GUARD.set(guard);

    if config.holds_back_webrtc() {
        tracing::debug!(
            target = "logging",
            "webrtc stack held at info; set {TRACE_DEPS_VAR}=1 or {FILTER_VAR} to see it"
        );
    }
    Ok(())
}

fn open_writer(file: Option<&Path>) -> Result<(NonBlocking, WorkerGuard), InitError> {
    let Some(path) = file else {
        return Ok(tracing_appender::non_blocking(io::stderr()));
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| InitError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(tracing_appender::non_blocking(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ENV_MUTEX;

    fn config(level: LogLevel) -> LogConfig {
        LogConfig {
            level,
            ..LogConfig::default()
        }
    }

    #[test]
    fn quiet_levels_apply_everywhere() {
        assert_eq!(config(LogLevel::Warn).directives(), "warn");
        assert_eq!(config(LogLevel::Info).directives(), "info");
    }

    #[test]
    fn debug_raises_only_our_targets() {
        assert_eq!(
            config(LogLevel::Debug).directives(),
            "info,tether=debug,tether_core=debug"
        );
    }

    #[test]
    fn trace_holds_back_the_webrtc_stack_unless_asked() {
        let held = config(LogLevel::Trace).directives();
        assert!(held.starts_with("debug,tether=trace,tether_core=trace"));
        assert!(held.contains("webrtc_ice=info"));
        assert!(held.contains("rtcp=info"));

        let open = LogConfig {
            trace_dependencies: true,
            ..config(LogLevel::Trace)
        };
        assert_eq!(open.directives(), "trace");
    }

    #[test]
    fn explicit_filter_wins() {
        let custom = LogConfig {
            filter: Some("tether_core::session=trace".into()),
            ..config(LogLevel::Trace)
        };
        assert_eq!(custom.directives(), "tether_core::session=trace");
        assert!(!custom.holds_back_webrtc());
    }

    #[test]
    fn environment_overrides_are_picked_up() {
        let _guard = ENV_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var(FILTER_VAR, "warn,tether=info");
            std::env::set_var(TRACE_DEPS_VAR, "1");
        }
        let from_env = LogConfig::from_env(LogLevel::Debug, None);
        unsafe {
            std::env::remove_var(FILTER_VAR);
            std::env::remove_var(TRACE_DEPS_VAR);
        }
        assert_eq!(from_env.filter.as_deref(), Some("warn,tether=info"));
        assert!(from_env.trace_dependencies);
        assert_eq!(LogConfig::from_env(LogLevel::Debug, None), config(LogLevel::Debug));
    }

    #[test]
    fn unwritable_log_file_is_reported() {
        let path = std::env::temp_dir()
            .join("tether-missing-dir")
            .join("nested")
            .join("tether.log");
        match open_writer(Some(&path)) {
            Err(InitError::Io { path: reported, .. }) => assert_eq!(reported, path),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("opening {path:?} should fail"),
        }
    }
}
