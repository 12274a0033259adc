//! Subscriber setup for applications and tests that embed a call session.
//!
//! Session and coordinator events are emitted under the `call_session` and
//! `session_description` targets. The webrtc stack logs heavily below `warn`,
//! so its targets are capped unless the directives name them explicitly.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;

const LOG_ENV: &str = "CALL_SESSION_LOG";
const LOG_FILE_ENV: &str = "CALL_SESSION_LOG_FILE";

const DEFAULT_DIRECTIVES: &str = "warn,call_session=info,session_description=info";
const TEST_DIRECTIVES: &str = "warn,call_session=debug,session_description=debug";

const TRANSPORT_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_srtp",
    "interceptor",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogOutput {
    Stderr,
    File(PathBuf),
    /// libtest's captured output, printed only for failing tests.
    TestHarness,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directives, e.g. `warn,call_session::coordinator=trace`.
    pub directives: String,
    pub output: LogOutput,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directives: DEFAULT_DIRECTIVES.to_string(),
            output: LogOutput::Stderr,
        }
    }
}

impl LogConfig {
    /// Reads `CALL_SESSION_LOG` for directives and `CALL_SESSION_LOG_FILE`
    /// for an append-only log file. Unset variables keep the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(directives) = std::env::var(LOG_ENV) {
            if !directives.trim().is_empty() {
                config.directives = directives;
            }
        }
        if let Ok(path) = std::env::var(LOG_FILE_ENV) {
            if !path.trim().is_empty() {
                config.output = LogOutput::File(PathBuf::from(path));
            }
        }
        config
    }

    /// Debug-level session events routed through the test harness.
    /// `CALL_SESSION_LOG` still overrides the directives.
    pub fn for_tests() -> Self {
        let directives = std::env::var(LOG_ENV)
            .ok()
            .filter(|directives| !directives.trim().is_empty())
            .unwrap_or_else(|| TEST_DIRECTIVES.to_string());
        Self {
            directives,
            output: LogOutput::TestHarness,
        }
    }

    /// The configured directives plus a `warn` cap for every transport
    /// target they leave unmentioned.
    fn effective_directives(&self) -> String {
        let mut directives = self.directives.trim().to_string();
        for target in TRANSPORT_TARGETS {
            if !names_target(&self.directives, target) {
                if !directives.is_empty() {
                    directives.push(',');
                }
                directives.push_str(target);
                directives.push_str("=warn");
            }
        }
        directives
    }

    fn filter(&self) -> Result<EnvFilter, InitError> {
        let directives = self.effective_directives();
        EnvFilter::try_new(&directives).map_err(|source| InitError::Filter { directives, source })
    }
}

fn names_target(directives: &str, target: &str) -> bool {
    directives.split(',').any(|directive| {
        directive
            .split(['=', '['])
            .next()
            .is_some_and(|name| name.trim() == target)
    })
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("invalid log directives {directives:?}: {source}")]
    Filter {
        directives: String,
        #[source]
        source: ParseError,
    },
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to install subscriber: {0}")]
    Install(String),
}

static INSTALLED: Mutex<bool> = parking_lot::const_mutex(false);
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Once one call has succeeded, later calls
/// return `Ok` without looking at `config`.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    let mut installed = INSTALLED.lock();
    if *installed {
        return Ok(());
    }

    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.filter()?)
        .with_target(true);
    let installed_result = match &config.output {
        LogOutput::TestHarness => builder.with_test_writer().try_init(),
        LogOutput::Stderr => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            let _ = GUARD.set(guard);
            builder.with_writer(writer).try_init()
        }
        LogOutput::File(path) => {
            let (writer, guard) = tracing_appender::non_blocking(open_log_file(path)?);
            let _ = GUARD.set(guard);
            builder.with_ansi(false).with_writer(writer).try_init()
        }
    };
    installed_result.map_err(|err| InitError::Install(err.to_string()))?;

    *installed = true;
    tracing::debug!(
        target = "call_session::logging",
        directives = %config.effective_directives(),
        "logging initialised"
    );
    Ok(())
}

fn open_log_file(path: &Path) -> Result<File, InitError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| InitError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_targets_are_capped_unless_named() {
        let config = LogConfig {
            directives: "debug,webrtc_ice=trace".to_string(),
            output: LogOutput::Stderr,
        };
        let directives = config.effective_directives();
        assert!(directives.starts_with("debug,webrtc_ice=trace,webrtc=warn"));
        assert!(directives.contains(",interceptor=warn"));
        assert!(!directives.contains("webrtc_ice=warn"));

        let empty = LogConfig {
            directives: String::new(),
            output: LogOutput::Stderr,
        };
        assert!(empty.effective_directives().starts_with("webrtc=warn,"));
    }

    #[test]
    fn invalid_directives_are_reported() {
        let config = LogConfig {
            directives: "call_session=loud".to_string(),
            output: LogOutput::Stderr,
        };
        let err = config.filter().unwrap_err();
        match err {
            InitError::Filter { directives, .. } => {
                assert!(directives.starts_with("call_session=loud,"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn environment_selects_directives_and_file() {
        let original_log = std::env::var(LOG_ENV).ok();
        let original_file = std::env::var(LOG_FILE_ENV).ok();
        // SAFETY: only this test reads or writes these variables.
        unsafe {
            std::env::set_var(LOG_ENV, "call_session::coordinator=trace");
            std::env::set_var(LOG_FILE_ENV, "/tmp/call-session.log");
        }
        let from_env = LogConfig::from_env();
        let for_tests = LogConfig::for_tests();
        unsafe {
            std::env::set_var(LOG_ENV, " ");
            std::env::remove_var(LOG_FILE_ENV);
        }
        let defaults = LogConfig::from_env();
        unsafe {
            match original_log {
                Some(value) => std::env::set_var(LOG_ENV, value),
                None => std::env::remove_var(LOG_ENV),
            }
            if let Some(value) = original_file {
                std::env::set_var(LOG_FILE_ENV, value);
            }
        }

        assert_eq!(from_env.directives, "call_session::coordinator=trace");
        assert_eq!(from_env.output, LogOutput::File(PathBuf::from("/tmp/call-session.log")));
        assert_eq!(for_tests.directives, "call_session::coordinator=trace");
        assert_eq!(for_tests.output, LogOutput::TestHarness);
        assert_eq!(defaults, LogConfig::default());
    }

    #[test]
    fn unwritable_log_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("session.log");
        let err = open_log_file(&path).unwrap_err();
        assert!(matches!(err, InitError::Io { path: reported, .. } if reported == path));
    }

    #[test]
    fn init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            directives: TEST_DIRECTIVES.to_string(),
            output: LogOutput::File(dir.path().join("session.log")),
        };
        init(&config).expect("first init");
        init(&LogConfig::default()).expect("second init is a no-op");
        assert!(dir.path().join("session.log").exists());
    }
}
