//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `TERMHOST_SHELL`, `TERMHOST_BROKER`,
//!    `TERMHOST_LOG`
//! 2. **Config file**: path via `--config <path>`, or `termhost.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [session]
//! default_shell = "/bin/bash"      # omit to use $SHELL or the best detected shell
//! term = "xterm"
//! rows = 24
//! cols = 80
//! working_dir = "~"
//! grace_period_ms = 3000           # time between the hang-up signal and SIGKILL
//! terminate_signal = "SIGHUP"
//! xon_xoff = false
//! utf8 = true
//! erase = 127                      # optional erase character
//! auto_close = true
//! monitor_activity = false         # report output after a quiet spell
//! monitor_silence = false          # report silence_seconds without output
//! silence_seconds = 10
//!
//! [session.env]
//! COLORTERM = "truecolor"
//!
//! [broker]
//! program = "/usr/libexec/termhost_grantpty"   # omit to trust grantpt(3)
//!
//! [registry]
//! max_sessions = 20
//!
//! [logging]
//! level = "warn"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::Deserialize;

use crate::shell::pty::LineSettings;
use crate::util::expand_tilde;

/// File looked up in the current directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "termhost.toml";

/// Why configuration could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Defaults applied to every new session.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Program run when none is given. Override with `TERMHOST_SHELL`.
    pub default_shell: Option<String>,
    /// `TERM` exported to the child (default `xterm`). Empty leaves it unset.
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
    /// Working directory of the child; `~` is expanded. Inherited if unset.
    pub working_dir: Option<String>,
    /// Milliseconds between the graceful signal and SIGKILL (default 3000).
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Signal sent first on terminate (default `SIGHUP`).
    #[serde(default = "default_terminate_signal")]
    pub terminate_signal: String,
    #[serde(default)]
    pub xon_xoff: bool,
    #[serde(default = "default_utf8")]
    pub utf8: bool,
    pub erase: Option<u8>,
    /// Whether a finished session goes away without keeping a `<Finished>`
    /// title around (default true).
    #[serde(default = "default_auto_close")]
    pub auto_close: bool,
    #[serde(default)]
    pub monitor_activity: bool,
    #[serde(default)]
    pub monitor_silence: bool,
    /// Quiet time in seconds that counts as silence (default 10).
    #[serde(default = "default_silence_seconds")]
    pub silence_seconds: u64,
    /// Extra environment for the child.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Permission helper selection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerConfig {
    /// Path of the `termhost_grantpty` helper. Override with `TERMHOST_BROKER`.
    pub program: Option<String>,
}

/// Session registry limits.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Maximum concurrent sessions (default 20).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `warn`). `TERMHOST_LOG` overrides it and
    /// `RUST_LOG` overrides both.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_term() -> String {
    "xterm".to_string()
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_grace_period_ms() -> u64 {
    3000
}
fn default_terminate_signal() -> String {
    "SIGHUP".to_string()
}
fn default_utf8() -> bool {
    true
}
fn default_auto_close() -> bool {
    true
}
fn default_silence_seconds() -> u64 {
    10
}
fn default_max_sessions() -> usize {
    20
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: None,
            term: default_term(),
            rows: default_rows(),
            cols: default_cols(),
            working_dir: None,
            grace_period_ms: default_grace_period_ms(),
            terminate_signal: default_terminate_signal(),
            xon_xoff: false,
            utf8: default_utf8(),
            erase: None,
            auto_close: default_auto_close(),
            monitor_activity: false,
            monitor_silence: false,
            silence_seconds: default_silence_seconds(),
            env: HashMap::new(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SessionConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_secs(self.silence_seconds)
    }

    pub fn line_settings(&self) -> LineSettings {
        LineSettings {
            xon_xoff: self.xon_xoff,
            utf8: self.utf8,
            erase: self.erase,
        }
    }

    /// The configured graceful signal, accepting `SIGHUP` or `HUP`.
    pub fn terminate_signal(&self) -> Result<Signal, ConfigError> {
        parse_signal(&self.terminate_signal)
    }

    pub fn working_dir(&self) -> Option<PathBuf> {
        self.working_dir.as_deref().map(expand_tilde)
    }
}

fn parse_signal(name: &str) -> Result<Signal, ConfigError> {
    let name = name.trim().to_ascii_uppercase();
    let full = if name.starts_with("SIG") {
        name
    } else {
        format!("SIG{name}")
    };
    Signal::from_str(&full).map_err(|_| ConfigError::Invalid(format!("unknown signal {full}")))
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `termhost.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides, looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(shell) = var("TERMHOST_SHELL").filter(|s| !s.is_empty()) {
            self.session.default_shell = Some(shell);
        }
        if let Some(program) = var("TERMHOST_BROKER") {
            // An empty value disables the helper.
            self.broker.program = Some(program).filter(|p| !p.is_empty());
        }
        if let Some(level) = var("TERMHOST_LOG").filter(|s| !s.is_empty()) {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.rows == 0 || self.session.cols == 0 {
            return Err(ConfigError::Invalid(format!(
                "terminal size {}x{} is empty",
                self.session.rows, self.session.cols
            )));
        }
        if self.session.silence_seconds == 0 {
            return Err(ConfigError::Invalid("silence_seconds must be at least 1".into()));
        }
        if self.registry.max_sessions == 0 {
            return Err(ConfigError::Invalid("max_sessions must be at least 1".into()));
        }
        self.session.terminate_signal()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.session.term, "xterm");
        assert_eq!((config.session.rows, config.session.cols), (24, 80));
        assert_eq!(config.session.grace_period(), Duration::from_secs(3));
        assert_eq!(config.session.terminate_signal().unwrap(), Signal::SIGHUP);
        assert!(config.session.auto_close);
        assert!(config.broker.program.is_none());
        assert_eq!(config.registry.max_sessions, 20);
        assert_eq!(config.logging.level, "warn");
        assert!(!config.session.monitor_activity && !config.session.monitor_silence);
        assert_eq!(config.session.silence_timeout(), Duration::from_secs(10));
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[session]\nterm = \"vt100\"\nrows = 50\nerase = 8\n\n[session.env]\nFOO = \"bar\"\n\n[broker]\nprogram = \"/opt/grantpty\""
        )
        .unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.session.term, "vt100");
        assert_eq!(config.session.rows, 50);
        assert_eq!(config.session.cols, 80);
        assert_eq!(config.session.line_settings().erase, Some(8));
        assert_eq!(config.session.env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(config.broker.program.as_deref(), Some("/opt/grantpty"));
        assert_eq!(config.registry.max_sessions, 20);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = Config::load(Some(Path::new("/nonexistent/termhost.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session\nrows = ").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::default();
        config.broker.program = Some("/from/file".into());
        config.apply_env(|key| match key {
            "TERMHOST_SHELL" => Some("/bin/zsh".into()),
            "TERMHOST_BROKER" => Some(String::new()),
            "TERMHOST_LOG" => Some("debug".into()),
            _ => None,
        });
        assert_eq!(config.session.default_shell.as_deref(), Some("/bin/zsh"));
        assert!(config.broker.program.is_none());
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(parse_signal("hup").unwrap(), Signal::SIGHUP);
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert!(matches!(parse_signal("SIGNOPE"), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_empty_geometry() {
        let mut config = Config::default();
        config.session.cols = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_monitoring_settings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[session]\nmonitor_activity = true\nmonitor_silence = true\nsilence_seconds = 3"
        )
        .unwrap();
        let mut config = Config::from_file(file.path()).unwrap();
        assert!(config.session.monitor_activity);
        assert!(config.session.monitor_silence);
        assert_eq!(config.session.silence_timeout(), Duration::from_secs(3));

        config.session.silence_seconds = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
