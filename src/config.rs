use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scheduler::SchedulerConfig;
use crate::session::{ManagerConfig, SessionConfig};

/// Top-level server config, loaded from TOML. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub session: SessionSection,
    pub job: JobSection,
    pub stream: StreamSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address to listen on.
    pub bind: String,
    /// Bearer token required on every API call except `/health`.
    pub token: Option<String>,
    /// Allowed CORS origins. Empty disables CORS.
    pub cors_origins: Vec<String>,
    /// Requests per second allowed per client IP.
    pub rate_limit: Option<u32>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7681".to_string(),
            token: None,
            cors_origins: Vec::new(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Shell spawned for each session. Must be POSIX compatible.
    pub shell: String,
    pub max_sessions: usize,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// How long a shell gets after SIGHUP before it is killed.
    pub kill_grace_ms: u64,
    pub rows: u16,
    pub cols: u16,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
            max_sessions: 64,
            idle_timeout_secs: 1800,
            sweep_interval_secs: 30,
            kill_grace_ms: 2000,
            rows: 24,
            cols: 80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSection {
    /// Jobs allowed to run at once in one session. Further jobs queue.
    pub max_running: usize,
    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,
    /// Output tail kept in each history entry.
    pub history_output_bytes: usize,
}

impl Default for JobSection {
    fn default() -> Self {
        Self {
            max_running: 4,
            default_timeout_secs: 30,
            max_timeout_secs: 3600,
            history_output_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    /// Events buffered per live viewer before it is disconnected.
    pub subscriber_queue: usize,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            subscriber_queue: crate::broker::DEFAULT_SUBSCRIBER_QUEUE,
        }
    }
}

/// Job framing needs POSIX syntax, so the login shell is never used
/// implicitly.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// `$XDG_CONFIG_HOME/jobsh/config.toml` or the platform equivalent.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("jobsh").join("config.toml"))
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        // Warn if the config file is world-readable (may contain the token).
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Reject unusable limits and fix up a sweep interval that would not
    /// notice an idle session in time.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let s = &mut self.session;
        if s.max_sessions == 0 {
            return Err(ConfigError::Invalid("session.max_sessions must be at least 1".into()));
        }
        if s.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("session.idle_timeout_secs must be at least 1".into()));
        }
        if s.rows == 0 || s.cols == 0 {
            return Err(ConfigError::Invalid("session.rows and session.cols must be non-zero".into()));
        }
        if s.shell.trim().is_empty() {
            return Err(ConfigError::Invalid("session.shell must not be empty".into()));
        }
        if s.sweep_interval_secs == 0 || s.sweep_interval_secs >= s.idle_timeout_secs {
            let clamped = (s.idle_timeout_secs / 2).max(1);
            tracing::warn!(
                sweep_interval_secs = s.sweep_interval_secs,
                idle_timeout_secs = s.idle_timeout_secs,
                clamped,
                "sweep interval must be shorter than the idle timeout, clamping"
            );
            s.sweep_interval_secs = clamped;
        }

        let j = &self.job;
        if j.max_running == 0 {
            return Err(ConfigError::Invalid("job.max_running must be at least 1".into()));
        }
        if j.default_timeout_secs == 0 || j.max_timeout_secs == 0 {
            return Err(ConfigError::Invalid("job timeouts must be at least 1 second".into()));
        }
        if j.default_timeout_secs > j.max_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "job.default_timeout_secs ({}) exceeds job.max_timeout_secs ({})",
                j.default_timeout_secs, j.max_timeout_secs
            )));
        }
        if self.stream.subscriber_queue == 0 {
            return Err(ConfigError::Invalid("stream.subscriber_queue must be at least 1".into()));
        }
        if self.server.rate_limit == Some(0) {
            return Err(ConfigError::Invalid("server.rate_limit must be at least 1".into()));
        }
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            session: SessionConfig {
                shell: self.session.shell.clone(),
                rows: self.session.rows,
                cols: self.session.cols,
                kill_grace: Duration::from_millis(self.session.kill_grace_ms),
                scheduler: SchedulerConfig {
                    max_running: self.job.max_running,
                    default_timeout: Duration::from_secs(self.job.default_timeout_secs),
                    max_timeout: Duration::from_secs(self.job.max_timeout_secs),
                    history_output_bytes: self.job.history_output_bytes,
                },
                subscriber_queue: self.stream.subscriber_queue,
            },
            max_sessions: self.session.max_sessions,
            idle_timeout: Duration::from_secs(self.session.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.session.sweep_interval_secs),
        }
    }
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Check file permissions on a config file and warn if world-readable.
///
/// On Unix, checks `st_mode & 0o004` (world-readable bit). If set, logs a
/// warning because the config file may contain the API token.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             It may contain a token -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-readable bit set.
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
