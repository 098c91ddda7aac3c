//! Configuration for the HTTP client, tail sessions, poll sessions and logging.
//!
//! Precedence: defaults < YAML config file < environment variables. An
//! explicit config path must be readable; the default path is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const ENV_URL: &str = "BUILDER_TAIL_URL";
pub const ENV_TOKEN: &str = "BUILDER_TAIL_TOKEN";
pub const ENV_LOG_LEVEL: &str = "BUILDER_TAIL_LOG_LEVEL";

/// Shortest interval any status poll runs at.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub client: ClientConfig,
    pub tail: TailConfig,
    pub poll: PollConfig,
    pub logging: LoggingConfig,
}

/// Backend connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API root, e.g. `https://bldr.example.com/v1`.
    pub base_url: String,
    pub token: Option<String>,
    pub connect_timeout: Duration,
    /// Whole-request timeout enforced by the HTTP client.
    pub request_timeout: Duration,
    /// Ask the backend to keep terminal color sequences in log lines.
    pub color: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9636/v1".to_string(),
            token: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            color: true,
        }
    }
}

/// Timing and retry policy of a `TailSession`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailConfig {
    /// D1: delay before requesting the next chunk of an unfinished log.
    pub continuation_delay: Duration,
    /// D2: delay before a completion status check or a not-found recheck.
    pub recheck_delay: Duration,
    /// Per-request deadline; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Recheck a missing log even when streaming is off.
    pub retry_not_found_when_idle: bool,
    /// Give up the not-found recheck loop once the entity is terminal.
    pub stop_on_terminal_not_found: bool,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            continuation_delay: Duration::from_millis(2000),
            recheck_delay: Duration::from_millis(5000),
            request_timeout: Some(Duration::from_secs(30)),
            retry_not_found_when_idle: false,
            stop_on_terminal_not_found: true,
        }
    }
}

impl TailConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.continuation_delay.is_zero() {
            return Err(ConfigError::Invalid(
                "tail.continuation_delay_ms must be greater than 0".into(),
            ));
        }
        if self.recheck_delay.is_zero() {
            return Err(ConfigError::Invalid(
                "tail.recheck_delay_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Timing of a `StatusPollSession`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(10_000),
        }
    }
}

impl PollConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval < MIN_POLL_INTERVAL || self.interval > MAX_POLL_INTERVAL {
            return Err(ConfigError::Invalid(format!(
                "poll.interval_ms must be between {} and {}",
                MIN_POLL_INTERVAL.as_millis(),
                MAX_POLL_INTERVAL.as_millis()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "console".to_string(),
        }
    }
}

impl Config {
    /// Validates every section, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("client.base_url is required".into()));
        }
        if !self.client.base_url.contains("://") {
            return Err(ConfigError::Invalid(
                "client.base_url must include a scheme".into(),
            ));
        }
        if self.client.request_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "client.request_timeout_ms must be greater than 0".into(),
            ));
        }
        self.tail.validate()?;
        self.poll.validate()?;

        match self.logging.level.to_lowercase().trim() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "logging.level must be one of trace, debug, info, warn, error".into(),
                ))
            }
        }
        match self.logging.format.to_lowercase().trim() {
            "console" | "json" => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "logging.format must be one of console, json".into(),
                ))
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    #[serde(default)]
    client: PartialClientConfig,
    #[serde(default)]
    tail: PartialTailConfig,
    #[serde(default)]
    poll: PartialPollConfig,
    #[serde(default)]
    logging: PartialLoggingConfig,
}

#[derive(Debug, Default, Deserialize)]
struct PartialClientConfig {
    base_url: Option<String>,
    token: Option<String>,
    connect_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    color: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialTailConfig {
    continuation_delay_ms: Option<u64>,
    recheck_delay_ms: Option<u64>,
    /// 0 disables the deadline.
    request_timeout_ms: Option<u64>,
    retry_not_found_when_idle: Option<bool>,
    stop_on_terminal_not_found: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialPollConfig {
    interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialLoggingConfig {
    level: Option<String>,
    format: Option<String>,
}

/// Load config: defaults < config file < environment.
///
/// Returns the config and the file it was read from, if any.
pub fn load_config(config_file: Option<&str>) -> Result<(Config, Option<PathBuf>), ConfigError> {
    load_config_with_env(config_file, |key| std::env::var(key).ok())
}

/// `load_config` with an injectable environment lookup.
pub fn load_config_with_env<F>(
    config_file: Option<&str>,
    env: F,
) -> Result<(Config, Option<PathBuf>), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = Config::default();

    let explicit = config_file
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from);

    let (path_to_try, required) = match explicit {
        Some(path) => (Some(path), true),
        None => (default_config_path(&env), false),
    };

    let mut used = None;
    if let Some(path) = path_to_try {
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let parsed: PartialConfig = serde_yaml::from_str(&text)?;
                apply_partial(&mut cfg, parsed);
                used = Some(path);
            }
            Err(source) => {
                if required {
                    return Err(ConfigError::Read {
                        path: path.display().to_string(),
                        source,
                    });
                }
            }
        }
    }

    apply_env(&mut cfg, &env);
    cfg.validate()?;
    Ok((cfg, used))
}

fn default_config_path<F>(env: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(xdg) = env("XDG_CONFIG_HOME").filter(|s| !s.trim().is_empty()) {
        return Some(config_file_under(Path::new(&xdg)));
    }
    env("HOME")
        .filter(|s| !s.trim().is_empty())
        .map(|home| config_file_under(&Path::new(&home).join(".config")))
}

fn config_file_under(dir: &Path) -> PathBuf {
    dir.join("builder-tail").join("config.yaml")
}

fn apply_partial(cfg: &mut Config, partial: PartialConfig) {
    let client = partial.client;
    if let Some(url) = client.base_url.filter(|s| !s.trim().is_empty()) {
        cfg.client.base_url = url.trim().trim_end_matches('/').to_string();
    }
    if let Some(token) = client.token.filter(|s| !s.trim().is_empty()) {
        cfg.client.token = Some(token.trim().to_string());
    }
    if let Some(ms) = client.connect_timeout_ms.filter(|ms| *ms > 0) {
        cfg.client.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = client.request_timeout_ms.filter(|ms| *ms > 0) {
        cfg.client.request_timeout = Duration::from_millis(ms);
    }
    if let Some(color) = client.color {
        cfg.client.color = color;
    }

    let tail = partial.tail;
    if let Some(ms) = tail.continuation_delay_ms {
        cfg.tail.continuation_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = tail.recheck_delay_ms {
        cfg.tail.recheck_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = tail.request_timeout_ms {
        cfg.tail.request_timeout = (ms > 0).then(|| Duration::from_millis(ms));
    }
    if let Some(retry) = tail.retry_not_found_when_idle {
        cfg.tail.retry_not_found_when_idle = retry;
    }
    if let Some(stop) = tail.stop_on_terminal_not_found {
        cfg.tail.stop_on_terminal_not_found = stop;
    }

    if let Some(ms) = partial.poll.interval_ms {
        cfg.poll.interval = Duration::from_millis(ms);
    }

    if let Some(level) = partial.logging.level.filter(|s| !s.trim().is_empty()) {
        cfg.logging.level = level.trim().to_string();
    }
    if let Some(format) = partial.logging.format.filter(|s| !s.trim().is_empty()) {
        cfg.logging.format = format.trim().to_string();
    }
}

fn apply_env<F>(cfg: &mut Config, env: &F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = env(ENV_URL).filter(|s| !s.trim().is_empty()) {
        cfg.client.base_url = url.trim().trim_end_matches('/').to_string();
    }
    if let Some(token) = env(ENV_TOKEN).filter(|s| !s.trim().is_empty()) {
        cfg.client.token = Some(token.trim().to_string());
    }
    if let Some(level) = env(ENV_LOG_LEVEL).filter(|s| !s.trim().is_empty()) {
        cfg.logging.level = level.trim().to_string();
    }
}
