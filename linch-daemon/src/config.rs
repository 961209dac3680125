// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Daemon configuration.
//!
//! The configuration file is JSON deserialized with defaults for every
//! field, so unknown keys are silently ignored and a missing file yields the
//! default configuration. A handful of operator overrides come from
//! `LINCH_MIND_*` environment variables on top of whatever the file said.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const ENV_CONFIG_FILE: &str = "LINCH_MIND_CONFIG";
const ENV_SOCKET_PATH: &str = "LINCH_MIND_SOCKET_PATH";
const ENV_PIPE_NAME: &str = "LINCH_MIND_PIPE_NAME";
const ENV_APP_DATA_DIR: &str = "LINCH_MIND_APP_DATA";
const ENV_LOG_LEVEL: &str = "LINCH_MIND_LOG_LEVEL";
const ENV_LOG_METHOD: &str = "LINCH_MIND_LOG_METHOD";
const ENV_DEVELOPMENT: &str = "LINCH_MIND_DEVELOPMENT";
const ENV_DEBUG: &str = "LINCH_MIND_DEBUG";

const LOG_METHOD_DISABLED: &str = "disabled";
const LOG_METHOD_STDOUT: &str = "stdout";
const LOG_METHOD_STDERR: &str = "stderr";

pub const DEFAULT_MAX_CONNECTIONS: usize = 100;
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = linch_ipc::codec::DEFAULT_MAX_PAYLOAD_BYTES;
pub const DEFAULT_MAX_REQUESTS_PER_MINUTE: u32 = 2000;
pub const DEFAULT_MAX_BURST: u32 = 500;
pub const DEFAULT_PIPE_POOL_SIZE: usize = 10;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 3000;

#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
pub enum LogMethod {
    Stdout,
    #[default]
    Stderr,
    File(PathBuf),
    Disabled,
}

impl std::fmt::Display for LogMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogMethod::Disabled => write!(f, "{LOG_METHOD_DISABLED}"),
            LogMethod::Stdout => write!(f, "{LOG_METHOD_STDOUT}"),
            LogMethod::Stderr => write!(f, "{LOG_METHOD_STDERR}"),
            LogMethod::File(path) => write!(f, "file://{}", path.to_string_lossy()),
        }
    }
}

impl LogMethod {
    fn parse(method: &str) -> Option<Self> {
        match method {
            LOG_METHOD_DISABLED => Some(LogMethod::Disabled),
            LOG_METHOD_STDOUT => Some(LogMethod::Stdout),
            LOG_METHOD_STDERR => Some(LogMethod::Stderr),
            // not a real uri, just a plain (unencoded) path prefixed
            // with file://
            method if method.starts_with("file://") => {
                Some(LogMethod::File(PathBuf::from(&method[7..])))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests_per_minute: u32,
    pub max_burst: u32,
    /// Prefixes whose burst/minute caps are multiplied; configuration and
    /// lifecycle traffic is bursty by nature.
    pub exempt_path_prefixes: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            max_requests_per_minute: DEFAULT_MAX_REQUESTS_PER_MINUTE,
            max_burst: DEFAULT_MAX_BURST,
            exempt_path_prefixes: vec![
                "/connector-config/".to_string(),
                "/webview-config/".to_string(),
                "/connector-lifecycle/".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub blocked_paths: Vec<String>,
    /// Paths only servable when `development_mode` is set.
    pub sensitive_paths: Vec<String>,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        FirewallConfig {
            blocked_paths: vec![
                "/internal/debug".to_string(),
                "/admin/shutdown".to_string(),
                "/system/kill".to_string(),
            ],
            sensitive_paths: vec![
                "/system-config/security".to_string(),
                "/system-config/database".to_string(),
                "/connector-lifecycle/kill".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Development-only escape hatch; when false the handshake gate is
    /// skipped entirely.
    pub require_authentication: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            require_authentication: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socket_path: Option<PathBuf>,
    pub pipe_name: Option<String>,
    pub app_data_dir: Option<PathBuf>,
    pub max_connections: usize,
    pub connection_timeout_seconds: u64,
    pub max_payload_bytes: usize,
    pub rate_limit: RateLimitConfig,
    pub firewall: FirewallConfig,
    pub auth: AuthConfig,
    pub pipe_pool_size: usize,
    /// Per-request cap on the named-pipe path; elsewhere requests are only
    /// bounded by the transport.
    pub request_timeout_ms: Option<u64>,
    pub log_level: String,
    pub log_method: LogMethod,
    pub development_mode: bool,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: None,
            pipe_name: None,
            app_data_dir: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_timeout_seconds: DEFAULT_CONNECTION_TIMEOUT_SECS,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            rate_limit: RateLimitConfig::default(),
            firewall: FirewallConfig::default(),
            auth: AuthConfig::default(),
            pipe_pool_size: DEFAULT_PIPE_POOL_SIZE,
            request_timeout_ms: None,
            log_level: "info".to_string(),
            log_method: LogMethod::default(),
            development_mode: false,
            debug: false,
        }
    }
}

impl Config {
    /// Loads the configuration file named by `LINCH_MIND_CONFIG` (if any)
    /// and applies environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let config = match std::env::var_os(ENV_CONFIG_FILE) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Config::default(),
        };
        Ok(FromEnv::apply(config))
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds)
    }

    /// Effective per-request timeout: the configured cap, or the 3 s
    /// named-pipe default on Windows, or unbounded.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms
            .or(if cfg!(windows) {
                Some(DEFAULT_REQUEST_TIMEOUT_MS)
            } else {
                None
            })
            .map(Duration::from_millis)
    }

    /// The directory holding the endpoint descriptor files.
    pub fn app_data_dir(&self) -> PathBuf {
        self.app_data_dir
            .clone()
            .unwrap_or_else(default_app_data_dir)
    }

    pub fn to_env(&self) -> HashMap<&'static str, String> {
        let mut res = HashMap::from([
            (ENV_LOG_LEVEL, self.log_level.clone()),
            (ENV_LOG_METHOD, self.log_method.to_string()),
            (ENV_DEVELOPMENT, self.development_mode.to_string()),
        ]);
        if let Some(path) = &self.socket_path {
            res.insert(ENV_SOCKET_PATH, path.to_string_lossy().into_owned());
        }
        if let Some(name) = &self.pipe_name {
            res.insert(ENV_PIPE_NAME, name.clone());
        }
        res
    }
}

fn default_app_data_dir() -> PathBuf {
    #[cfg(unix)]
    {
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(std::env::temp_dir);
        home.join(".linch-mind")
    }
    #[cfg(windows)]
    {
        let base = std::env::var_os("LOCALAPPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        base.join("linch-mind")
    }
}

pub struct FromEnv {}

impl FromEnv {
    fn apply(mut config: Config) -> Config {
        if let Some(path) = std::env::var_os(ENV_SOCKET_PATH) {
            config.socket_path = Some(PathBuf::from(path));
        }
        if let Ok(name) = std::env::var(ENV_PIPE_NAME) {
            config.pipe_name = Some(name);
        }
        if let Some(dir) = std::env::var_os(ENV_APP_DATA_DIR) {
            config.app_data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            config.log_level = level;
        }
        if let Some(method) = Self::log_method() {
            config.log_method = method;
        }
        if Self::flag(ENV_DEVELOPMENT) {
            config.development_mode = true;
        }
        if Self::flag(ENV_DEBUG) {
            config.debug = true;
        }
        config
    }

    pub fn log_method() -> Option<LogMethod> {
        let method = std::env::var(ENV_LOG_METHOD).unwrap_or_default();
        LogMethod::parse(&method)
    }

    fn flag(name: &str) -> bool {
        matches!(std::env::var(name).as_deref(), Ok("true" | "1"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.connection_timeout_seconds, 30);
        assert_eq!(config.max_payload_bytes, 1024 * 1024);
        assert_eq!(config.rate_limit.max_requests_per_minute, 2000);
        assert_eq!(config.rate_limit.max_burst, 500);
        assert_eq!(config.pipe_pool_size, 10);
        assert!(config.auth.require_authentication);
    }

    #[test]
    fn unknown_keys_are_silently_ignored() {
        let config: Config = serde_json::from_str(
            r#"{"max_connections": 7, "definitely_not_an_option": {"nested": true}}"#,
        )
        .unwrap();
        assert_eq!(config.max_connections, 7);
        assert_eq!(config.max_payload_bytes, DEFAULT_MAX_PAYLOAD_BYTES);
    }

    #[test]
    fn nested_sections_deserialize_partially() {
        let config: Config = serde_json::from_str(
            r#"{"rate_limit": {"max_burst": 5}, "firewall": {"blocked_paths": ["/x"]}}"#,
        )
        .unwrap();
        assert_eq!(config.rate_limit.max_burst, 5);
        assert_eq!(config.rate_limit.max_requests_per_minute, 2000);
        assert_eq!(config.firewall.blocked_paths, vec!["/x".to_string()]);
        assert!(!config.firewall.sensitive_paths.is_empty());
    }

    #[test]
    fn log_method_parses_file_uris() {
        assert_eq!(LogMethod::parse("stdout"), Some(LogMethod::Stdout));
        assert_eq!(
            LogMethod::parse("file:///var/log/linch.log"),
            Some(LogMethod::File(PathBuf::from("/var/log/linch.log")))
        );
        assert_eq!(LogMethod::parse("syslog"), None);
    }

    #[cfg(unix)]
    #[test]
    fn request_timeout_is_unbounded_off_windows() {
        assert_eq!(Config::default().request_timeout(), None);
        let config = Config {
            request_timeout_ms: Some(250),
            ..Config::default()
        };
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(250)));
    }
}
