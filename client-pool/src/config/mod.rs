use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Outbound proxy used for every request to every endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Parses either a full proxy URL (`socks5://host:port`) or the
    /// `ip:port[:username:password]` line format.
    pub fn parse(line: &str) -> Result<Self, ConfigError> {
        let line = line.trim();
        if line.contains("://") {
            let parsed = url::Url::parse(line).map_err(|e| ConfigError::InvalidValue {
                field: "proxy".to_string(),
                reason: e.to_string(),
            })?;
            let username = (!parsed.username().is_empty()).then(|| parsed.username().to_string());
            let password = parsed.password().map(str::to_string);
            let mut bare = parsed.clone();
            // Credentials travel separately as basic auth.
            let _ = bare.set_username("");
            let _ = bare.set_password(None);
            return Ok(Self {
                url: bare.as_str().trim_end_matches('/').to_string(),
                username,
                password,
            });
        }

        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() < 2 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "proxy".to_string(),
                reason: format!("expected ip:port[:user:pass], got '{}'", line),
            });
        }

        let (username, password) = if parts.len() >= 4 {
            (Some(parts[2].to_string()), Some(parts[3].to_string()))
        } else {
            (None, None)
        };

        Ok(Self {
            url: format!("http://{}:{}", parts[0], parts[1]),
            username,
            password,
        })
    }
}

/// Per-endpoint backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Cooldown after a first (or isolated) failure.
    pub base_backoff_ms: u64,
    /// Ceiling for the doubled cooldown.
    pub max_backoff_ms: u64,
    /// Failures further apart than this reset the cooldown to the base.
    pub failure_window_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
            failure_window_secs: 300,
        }
    }
}

impl HealthConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }
}

/// Settings for each per-endpoint client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Best-block polling interval used when notifications cannot use
    /// the websocket (proxied connections).
    pub poll_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            poll_interval_secs: 30,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Label used in logs, usually the coin the pool serves.
    pub name: String,
    pub endpoints: Vec<String>,
    pub proxy: Option<ProxyConfig>,
    pub max_attempts: u32,
    pub notification_buffer: usize,
    pub health: HealthConfig,
    pub client: ClientConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            endpoints: Vec::new(),
            proxy: None,
            max_attempts: 3,
            notification_buffer: 64,
            health: HealthConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl PoolConfig {
    pub const ENDPOINTS_VAR: &'static str = "BLOCKBOOK_ENDPOINTS";
    pub const PROXY_VAR: &'static str = "BLOCKBOOK_PROXY";
    pub const MAX_ATTEMPTS_VAR: &'static str = "BLOCKBOOK_MAX_ATTEMPTS";

    pub fn new(name: &str, endpoints: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            endpoints,
            ..Default::default()
        }
    }

    /// Loads a TOML configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        if !path.exists() {
            return Err(ConfigError::FileNotFound { path: display });
        }
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: display.clone(),
            msg: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    /// Builds a configuration from `BLOCKBOOK_*` environment variables.
    pub fn from_env(name: &str) -> Result<Self, ConfigError> {
        let raw = std::env::var(Self::ENDPOINTS_VAR).map_err(|_| ConfigError::MissingField {
            field: Self::ENDPOINTS_VAR.to_string(),
        })?;
        let endpoints = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let mut config = Self::new(name, endpoints);
        if let Ok(proxy) = std::env::var(Self::PROXY_VAR) {
            if !proxy.trim().is_empty() {
                config.proxy = Some(ProxyConfig::parse(&proxy)?);
            }
        }
        if let Ok(attempts) = std::env::var(Self::MAX_ATTEMPTS_VAR) {
            config.max_attempts =
                attempts
                    .trim()
                    .parse()
                    .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                        field: Self::MAX_ATTEMPTS_VAR.to_string(),
                        reason: e.to_string(),
                    })?;
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::MissingField {
                field: "endpoints".to_string(),
            });
        }
        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            validate_endpoint_url(endpoint)?;
            if !seen.insert(endpoint.trim_end_matches('/')) {
                return Err(ConfigError::DuplicateEndpoint {
                    url: endpoint.clone(),
                });
            }
        }
        self.validate_settings()
    }

    /// Checks every setting except the endpoint list.
    pub fn validate_settings(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.notification_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "notification_buffer".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.health.base_backoff_ms > self.health.max_backoff_ms {
            return Err(ConfigError::InvalidValue {
                field: "health.base_backoff_ms".to_string(),
                reason: "exceeds health.max_backoff_ms".to_string(),
            });
        }
        Ok(())
    }
}

/// Only plain http(s) base URLs are accepted as endpoints.
pub fn validate_endpoint_url(endpoint: &str) -> Result<url::Url, ConfigError> {
    let parsed = url::Url::parse(endpoint).map_err(|e| ConfigError::InvalidEndpointUrl {
        url: endpoint.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ConfigError::InvalidEndpointUrl {
                url: endpoint.to_string(),
                reason: format!("unsupported scheme: {}", other),
            })
        }
    }
    if parsed.host_str().is_none() {
        return Err(ConfigError::InvalidEndpointUrl {
            url: endpoint.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(parsed)
}
