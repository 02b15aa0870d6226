use client_pool::config::{HealthConfig, PoolConfig, ProxyConfig};
use client_pool::{ClientPool, ConfigError, PoolError};
use std::io::Write;
use std::sync::Mutex;
use tempfile::NamedTempFile;

// Environment variables are process-wide.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_from_path_applies_defaults() {
    let file = write_config(
        r#"
name = "btc"
endpoints = ["https://btc1.example.com/api", "https://btc2.example.com/api"]
"#,
    );

    let config = PoolConfig::from_path(file.path()).unwrap();
    assert_eq!(config.name, "btc");
    assert_eq!(config.endpoints.len(), 2);
    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.health, HealthConfig::default());
    assert_eq!(config.client.request_timeout_secs, 30);
    assert!(config.proxy.is_none());
    assert!(config.validate().is_ok());
}

#[test]
fn test_from_path_nested_sections() {
    let file = write_config(
        r#"
name = "ltc"
endpoints = ["https://ltc.example.com/api"]
max_attempts = 5

[proxy]
url = "socks5://127.0.0.1:9050"

[health]
base_backoff_ms = 500
max_backoff_ms = 8000

[client]
connect_timeout_secs = 3
"#,
    );

    let config = PoolConfig::from_path(file.path()).unwrap();
    assert_eq!(config.max_attempts, 5);
    assert_eq!(config.health.base_backoff_ms, 500);
    assert_eq!(config.health.failure_window_secs, 300);
    assert_eq!(config.client.connect_timeout_secs, 3);
    assert_eq!(config.client.request_timeout_secs, 30);
    let proxy = config.proxy.unwrap();
    assert_eq!(proxy.url, "socks5://127.0.0.1:9050");
    assert!(proxy.username.is_none());
}

#[test]
fn test_from_path_missing_file() {
    let result = PoolConfig::from_path("/definitely/not/here.toml");
    assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
}

#[test]
fn test_from_path_malformed_toml() {
    let file = write_config("endpoints = [unterminated");
    let result = PoolConfig::from_path(file.path());
    assert!(matches!(result, Err(ConfigError::Parse { .. })));
}

#[test]
fn test_validate_rejects_bad_settings() {
    let mut config = PoolConfig::new("btc", vec!["https://a.example.com/api".to_string()]);
    config.max_attempts = 0;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidValue { .. })
    ));

    let config = PoolConfig::new(
        "btc",
        vec![
            "https://a.example.com/api".to_string(),
            "https://a.example.com/api/".to_string(),
        ],
    );
    assert!(matches!(
        config.validate(),
        Err(ConfigError::DuplicateEndpoint { .. })
    ));

    let config = PoolConfig::new("btc", vec!["tcp://a.example.com".to_string()]);
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidEndpointUrl { .. })
    ));
}

#[test]
fn test_pool_requires_endpoints() {
    let config = PoolConfig::new("btc", Vec::new());
    assert!(matches!(ClientPool::new(&config), Err(PoolError::NoEndpoints)));
    assert!(matches!(
        ClientPool::with_clients(&config, Vec::new()),
        Err(PoolError::NoEndpoints)
    ));
}

#[test]
fn test_pool_rejects_malformed_endpoint() {
    let config = PoolConfig::new("btc", vec!["not a url".to_string()]);
    assert!(matches!(
        ClientPool::new(&config),
        Err(PoolError::Config(ConfigError::InvalidEndpointUrl { .. }))
    ));
}

#[test]
fn test_from_env() {
    let _lock = ENV_LOCK.lock().unwrap();
    std::env::set_var(
        PoolConfig::ENDPOINTS_VAR,
        "https://a.example.com/api, https://b.example.com/api,",
    );
    std::env::set_var(PoolConfig::PROXY_VAR, "10.0.0.2:3128:user:pass");
    std::env::set_var(PoolConfig::MAX_ATTEMPTS_VAR, "4");

    let config = PoolConfig::from_env("btc").unwrap();

    std::env::remove_var(PoolConfig::ENDPOINTS_VAR);
    std::env::remove_var(PoolConfig::PROXY_VAR);
    std::env::remove_var(PoolConfig::MAX_ATTEMPTS_VAR);

    assert_eq!(
        config.endpoints,
        vec![
            "https://a.example.com/api".to_string(),
            "https://b.example.com/api".to_string()
        ]
    );
    assert_eq!(config.max_attempts, 4);
    assert_eq!(
        config.proxy,
        Some(ProxyConfig {
            url: "http://10.0.0.2:3128".to_string(),
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
        })
    );
}

#[test]
fn test_from_env_requires_endpoints() {
    let _lock = ENV_LOCK.lock().unwrap();
    std::env::remove_var(PoolConfig::ENDPOINTS_VAR);
    assert!(matches!(
        PoolConfig::from_env("btc"),
        Err(ConfigError::MissingField { .. })
    ));
}
