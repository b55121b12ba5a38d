use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/ro-ingestor/config.json";

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// First non-empty value among `keys`.
fn env_first(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| env_value(key))
}

fn env_parse<T: std::str::FromStr>(keys: &[&str]) -> Option<T> {
    env_first(keys).and_then(|value| value.parse::<T>().ok())
}

fn env_flag(keys: &[&str]) -> Option<bool> {
    env_first(keys).map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
}

fn setup_config_path() -> PathBuf {
    env_value("RO_SETUP_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETUP_CONFIG_PATH))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_tls: Option<bool>,
    #[serde(default)]
    topic_root: Option<String>,
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default)]
    flush_interval_ms: Option<u64>,
    #[serde(default)]
    min_write_interval_ms: Option<u64>,
    #[serde(default)]
    max_buffered_rows: Option<usize>,
    #[serde(default)]
    offline_after_seconds: Option<u64>,
    #[serde(default)]
    watchdog_interval_seconds: Option<u64>,
    #[serde(default)]
    alarm_cooldown_seconds: Option<u64>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "ro-ingestor failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "ro-ingestor failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

/// Setup-file values replace defaults, never a variable the operator set. `env_set` reports
/// whether any of the given variables is set.
fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    env_set: &dyn Fn(&[&str]) -> bool,
) {
    if !env_set(&["RO_MQTT_HOST", "MQTT_HOST"]) {
        if let Some(host) = trimmed(overrides.mqtt_host.as_deref()) {
            config.mqtt_host = host;
        }
    }
    if !env_set(&["RO_MQTT_PORT", "MQTT_PORT"]) {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if !env_set(&["RO_MQTT_USERNAME", "MQTT_USER"]) {
        if let Some(username) = overrides.mqtt_username.as_deref() {
            config.mqtt_username = trimmed(Some(username));
        }
    }
    if !env_set(&["RO_MQTT_PASSWORD", "MQTT_PASS"]) {
        if let Some(password) = overrides.mqtt_password.as_deref() {
            config.mqtt_password = trimmed(Some(password));
        }
    }
    if !env_set(&["RO_MQTT_TLS", "MQTT_TLS"]) {
        if let Some(tls) = overrides.mqtt_tls {
            config.mqtt_tls = tls;
        }
    }
    if !env_set(&["RO_TOPIC_ROOT", "TOPIC_ROOT"]) {
        if let Some(root) = trimmed(overrides.topic_root.as_deref()) {
            config.topic_root = root;
        }
    }

    let mut batch_overridden = false;
    if !env_set(&["RO_BATCH_SIZE"]) {
        if let Some(value) = overrides.batch_size.filter(|v| *v != 0) {
            config.batch_size = value;
            batch_overridden = true;
        }
    }
    if !env_set(&["RO_FLUSH_INTERVAL_MS"]) {
        if let Some(value) = overrides.flush_interval_ms.filter(|v| *v != 0) {
            config.flush_interval_ms = value;
        }
    }
    if !env_set(&["RO_MIN_WRITE_INTERVAL_MS"]) {
        if let Some(value) = overrides.min_write_interval_ms {
            config.min_write_interval_ms = value;
        }
    }
    if !env_set(&["RO_MAX_BUFFERED_ROWS"]) {
        if let Some(value) = overrides.max_buffered_rows.filter(|v| *v != 0) {
            config.max_buffered_rows = value;
        } else if batch_overridden {
            config.max_buffered_rows = config.batch_size.saturating_mul(10);
        }
    }
    if !env_set(&["RO_OFFLINE_AFTER_SECONDS"]) {
        if let Some(value) = overrides.offline_after_seconds.filter(|v| *v != 0) {
            config.offline_after_seconds = value;
        }
    }
    if !env_set(&["RO_WATCHDOG_INTERVAL_SECONDS"]) {
        if let Some(value) = overrides.watchdog_interval_seconds.filter(|v| *v != 0) {
            config.watchdog_interval_seconds = value;
        }
    }
    if !env_set(&["RO_ALARM_COOLDOWN_SECONDS"]) {
        if let Some(value) = overrides.alarm_cooldown_seconds {
            config.alarm_cooldown_seconds = value;
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_tls: bool,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub topic_root: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub min_write_interval_ms: u64,
    pub max_buffered_rows: usize,
    pub offline_after_seconds: u64,
    pub watchdog_interval_seconds: u64,
    pub presence_touch_seconds: u64,
    pub alarm_cooldown_seconds: u64,
    pub reconnect_backoff_seconds: u64,
    pub otlp_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            db_pool_size: 10,
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_tls: false,
            mqtt_keepalive_secs: 30,
            mqtt_client_id: format!("ro-ingestor-{}", std::process::id()),
            topic_root: "plant".to_string(),
            batch_size: 200,
            flush_interval_ms: 2000,
            min_write_interval_ms: 5000,
            max_buffered_rows: 2000,
            offline_after_seconds: 180,
            watchdog_interval_seconds: 30,
            presence_touch_seconds: 30,
            alarm_cooldown_seconds: 15 * 60,
            reconnect_backoff_seconds: 5,
            otlp_endpoint: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();
        let defaults = Self::default();

        let database_url = env_first(&["RO_DATABASE_URL", "DATABASE_URL", "DB_URL"])
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| trimmed(ov.database_url.as_deref()))
            })
            .context("RO_DATABASE_URL or DATABASE_URL is required (or database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);

        let batch_size = env_parse::<usize>(&["RO_BATCH_SIZE"])
            .filter(|v| *v != 0)
            .unwrap_or(defaults.batch_size);

        let mut config = Self {
            database_url,
            db_pool_size: env_parse(&["RO_DB_POOL_SIZE"]).unwrap_or(defaults.db_pool_size),
            mqtt_host: env_first(&["RO_MQTT_HOST", "MQTT_HOST"]).unwrap_or(defaults.mqtt_host),
            mqtt_port: env_parse(&["RO_MQTT_PORT", "MQTT_PORT"]).unwrap_or(defaults.mqtt_port),
            mqtt_username: env_first(&["RO_MQTT_USERNAME", "MQTT_USER"]),
            mqtt_password: env_first(&["RO_MQTT_PASSWORD", "MQTT_PASS"]),
            mqtt_tls: env_flag(&["RO_MQTT_TLS", "MQTT_TLS"]).unwrap_or(defaults.mqtt_tls),
            mqtt_keepalive_secs: env_parse(&["RO_MQTT_KEEPALIVE_SECS"])
                .unwrap_or(defaults.mqtt_keepalive_secs),
            mqtt_client_id: env_first(&["RO_MQTT_CLIENT_ID"]).unwrap_or(defaults.mqtt_client_id),
            topic_root: env_first(&["RO_TOPIC_ROOT", "TOPIC_ROOT"])
                .map(|root| root.trim_matches('/').to_string())
                .unwrap_or(defaults.topic_root),
            batch_size,
            flush_interval_ms: env_parse(&["RO_FLUSH_INTERVAL_MS"])
                .unwrap_or(defaults.flush_interval_ms),
            min_write_interval_ms: env_parse(&["RO_MIN_WRITE_INTERVAL_MS"])
                .unwrap_or(defaults.min_write_interval_ms),
            max_buffered_rows: env_parse(&["RO_MAX_BUFFERED_ROWS"])
                .unwrap_or(batch_size.saturating_mul(10)),
            offline_after_seconds: env_parse(&["RO_OFFLINE_AFTER_SECONDS"])
                .unwrap_or(defaults.offline_after_seconds),
            watchdog_interval_seconds: env_parse(&["RO_WATCHDOG_INTERVAL_SECONDS"])
                .unwrap_or(defaults.watchdog_interval_seconds),
            presence_touch_seconds: env_parse(&["RO_PRESENCE_TOUCH_SECONDS"])
                .unwrap_or(defaults.presence_touch_seconds),
            alarm_cooldown_seconds: env_parse(&["RO_ALARM_COOLDOWN_SECONDS"])
                .unwrap_or(defaults.alarm_cooldown_seconds),
            reconnect_backoff_seconds: env_parse(&["RO_RECONNECT_BACKOFF_SECONDS"])
                .unwrap_or(defaults.reconnect_backoff_seconds),
            otlp_endpoint: env_value("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides, &|keys| env_first(keys).is_some());
        }

        Ok(config)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn min_write_interval(&self) -> Duration {
        Duration::from_millis(self.min_write_interval_ms)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn offline_after(&self) -> Duration {
        Duration::from_secs(self.offline_after_seconds)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_seconds.max(1))
    }

    pub fn presence_touch_interval(&self) -> Duration {
        Duration::from_secs(self.presence_touch_seconds)
    }

    pub fn alarm_cooldown(&self) -> Duration {
        Duration::from_secs(self.alarm_cooldown_seconds)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_seconds)
    }
}

fn normalize_database_url(url: String) -> String {
    for driver in ["postgresql+psycopg://", "postgresql+psycopg2://", "postgresql+asyncpg://"] {
        if let Some(stripped) = url.strip_prefix(driver) {
            return format!("postgresql://{stripped}");
        }
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(json: &str) -> SetupConfigOverrides {
        let mut bytes = json.as_bytes().to_vec();
        simd_json::serde::from_slice(&mut bytes).unwrap()
    }

    #[test]
    fn sqlalchemy_driver_urls_are_normalized() {
        assert_eq!(
            normalize_database_url("postgresql+psycopg2://ro:pw@db/ro".to_string()),
            "postgresql://ro:pw@db/ro"
        );
        assert_eq!(
            normalize_database_url("postgres://ro@db/ro".to_string()),
            "postgres://ro@db/ro"
        );
    }

    #[test]
    fn setup_file_fills_unset_values_only() {
        let mut config = Config::default();
        let ov = overrides(
            r#"{"mqtt_host":" broker.local ","mqtt_port":8883,"mqtt_tls":true,"topic_root":"factory","batch_size":50}"#,
        );
        apply_setup_overrides(&mut config, &ov, &|keys| keys.contains(&"MQTT_PORT"));

        assert_eq!(config.mqtt_host, "broker.local");
        assert_eq!(config.mqtt_port, 1883);
        assert!(config.mqtt_tls);
        assert_eq!(config.topic_root, "factory");
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_buffered_rows, 500);
    }

    #[test]
    fn empty_credentials_in_setup_file_clear_them() {
        let mut config = Config {
            mqtt_username: Some("old".to_string()),
            ..Config::default()
        };
        apply_setup_overrides(&mut config, &overrides(r#"{"mqtt_username":"  "}"#), &|_| false);
        assert_eq!(config.mqtt_username, None);
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.topic_root, "plant");
        assert_eq!(config.min_write_interval(), Duration::from_secs(5));
        assert_eq!(config.offline_after(), Duration::from_secs(180));
        assert_eq!(config.watchdog_interval(), Duration::from_secs(30));
        assert_eq!(config.alarm_cooldown(), Duration::from_secs(900));
        assert_eq!(config.max_buffered_rows, config.batch_size * 10);
    }
}
