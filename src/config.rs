//! Configuration
//!
//! `Settings` is loaded once at startup from a TOML file (path from
//! `CCR_RELAY_CONFIG` or a default under `dirs::config_dir()`), then
//! overridden field-by-field from `CCR_*` environment variables on top of
//! the plain file-based config.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub system: SystemConfig,
    pub session: SessionConfig,
    pub concurrency: ConcurrencyConfig,
    pub security: SecurityConfig,
    pub pricing: PricingConfig,
    pub redis: RedisConfig,
    pub server: ServerConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            session: SessionConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            security: SecurityConfig::default(),
            pricing: PricingConfig::default(),
            redis: RedisConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SystemConfig {
    /// Hours offset from UTC used for all day/hour/month/week bucketing.
    pub timezone_offset: i64,
    /// Window, in minutes, for the realtime system metrics bucket.
    pub metrics_window_minutes: i64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            timezone_offset: 0,
            metrics_window_minutes: 5,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub sticky_ttl_hours: i64,
    pub renewal_threshold_minutes: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sticky_ttl_hours: 1,
            renewal_threshold_minutes: 10,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub lease_seconds: i64,
    pub renew_interval_seconds: i64,
    pub cleanup_grace_seconds: i64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            lease_seconds: 300,
            renew_interval_seconds: 30,
            cleanup_grace_seconds: 30,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// Passphrase used to derive per-salt AES keys for credential material.
    pub encryption_key: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PricingConfig {
    pub pricing_url: Option<String>,
    pub hash_url: Option<String>,
    pub fallback_path: Option<PathBuf>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            pricing_url: None,
            hash_url: None,
            fallback_path: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8787".to_string(),
        }
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ccr-relay")
        .join("config.toml")
}

fn config_path() -> PathBuf {
    std::env::var("CCR_RELAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_config_path())
}

fn env_override(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Loads settings from disk, applying `CCR_*` environment overrides on top.
pub fn load() -> Settings {
    let path = config_path();
    let mut settings: Settings = match std::fs::read_to_string(&path) {
        Ok(raw) => toml::from_str(&raw).unwrap_or_else(|e| {
            crate::logger::warn("config", &format!("failed to parse {:?}: {e}", path));
            Settings::default()
        }),
        Err(_) => Settings::default(),
    };

    apply_env_overrides(&mut settings);
    settings
}

fn apply_env_overrides(settings: &mut Settings) {
    if let Some(v) = env_override("CCR_SYSTEM_TIMEZONE_OFFSET") {
        if let Ok(n) = v.parse() {
            settings.system.timezone_offset = n;
        }
    }
    if let Some(v) = env_override("CCR_SYSTEM_METRICS_WINDOW_MINUTES") {
        if let Ok(n) = v.parse() {
            settings.system.metrics_window_minutes = n;
        }
    }
    if let Some(v) = env_override("CCR_SESSION_STICKY_TTL_HOURS") {
        if let Ok(n) = v.parse() {
            settings.session.sticky_ttl_hours = n;
        }
    }
    if let Some(v) = env_override("CCR_SESSION_RENEWAL_THRESHOLD_MINUTES") {
        if let Ok(n) = v.parse() {
            settings.session.renewal_threshold_minutes = n;
        }
    }
    if let Some(v) = env_override("CCR_CONCURRENCY_LEASE_SECONDS") {
        if let Ok(n) = v.parse() {
            settings.concurrency.lease_seconds = n;
        }
    }
    if let Some(v) = env_override("CCR_CONCURRENCY_RENEW_INTERVAL_SECONDS") {
        if let Ok(n) = v.parse() {
            settings.concurrency.renew_interval_seconds = n;
        }
    }
    if let Some(v) = env_override("CCR_CONCURRENCY_CLEANUP_GRACE_SECONDS") {
        if let Ok(n) = v.parse() {
            settings.concurrency.cleanup_grace_seconds = n;
        }
    }
    if let Some(v) = env_override("CCR_SECURITY_ENCRYPTION_KEY") {
        settings.security.encryption_key = v;
    }
    if let Some(v) = env_override("CCR_PRICING_URL") {
        settings.pricing.pricing_url = Some(v);
    }
    if let Some(v) = env_override("CCR_PRICING_HASH_URL") {
        settings.pricing.hash_url = Some(v);
    }
    if let Some(v) = env_override("CCR_REDIS_URL") {
        settings.redis.url = v;
    }
    if let Some(v) = env_override("CCR_SERVER_BIND_ADDR") {
        settings.server.bind_addr = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.concurrency.lease_seconds, 300);
        assert_eq!(s.session.sticky_ttl_hours, 1);
        assert_eq!(s.system.timezone_offset, 0);
    }
}
