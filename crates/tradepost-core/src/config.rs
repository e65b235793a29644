use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tradepost_cache::{CacheConfig, RetryPolicy};

/// Backend endpoint, required at startup
pub const BACKEND_URL_VAR: &str = "TRADEPOST_BACKEND_URL";
/// Anonymous API key, required at startup
pub const ANON_KEY_VAR: &str = "TRADEPOST_BACKEND_ANON_KEY";

/// Main configuration structure
///
/// Backend settings come from the environment and must be present.
/// Cache settings come from the config file, falling back to defaults.
/// Priority: CLI > Env > File > Defaults
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    pub cache: CacheSettings,
}

impl Config {
    /// Load everything; a missing backend variable is fatal
    pub fn load() -> crate::Result<Self> {
        let backend = BackendConfig::from_env()?;
        let cache = FileConfig::load()?.cache;
        Ok(Self { backend, cache })
    }

    /// Config directory: XDG on Linux, Application Support on macOS, AppData on Windows
    pub fn config_dir() -> crate::Result<PathBuf> {
        Ok(dirs::config_dir()
            .ok_or_else(|| crate::Error::ConfigError("Could not find config directory".into()))?
            .join("tradepost"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub url: String,
    pub anon_key: String,
}

impl BackendConfig {
    pub fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source (the environment, a test map, ...)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> crate::Result<Self> {
        let required = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    crate::Error::ConfigError(format!("Missing required environment variable {}", name))
                })
        };

        let url = required(BACKEND_URL_VAR)?;
        let anon_key = required(ANON_KEY_VAR)?;

        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(crate::Error::ConfigError(format!(
                "{} must be an http(s) URL, got {}",
                BACKEND_URL_VAR, url
            )));
        }

        Ok(Self { url, anon_key })
    }
}

/// On-disk config file (`config.toml`)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub cache: CacheSettings,
}

impl FileConfig {
    pub fn load() -> crate::Result<Self> {
        let config_path = Config::config_dir()?.join("config.toml");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            Self::parse(&contents)
        } else {
            // No config file? Use defaults
            Ok(Self::default())
        }
    }

    pub fn parse(contents: &str) -> crate::Result<Self> {
        toml::from_str(contents)
            .map_err(|e| crate::Error::ConfigError(format!("Failed to parse config: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Seconds a result stays fresh
    #[serde(default = "default_stale_time")]
    pub stale_time_secs: u64,

    /// Seconds before a result is dropped
    #[serde(default = "default_gc_time")]
    pub gc_time_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_true")]
    pub retry_jitter: bool,

    /// Keep a snapshot on disk so restarts start warm
    #[serde(default = "default_true")]
    pub persist: bool,

    #[serde(default = "default_persist_max_age")]
    pub persist_max_age_hours: u64,

    /// Snapshot database; defaults to `<config dir>/cache.db`
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

fn default_stale_time() -> u64 {
    5 * 60
}

fn default_gc_time() -> u64 {
    30 * 60
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_initial_delay() -> u64 {
    1000
}

fn default_retry_max_delay() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_persist_max_age() -> u64 {
    24
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            stale_time_secs: default_stale_time(),
            gc_time_secs: default_gc_time(),
            max_retries: default_max_retries(),
            retry_initial_delay_ms: default_retry_initial_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            retry_jitter: true,
            persist: true,
            persist_max_age_hours: default_persist_max_age(),
            db_path: None,
        }
    }
}

impl CacheSettings {
    pub fn db_path(&self) -> crate::Result<PathBuf> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Config::config_dir()?.join("cache.db")),
        }
    }

    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            stale_time: chrono::Duration::seconds(self.stale_time_secs as i64),
            gc_time: chrono::Duration::seconds(self.gc_time_secs as i64),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                initial_delay: std::time::Duration::from_millis(self.retry_initial_delay_ms),
                max_delay: std::time::Duration::from_millis(self.retry_max_delay_ms),
                backoff_multiplier: 2.0,
                jitter: self.retry_jitter,
            },
            persist: self.persist,
            persist_max_age: chrono::Duration::hours(self.persist_max_age_hours as i64),
            // A new release starts with a cold cache
            buster: env!("CARGO_PKG_VERSION").to_string(),
            ..CacheConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_backend_config_from_vars() {
        let env = vars(&[
            (BACKEND_URL_VAR, "https://shop.example.co"),
            (ANON_KEY_VAR, "anon-key"),
        ]);
        let config = BackendConfig::from_lookup(|name| env.get(name).cloned()).unwrap();

        assert_eq!(config.url, "https://shop.example.co");
        assert_eq!(config.anon_key, "anon-key");
    }

    #[test]
    fn test_missing_key_is_fatal() {
        let env = vars(&[(BACKEND_URL_VAR, "https://shop.example.co")]);
        let err = BackendConfig::from_lookup(|name| env.get(name).cloned()).unwrap_err();

        assert!(matches!(err, crate::Error::ConfigError(ref msg) if msg.contains(ANON_KEY_VAR)));
    }

    #[test]
    fn test_blank_url_is_missing() {
        let env = vars(&[(BACKEND_URL_VAR, "   "), (ANON_KEY_VAR, "anon-key")]);
        let err = BackendConfig::from_lookup(|name| env.get(name).cloned()).unwrap_err();

        assert!(matches!(err, crate::Error::ConfigError(ref msg) if msg.contains(BACKEND_URL_VAR)));
    }

    #[test]
    fn test_url_must_be_http() {
        let env = vars(&[(BACKEND_URL_VAR, "shop.example.co"), (ANON_KEY_VAR, "k")]);
        assert!(BackendConfig::from_lookup(|name| env.get(name).cloned()).is_err());
    }

    #[test]
    fn test_default_cache_settings() {
        let settings = CacheSettings::default();
        assert_eq!(settings.stale_time_secs, 300);
        assert_eq!(settings.max_retries, 2);
        assert_eq!(settings.persist_max_age_hours, 24);

        let config = settings.to_cache_config();
        assert_eq!(config.stale_time, chrono::Duration::minutes(5));
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.storage_key, "tradepost.query-cache");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let file = FileConfig::parse("[cache]\nstale_time_secs = 60\npersist = false\n").unwrap();
        assert_eq!(file.cache.stale_time_secs, 60);
        assert!(!file.cache.persist);
        assert_eq!(file.cache.gc_time_secs, 1800);
    }

    #[test]
    fn test_config_serialization() {
        let toml = toml::to_string(&FileConfig::default()).unwrap();
        assert!(toml.contains("stale_time_secs"));
        assert!(toml.contains("max_retries"));
    }
}
