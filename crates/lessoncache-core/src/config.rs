//! Proxy configuration management.
//!
//! Configuration is stored at `~/.config/lessoncache/config.json`. A missing
//! file means defaults. A few fields can be overridden from the environment:
//!
//! - `LESSONCACHE_ORIGIN`
//! - `LESSONCACHE_VERSION`
//! - `LESSONCACHE_SYNC_ENDPOINT`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::classify::RoutePatterns;
use crate::error::ConfigError;
use crate::store::validate_generation;
use crate::strategy::StrategyTimeouts;
use crate::tasks::DEFAULT_MAX_BACKGROUND_TASKS;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "lessoncache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const QUEUE_FILE: &str = "queue.json";
const GENERATIONS_DIR: &str = "generations";

pub const ENV_ORIGIN: &str = "LESSONCACHE_ORIGIN";
pub const ENV_VERSION: &str = "LESSONCACHE_VERSION";
pub const ENV_SYNC_ENDPOINT: &str = "LESSONCACHE_SYNC_ENDPOINT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Generation id of this deployment. Bump it to roll out new assets.
    pub version: String,
    /// Base URL that relative resources resolve against
    pub origin: String,
    /// Must all be fetched for install to succeed. Paths resolve against `origin`.
    pub critical_resources: Vec<String>,
    /// Fetched best-effort during install
    pub secondary_resources: Vec<String>,
    /// Document served to HTML requests when nothing else is available
    pub offline_fallback: String,
    pub routes: RoutePatterns,
    pub timeouts: StrategyTimeouts,
    pub install_timeout_ms: u64,
    pub sync_endpoint: Option<String>,
    pub max_background_tasks: usize,
    pub cache_dir: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            version: "v1".to_string(),
            origin: "http://localhost:8080/".to_string(),
            critical_resources: vec!["/".to_string(), "/index.html".to_string()],
            secondary_resources: Vec::new(),
            offline_fallback: "/offline.html".to_string(),
            routes: RoutePatterns::default(),
            timeouts: StrategyTimeouts::default(),
            install_timeout_ms: 30_000,
            sync_endpoint: None,
            max_background_tasks: DEFAULT_MAX_BACKGROUND_TASKS,
            cache_dir: None,
        }
    }
}

impl ProxyConfig {
    /// Load from `path`, or the default location when `None`. Environment
    /// overrides are applied and the result validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };
        let mut config = Self::load_file(&path)?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };
        let write_error = |source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        let contents = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        std::fs::write(&path, contents).map_err(write_error)?;
        Ok(path)
    }

    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoDirectory("config"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(origin) = lookup(ENV_ORIGIN) {
            Url::parse(&origin)
                .map_err(|e| ConfigError::Invalid(format!("{}={:?}: {}", ENV_ORIGIN, origin, e)))?;
            self.origin = origin;
        }
        if let Some(version) = lookup(ENV_VERSION) {
            self.version = version;
        }
        if let Some(endpoint) = lookup(ENV_SYNC_ENDPOINT) {
            self.sync_endpoint = Some(endpoint).filter(|e| !e.is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_generation(&self.version)
            .map_err(|_| ConfigError::Invalid(format!("version {:?} is not a valid generation id", self.version)))?;

        let origin = self.origin_url()?;
        if !matches!(origin.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "origin must be http or https, got {}",
                origin
            )));
        }
        if self.max_background_tasks == 0 {
            return Err(ConfigError::Invalid(
                "max_background_tasks must be at least 1".to_string(),
            ));
        }

        self.critical_urls()?;
        self.secondary_urls()?;
        self.sync_endpoint_url()?;
        Ok(())
    }

    pub fn origin_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.origin)
            .map_err(|e| ConfigError::Invalid(format!("origin {:?}: {}", self.origin, e)))
    }

    /// Resolve a configured path or absolute URL against the origin.
    pub fn resolve(&self, resource: &str) -> Result<Url, ConfigError> {
        self.origin_url()?
            .join(resource)
            .map_err(|e| ConfigError::Invalid(format!("resource {:?}: {}", resource, e)))
    }

    /// Critical set. Always contains the offline document.
    pub fn critical_urls(&self) -> Result<Vec<Url>, ConfigError> {
        let mut urls = self
            .critical_resources
            .iter()
            .map(|r| self.resolve(r))
            .collect::<Result<Vec<_>, _>>()?;
        let fallback = self.offline_fallback_url()?;
        if !urls.contains(&fallback) {
            urls.push(fallback);
        }
        Ok(urls)
    }

    pub fn secondary_urls(&self) -> Result<Vec<Url>, ConfigError> {
        self.secondary_resources.iter().map(|r| self.resolve(r)).collect()
    }

    pub fn offline_fallback_url(&self) -> Result<Url, ConfigError> {
        self.resolve(&self.offline_fallback)
    }

    pub fn sync_endpoint_url(&self) -> Result<Option<Url>, ConfigError> {
        self.sync_endpoint.as_deref().map(|e| self.resolve(e)).transpose()
    }

    pub fn install_deadline(&self) -> Duration {
        Duration::from_millis(self.install_timeout_ms)
    }

    pub fn cache_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir().ok_or(ConfigError::NoDirectory("cache"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn generations_dir(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.cache_dir()?.join(GENERATIONS_DIR))
    }

    pub fn queue_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.cache_dir()?.join(QUEUE_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| pairs.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProxyConfig::load_file(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, ProxyConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"version": "v7", "origin": "https://learn.example/", "timeouts": {"network_first_ms": 2500}}"#,
        )
        .unwrap();

        let config = ProxyConfig::load_file(&path).unwrap();
        assert_eq!(config.version, "v7");
        assert_eq!(config.timeouts.network_first_ms, 2500);
        assert_eq!(config.timeouts.cache_first_ms, 30_000);
        assert_eq!(config.offline_fallback, "/offline.html");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = ProxyConfig {
            version: "v3".to_string(),
            secondary_resources: vec!["/lessons/intro.json".to_string()],
            ..Default::default()
        };
        config.save(Some(&path)).unwrap();
        assert_eq!(ProxyConfig::load_file(&path).unwrap(), config);
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = ProxyConfig::load_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.json"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ProxyConfig::default();
        config
            .apply_overrides(env(&[
                (ENV_ORIGIN, "https://learn.example/"),
                (ENV_VERSION, "v9"),
                (ENV_SYNC_ENDPOINT, "/api/progress"),
            ]))
            .unwrap();
        assert_eq!(config.origin, "https://learn.example/");
        assert_eq!(config.version, "v9");
        assert_eq!(
            config.sync_endpoint_url().unwrap().unwrap().as_str(),
            "https://learn.example/api/progress"
        );
    }

    #[test]
    fn test_bad_origin_override() {
        let mut config = ProxyConfig::default();
        let err = config.apply_overrides(env(&[(ENV_ORIGIN, "not a url")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_critical_urls_include_offline_document() {
        let config = ProxyConfig {
            origin: "https://learn.example/".to_string(),
            critical_resources: vec!["/".to_string(), "/app.js".to_string()],
            ..Default::default()
        };
        let urls: Vec<String> = config
            .critical_urls()
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://learn.example/",
                "https://learn.example/app.js",
                "https://learn.example/offline.html",
            ]
        );

        // Not duplicated when already listed
        let config = ProxyConfig {
            critical_resources: vec!["/offline.html".to_string()],
            ..config
        };
        assert_eq!(config.critical_urls().unwrap().len(), 1);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = ProxyConfig {
            version: "../v1".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ProxyConfig {
            origin: "ftp://learn.example/".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ProxyConfig {
            max_background_tasks: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_cache_dir() {
        let config = ProxyConfig {
            cache_dir: Some(PathBuf::from("/tmp/lc")),
            ..Default::default()
        };
        assert_eq!(config.generations_dir().unwrap(), PathBuf::from("/tmp/lc/generations"));
        assert_eq!(config.queue_path().unwrap(), PathBuf::from("/tmp/lc/queue.json"));
    }
}
