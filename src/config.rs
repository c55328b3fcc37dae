//! Configuration types for the cache bucket, storage, and proxy server.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::http::{CacheKey, resolve};

/// Bucket name used when no configuration overrides it.
pub const DEFAULT_CACHE_NAME: &str = "school-guard-v5";

/// Static shell assets pre-cached by default. Dynamic HTML is deliberately absent.
pub const DEFAULT_ASSETS: [&str; 3] = [
    "/static/manifest.json",
    "/static/icons/icon-192x192.png",
    "/static/icons/icon-512x512.png",
];

/// Origin that relative asset paths are resolved against by default.
pub const DEFAULT_ORIGIN: &str = "http://127.0.0.1:8000/";

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "OFFLINE_CACHE_CONFIG";

/// What happens to buckets of other versions when the worker activates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Never delete anything. Old versions stay orphaned on disk.
    #[default]
    KeepAll,
    /// Delete every bucket except the current one.
    PruneOthers,
    /// Delete non-current buckets whose name starts with `prefix`.
    PrunePrefix {
        /// Name prefix shared by all versions of this application's buckets.
        prefix: String,
    },
}

impl RetentionPolicy {
    /// Returns true if `bucket` should be removed while `current` is active.
    #[must_use]
    pub fn should_delete(&self, bucket: &str, current: &str) -> bool {
        if bucket == current {
            return false;
        }
        match self {
            Self::KeepAll => false,
            Self::PruneOthers => true,
            Self::PrunePrefix { prefix } => bucket.starts_with(prefix.as_str()),
        }
    }
}

/// Immutable description of one cache version: its bucket and its assets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Version-stamped bucket name.
    pub cache_name: String,
    /// Assets stored by install, in order.
    pub assets: Vec<String>,
    /// Origin used to resolve relative asset paths.
    pub origin: String,
    /// Deadline for a network attempt before falling back. Unset means wait forever.
    pub network_timeout_ms: Option<u64>,
    /// Maximum number of asset fetches in flight during install.
    pub install_concurrency: usize,
    /// Bucket cleanup applied on activation.
    pub retention: RetentionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            assets: DEFAULT_ASSETS.iter().map(ToString::to_string).collect(),
            origin: DEFAULT_ORIGIN.to_string(),
            network_timeout_ms: None,
            install_concurrency: 4,
            retention: RetentionPolicy::KeepAll,
        }
    }
}

impl CacheConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bucket name.
    #[must_use]
    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    /// Replaces the asset list.
    #[must_use]
    pub fn with_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.assets = assets.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the origin relative asset paths are resolved against.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Sets the network deadline, rounded up to whole milliseconds.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_network_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.network_timeout_ms = match timeout {
            Some(d) => Some(d.as_nanos().div_ceil(1_000_000) as u64),
            None => None,
        };
        self
    }

    /// Sets the number of concurrent asset fetches during install.
    #[must_use]
    pub const fn with_install_concurrency(mut self, concurrency: usize) -> Self {
        self.install_concurrency = concurrency;
        self
    }

    /// Sets the retention policy.
    #[must_use]
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Returns the network deadline, if any.
    #[must_use]
    pub fn network_timeout(&self) -> Option<Duration> {
        self.network_timeout_ms.map(Duration::from_millis)
    }

    /// Parses the configured origin.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the origin is not an absolute URL.
    pub fn origin_url(&self) -> Result<Url> {
        Url::parse(&self.origin).map_err(|e| Error::InvalidUrl {
            input: self.origin.clone(),
            reason: e.to_string(),
        })
    }

    /// Resolves every asset path to an absolute URL, preserving order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] for the first path that cannot be resolved.
    pub fn asset_urls(&self) -> Result<Vec<Url>> {
        let origin = self.origin_url()?;
        self.assets.iter().map(|a| resolve(&origin, a)).collect()
    }

    /// Checks that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.cache_name.trim().is_empty() {
            return Err(Error::InvalidConfig("cache_name must not be empty".to_string()));
        }
        if self.install_concurrency == 0 {
            return Err(Error::InvalidConfig(
                "install_concurrency must be at least 1".to_string(),
            ));
        }
        if self.network_timeout_ms == Some(0) {
            return Err(Error::InvalidConfig(
                "network_timeout_ms must be positive when set".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for url in self.asset_urls()? {
            if !seen.insert(CacheKey::for_url(&url)) {
                return Err(Error::InvalidConfig(format!("asset {url} is listed twice")));
            }
        }
        Ok(())
    }
}

/// Which cache storage backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Persistent buckets under [`StorageConfig::dir`].
    #[default]
    Disk,
    /// Process-local buckets, lost on exit.
    Memory,
}

/// Where buckets are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend.
    pub backend: StorageBackend,
    /// Root directory for the disk backend.
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            backend: StorageBackend::Disk,
            dir: data_dir.join("offline-cache").join("buckets"),
        }
    }
}

/// Proxy server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Origin requests are forwarded to. Falls back to the cache origin when unset.
    pub upstream: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9780,
            upstream: None,
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Cache version and assets.
    pub cache: CacheConfig,
    /// Bucket storage.
    pub storage: StorageConfig,
    /// Proxy server.
    pub server: ServerConfig,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the configuration file path used when none is given explicitly.
    ///
    /// Uses `OFFLINE_CACHE_CONFIG` when set, falling back to
    /// `$XDG_CONFIG_HOME/offline-cache/config.toml`.
    #[must_use]
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            PathBuf::from(path)
        } else {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("offline-cache")
                .join("config.toml")
        }
    }

    /// Parses a configuration from TOML text and validates it.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML or fails validation.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.cache.validate()?;
        Ok(config)
    }

    /// Loads the configuration from `path`, or from [`Self::default_path`].
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map_or_else(Self::default_path, Path::to_path_buf);
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                log::debug!("Loaded config from {}", path.display());
                Self::from_toml(&text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renders the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Returns the upstream origin the proxy forwards to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the configured upstream is not a URL.
    pub fn upstream_url(&self) -> Result<Url> {
        match &self.server.upstream {
            Some(upstream) => Url::parse(upstream).map_err(|e| Error::InvalidUrl {
                input: upstream.clone(),
                reason: e.to_string(),
            }),
            None => self.cache.origin_url(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cache_config() {
        let config = CacheConfig::default();
        assert_eq!(config.cache_name, "school-guard-v5");
        assert_eq!(config.assets.len(), 3);
        assert_eq!(config.assets[0], "/static/manifest.json");
        assert_eq!(config.network_timeout(), None);
        assert_eq!(config.retention, RetentionPolicy::KeepAll);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn cache_config_builder_pattern() {
        let config = CacheConfig::new()
            .with_cache_name("app-v2")
            .with_assets(["/a.css", "/b.js"])
            .with_origin("http://example.com/")
            .with_network_timeout(Some(Duration::from_secs(3)))
            .with_install_concurrency(1)
            .with_retention(RetentionPolicy::PruneOthers);

        assert_eq!(config.cache_name, "app-v2");
        assert_eq!(config.assets, vec!["/a.css", "/b.js"]);
        assert_eq!(config.network_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(config.install_concurrency, 1);
        assert_eq!(config.retention, RetentionPolicy::PruneOthers);
    }

    #[test]
    fn asset_urls_resolve_against_origin() {
        let config = CacheConfig::new().with_origin("http://school.local:8000/");
        let urls = config.asset_urls().unwrap();
        assert_eq!(
            urls[1].as_str(),
            "http://school.local:8000/static/icons/icon-192x192.png"
        );
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(CacheConfig::new().with_cache_name("  ").validate().is_err());
        assert!(CacheConfig::new().with_install_concurrency(0).validate().is_err());
        assert!(CacheConfig::new().with_origin("not a url").validate().is_err());
        assert!(
            CacheConfig::new()
                .with_network_timeout(Some(Duration::ZERO))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn sub_millisecond_timeout_rounds_up() {
        let config = CacheConfig::new().with_network_timeout(Some(Duration::from_micros(500)));
        assert_eq!(config.network_timeout(), Some(Duration::from_millis(1)));
        assert!(config.validate().is_ok());

        let config = CacheConfig::new().with_network_timeout(Some(Duration::from_micros(1500)));
        assert_eq!(config.network_timeout(), Some(Duration::from_millis(2)));
    }

    #[test]
    fn validate_rejects_repeated_assets() {
        let repeated =
            CacheConfig::new().with_assets(["/static/manifest.json", "/static/manifest.json"]);
        let err = repeated.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(ref msg) if msg.contains("listed twice")));

        // An absolute URL and a relative path naming the same resource collide.
        let aliased = CacheConfig::new()
            .with_origin("http://school.local/")
            .with_assets(["/static/manifest.json", "http://school.local/static/manifest.json"]);
        assert!(aliased.validate().is_err());

        // Fragments are not part of the key.
        let fragment = CacheConfig::new().with_assets(["/app.js", "/app.js#main"]);
        assert!(fragment.validate().is_err());

        let query = CacheConfig::new().with_assets(["/app.js", "/app.js?v=2"]);
        assert!(query.validate().is_ok());
    }

    #[test]
    fn retention_never_deletes_current() {
        for policy in [
            RetentionPolicy::KeepAll,
            RetentionPolicy::PruneOthers,
            RetentionPolicy::PrunePrefix {
                prefix: "school-guard-".to_string(),
            },
        ] {
            assert!(!policy.should_delete("school-guard-v5", "school-guard-v5"));
        }
    }

    #[test]
    fn retention_modes() {
        let current = "school-guard-v5";
        assert!(!RetentionPolicy::KeepAll.should_delete("school-guard-v4", current));
        assert!(RetentionPolicy::PruneOthers.should_delete("other-app-v1", current));

        let prefix = RetentionPolicy::PrunePrefix {
            prefix: "school-guard-".to_string(),
        };
        assert!(prefix.should_delete("school-guard-v4", current));
        assert!(!prefix.should_delete("other-app-v1", current));
    }

    #[test]
    fn app_config_parses_partial_toml() {
        let text = r#"
[cache]
cache_name = "school-guard-v6"
network_timeout_ms = 2500

[cache.retention]
mode = "prune_prefix"
prefix = "school-guard-"

[storage]
backend = "memory"
"#;
        let config = AppConfig::from_toml(text).unwrap();
        assert_eq!(config.cache.cache_name, "school-guard-v6");
        assert_eq!(config.cache.assets.len(), 3);
        assert_eq!(config.cache.network_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(
            config.cache.retention,
            RetentionPolicy::PrunePrefix {
                prefix: "school-guard-".to_string()
            }
        );
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.server.port, 9780);
    }

    #[test]
    fn app_config_toml_round_trip() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn app_config_rejects_invalid_cache_section() {
        let text = "[cache]\ninstall_concurrency = 0\n";
        assert!(matches!(
            AppConfig::from_toml(text),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = AppConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = 1234\nupstream = \"http://10.0.0.2:8000/\"\n")
            .unwrap();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 1234);
        assert_eq!(
            config.upstream_url().unwrap().as_str(),
            "http://10.0.0.2:8000/"
        );
    }

    #[test]
    fn upstream_defaults_to_cache_origin() {
        let config = AppConfig::default();
        assert_eq!(config.upstream_url().unwrap().as_str(), DEFAULT_ORIGIN);
    }

    #[test]
    fn default_storage_dir_is_namespaced() {
        let config = StorageConfig::default();
        assert!(config.dir.to_string_lossy().contains("offline-cache"));
    }
}
