//! Bridge configuration and its fallback sources
//!
//! The active [`BridgeConfig`] comes from an ordered list of
//! [`ConfigProvider`]s: the first one returning a config wins.
//!
//! ```json
//! {
//!   "cache": { "Storage": { "get": 10000 } },
//!   "syncMethods": { "Device": "all", "Preferences": ["get"] },
//!   "writeMethods": { "Preferences": ["set", "remove", "clear"] },
//!   "syncEnabled": true,
//!   "syncTimeoutMs": 30000,
//!   "cacheMaxEntries": 200
//! }
//! ```

use crate::cache::DEFAULT_MAX_ENTRIES;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default budget for a synchronous call, in milliseconds
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 30_000;

/// File name used by [`FileProvider::default_for_app`]
pub const CONFIG_FILE_NAME: &str = "callbridge.json";

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config from {source_name}: {error}")]
    Parse {
        source_name: String,
        #[source]
        error: serde_json::Error,
    },
}

/// Keyword form of a sync-eligibility entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKeyword {
    All,
}

/// Sync-eligible methods of one plugin: a list, or `"all"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SyncMethods {
    Methods(Vec<String>),
    Keyword(SyncKeyword),
}

impl SyncMethods {
    pub fn contains(&self, method: &str) -> bool {
        match self {
            Self::Keyword(SyncKeyword::All) => true,
            Self::Methods(methods) => methods.iter().any(|m| m == method),
        }
    }
}

/// Routing configuration consumed by the call router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    /// Cache-eligible methods: `plugin -> method -> ttl in milliseconds`
    pub cache: BTreeMap<String, BTreeMap<String, u64>>,

    /// Methods allowed on the synchronous channel
    pub sync_methods: BTreeMap<String, SyncMethods>,

    /// Methods whose success invalidates the plugin's cached results
    pub write_methods: BTreeMap<String, Vec<String>>,

    /// Global switch for the synchronous channel
    pub sync_enabled: bool,

    pub sync_timeout_ms: u64,

    pub cache_max_entries: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            cache: BTreeMap::new(),
            sync_methods: BTreeMap::new(),
            write_methods: BTreeMap::new(),
            sync_enabled: true,
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            cache_max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl BridgeConfig {
    /// Parse a JSON config
    pub fn from_json(json: &str, source_name: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|error| ConfigError::Parse {
            source_name: source_name.to_string(),
            error,
        })
    }

    /// Cache a method's results for `ttl_ms`
    pub fn cache_method(mut self, plugin: &str, method: &str, ttl_ms: u64) -> Self {
        self.cache
            .entry(plugin.to_string())
            .or_default()
            .insert(method.to_string(), ttl_ms);
        self
    }

    /// Allow a method on the synchronous channel
    pub fn sync_method(mut self, plugin: &str, method: &str) -> Self {
        match self
            .sync_methods
            .entry(plugin.to_string())
            .or_insert_with(|| SyncMethods::Methods(Vec::new()))
        {
            SyncMethods::Methods(methods) => methods.push(method.to_string()),
            SyncMethods::Keyword(SyncKeyword::All) => {}
        }
        self
    }

    /// Allow every method of a plugin on the synchronous channel
    pub fn sync_all(mut self, plugin: &str) -> Self {
        self.sync_methods
            .insert(plugin.to_string(), SyncMethods::Keyword(SyncKeyword::All));
        self
    }

    /// Classify a method as a cache-invalidating write
    pub fn write_method(mut self, plugin: &str, method: &str) -> Self {
        self.write_methods
            .entry(plugin.to_string())
            .or_default()
            .push(method.to_string());
        self
    }

    pub fn sync_enabled(mut self, enabled: bool) -> Self {
        self.sync_enabled = enabled;
        self
    }

    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn cache_max_entries(mut self, max_entries: usize) -> Self {
        self.cache_max_entries = max_entries;
        self
    }

    /// TTL for a cache-eligible method
    pub fn cache_ttl(&self, plugin: &str, method: &str) -> Option<Duration> {
        self.cache
            .get(plugin)
            .and_then(|methods| methods.get(method))
            .map(|ms| Duration::from_millis(*ms))
    }

    pub fn is_sync_method(&self, plugin: &str, method: &str) -> bool {
        self.sync_methods
            .get(plugin)
            .is_some_and(|methods| methods.contains(method))
    }

    pub fn is_write_method(&self, plugin: &str, method: &str) -> bool {
        self.write_methods
            .get(plugin)
            .is_some_and(|methods| methods.iter().any(|m| m == method))
    }

    pub fn sync_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    /// Stable digest of the config, used for diagnostics and change detection
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&bytes).to_hex()[..16].to_string()
    }
}

/// One source of configuration
pub trait ConfigProvider: Send + Sync {
    /// Name logged when this provider supplies the active config
    fn name(&self) -> &str;

    /// `Ok(None)` when the source has nothing to offer
    fn load(&self) -> Result<Option<BridgeConfig>, ConfigError>;
}

/// Config passed explicitly by the embedding application
pub struct OverrideProvider {
    config: Option<BridgeConfig>,
}

impl OverrideProvider {
    pub fn new(config: Option<BridgeConfig>) -> Self {
        Self { config }
    }
}

impl ConfigProvider for OverrideProvider {
    fn name(&self) -> &str {
        "override"
    }

    fn load(&self) -> Result<Option<BridgeConfig>, ConfigError> {
        Ok(self.config.clone())
    }
}

/// Config JSON injected by the platform at runtime attach
pub struct InjectedProvider {
    json: Option<String>,
}

impl InjectedProvider {
    pub fn new(json: Option<String>) -> Self {
        Self { json }
    }
}

impl ConfigProvider for InjectedProvider {
    fn name(&self) -> &str {
        "injected"
    }

    fn load(&self) -> Result<Option<BridgeConfig>, ConfigError> {
        match self.json.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(json) => BridgeConfig::from_json(json, self.name()).map(Some),
        }
    }
}

/// Config read from a JSON file; a missing file is empty, not an error
pub struct FileProvider {
    path: PathBuf,
}

impl FileProvider {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Provider for `<config dir>/<app>/callbridge.json`
    pub fn default_for_app(app_name: &str) -> Self {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
        Self::new(config_dir.join(app_name).join(CONFIG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for FileProvider {
    fn name(&self) -> &str {
        "file"
    }

    fn load(&self) -> Result<Option<BridgeConfig>, ConfigError> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if json.trim().is_empty() {
            return Ok(None);
        }
        BridgeConfig::from_json(&json, &self.path.display().to_string()).map(Some)
    }
}

/// Config selected by [`load_config`]
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: BridgeConfig,
    /// Name of the provider that supplied it, or `"default"`
    pub source: String,
    pub digest: String,
}

/// Try providers in order; the first non-empty result wins.
///
/// A failing provider is logged and skipped.
pub fn load_config(providers: &[Box<dyn ConfigProvider>]) -> LoadedConfig {
    for provider in providers {
        match provider.load() {
            Ok(Some(config)) => {
                let digest = config.digest();
                tracing::info!(source = %provider.name(), digest = %digest, "Bridge config loaded");
                return LoadedConfig {
                    config,
                    source: provider.name().to_string(),
                    digest,
                };
            }
            Ok(None) => {
                tracing::debug!(source = %provider.name(), "Config source empty");
            }
            Err(e) => {
                tracing::warn!(source = %provider.name(), error = %e, "Config source failed");
            }
        }
    }

    let config = BridgeConfig::default();
    let digest = config.digest();
    tracing::info!(source = "default", digest = %digest, "No config source available, using defaults");
    LoadedConfig {
        config,
        source: "default".to_string(),
        digest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "cache": { "Storage": { "get": 10000 } },
        "syncMethods": { "Device": "all", "Preferences": ["get"] },
        "writeMethods": { "Preferences": ["set"] },
        "syncTimeoutMs": 500
    }"#;

    #[test]
    fn test_parse_config() {
        let config = BridgeConfig::from_json(SAMPLE, "test").unwrap();
        assert_eq!(
            config.cache_ttl("Storage", "get"),
            Some(Duration::from_millis(10_000))
        );
        assert_eq!(config.cache_ttl("Storage", "set"), None);
        assert!(config.is_sync_method("Device", "anything"));
        assert!(config.is_sync_method("Preferences", "get"));
        assert!(!config.is_sync_method("Preferences", "set"));
        assert!(config.is_write_method("Preferences", "set"));
        assert!(config.sync_enabled);
        assert_eq!(config.sync_timeout_duration(), Duration::from_millis(500));
        assert_eq!(config.cache_max_entries, DEFAULT_MAX_ENTRIES);
    }

    #[test]
    fn test_reject_unknown_sync_keyword() {
        let result = BridgeConfig::from_json(r#"{"syncMethods": {"Device": "some"}}"#, "test");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_builder_matches_json() {
        let built = BridgeConfig::default()
            .cache_method("Storage", "get", 10_000)
            .sync_all("Device")
            .sync_method("Preferences", "get")
            .write_method("Preferences", "set")
            .sync_timeout(Duration::from_millis(500));
        let parsed = BridgeConfig::from_json(SAMPLE, "test").unwrap();
        assert_eq!(built, parsed);
        assert_eq!(built.digest(), parsed.digest());
        assert_ne!(built.digest(), BridgeConfig::default().digest());
    }

    #[test]
    fn test_first_non_empty_provider_wins() {
        let providers: Vec<Box<dyn ConfigProvider>> = vec![
            Box::new(OverrideProvider::new(None)),
            Box::new(InjectedProvider::new(Some(SAMPLE.to_string()))),
            Box::new(OverrideProvider::new(Some(BridgeConfig::default()))),
        ];
        let loaded = load_config(&providers);
        assert_eq!(loaded.source, "injected");
        assert!(loaded.config.is_write_method("Preferences", "set"));
    }

    #[test]
    fn test_failing_provider_is_skipped() {
        let providers: Vec<Box<dyn ConfigProvider>> = vec![
            Box::new(InjectedProvider::new(Some("{broken".to_string()))),
            Box::new(OverrideProvider::new(Some(
                BridgeConfig::default().sync_enabled(false),
            ))),
        ];
        let loaded = load_config(&providers);
        assert_eq!(loaded.source, "override");
        assert!(!loaded.config.sync_enabled);
    }

    #[test]
    fn test_defaults_when_all_empty() {
        let temp = TempDir::new().unwrap();
        let providers: Vec<Box<dyn ConfigProvider>> = vec![
            Box::new(InjectedProvider::new(Some("  ".to_string()))),
            Box::new(FileProvider::new(temp.path().join("missing.json"))),
        ];
        let loaded = load_config(&providers);
        assert_eq!(loaded.source, "default");
        assert_eq!(loaded.config, BridgeConfig::default());
    }

    #[test]
    fn test_file_provider() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);
        fs::write(&path, SAMPLE).unwrap();

        let provider = FileProvider::new(&path);
        let config = provider.load().unwrap().unwrap();
        assert!(config.is_sync_method("Device", "info"));
    }

    #[test]
    fn test_default_for_app_path() {
        let provider = FileProvider::default_for_app("myapp");
        assert!(provider.path().ends_with("myapp/callbridge.json"));
    }

    #[test]
    fn test_sync_timeout_saturates() {
        let config = BridgeConfig::default().sync_timeout(Duration::MAX);
        assert_eq!(config.sync_timeout_ms, u64::MAX);
    }
}
