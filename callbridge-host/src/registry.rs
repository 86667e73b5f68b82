//! Plugin registry
//!
//! Provides a thread-safe registry for the plugins the dispatcher can reach,
//! with support for dynamic addition and removal.

use crate::loader::{LoaderError, WasmPluginLoader};
use crate::plugin::Plugin;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// A thread-safe registry for managing plugins
#[derive(Clone)]
pub struct PluginRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    loader: Arc<WasmPluginLoader>,
}

#[derive(Default)]
struct RegistryInner {
    /// Plugins indexed by plugin name
    plugins: HashMap<String, PluginEntry>,
    /// Map from file path to plugin name for wasm plugins
    path_to_plugin: HashMap<PathBuf, String>,
}

struct PluginEntry {
    plugin: Arc<dyn Plugin>,
    source_path: Option<PathBuf>,
}

impl PluginRegistry {
    /// Create a new empty plugin registry
    pub fn new() -> Result<Self, LoaderError> {
        Ok(Self::with_loader(WasmPluginLoader::new()?))
    }

    /// Create with an existing wasm loader
    pub fn with_loader(loader: WasmPluginLoader) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            loader: Arc::new(loader),
        }
    }

    /// Register a plugin, replacing any plugin with the same name
    pub fn register(&self, plugin: impl Plugin + 'static) -> String {
        self.register_arc(Arc::new(plugin), None)
    }

    fn register_arc(&self, plugin: Arc<dyn Plugin>, source_path: Option<PathBuf>) -> String {
        let name = plugin.name().to_string();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(old) = inner.plugins.remove(&name) {
            if let Some(path) = old.source_path {
                inner.path_to_plugin.remove(&path);
            }
            tracing::debug!(plugin = %name, "Replacing registered plugin");
        }
        if let Some(path) = &source_path {
            if let Some(old_name) = inner.path_to_plugin.insert(path.clone(), name.clone()) {
                if old_name != name {
                    inner.plugins.remove(&old_name);
                }
            }
        }
        inner.plugins.insert(
            name.clone(),
            PluginEntry {
                plugin,
                source_path,
            },
        );

        tracing::info!(plugin = %name, "Plugin registered");
        name
    }

    /// Load a wasm plugin from a file path and register it
    pub async fn load_plugin(&self, path: impl AsRef<Path>) -> Result<String, LoaderError> {
        let path = path.as_ref();
        let wasm_bytes = tokio::fs::read(path).await.map_err(|e| {
            LoaderError::MemoryAccess(format!("Failed to read file {}: {}", path.display(), e))
        })?;

        let plugin = self.loader.load(&wasm_bytes)?;
        let name = self.register_arc(Arc::new(plugin), Some(path.to_path_buf()));
        tracing::info!(plugin = %name, path = %path.display(), "Wasm plugin loaded");
        Ok(name)
    }

    /// Unload a plugin by name
    pub fn unload(&self, name: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(entry) = inner.plugins.remove(name) {
            if let Some(path) = entry.source_path {
                inner.path_to_plugin.remove(&path);
            }
            tracing::info!(plugin = %name, "Plugin unloaded");
            true
        } else {
            false
        }
    }

    /// Unload a wasm plugin by the file it was loaded from
    pub fn unload_by_path(&self, path: impl AsRef<Path>) -> Option<String> {
        let path = path.as_ref();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let name = inner.path_to_plugin.remove(path)?;
        inner.plugins.remove(&name);
        tracing::info!(plugin = %name, path = %path.display(), "Plugin unloaded");
        Some(name)
    }

    /// Look up a plugin by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.plugins.get(name).map(|e| e.plugin.clone())
    }

    /// Check if a plugin exists
    pub fn has_plugin(&self, name: &str) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.plugins.contains_key(name)
    }

    /// Get a sorted list of all registered plugin names
    pub fn list_plugins(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = inner.plugins.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the number of registered plugins
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.plugins.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PluginRegistry {
    /// Creates a new empty PluginRegistry with default settings.
    ///
    /// # Panics
    /// Panics if the underlying wasm engine fails to initialize.
    /// Use `PluginRegistry::new()` for fallible construction.
    fn default() -> Self {
        Self::new().expect("Failed to create PluginRegistry: wasm engine initialization failed")
    }
}
