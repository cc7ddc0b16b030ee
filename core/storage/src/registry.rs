//! Provider registry for dynamic provider resolution.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use stowage_common::{Result, StorageError};

use crate::local::{LocalOptions, LocalProvider};
use crate::memory::MemoryProvider;
use crate::normalize;
use crate::provider::StorageProvider;

/// Factory function type for creating providers.
pub type ProviderFactory = Box<dyn Fn(Value) -> Result<Arc<dyn StorageProvider>> + Send + Sync>;

/// Registry for storage provider factories.
///
/// Allows dynamic registration and resolution of storage providers
/// by name and configuration.
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a provider factory.
    ///
    /// # Errors
    /// - `GenericException` if `name` is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: ProviderFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(StorageError::generic(format!(
                "Provider '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a provider by name and configuration.
    ///
    /// # Errors
    /// - `GenericException` if the provider is not registered or the
    ///   configuration cannot be parsed
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn StorageProvider>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            StorageError::generic(format!("Provider '{}' is not registered", name))
        })?;
        tracing::debug!(provider = name, "Resolving storage provider");
        factory(config)
    }

    /// Get registered provider names, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a provider is registered.
    pub fn has_provider(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn create_memory_provider(_config: Value) -> Result<Arc<dyn StorageProvider>> {
    Ok(Arc::new(MemoryProvider::new()))
}

fn create_local_provider(config: Value) -> Result<Arc<dyn StorageProvider>> {
    let options: LocalOptions = serde_json::from_value(config)
        .map_err(|e| normalize::from_json(e, "Local provider requires 'root' path"))?;
    Ok(Arc::new(LocalProvider::from_options(&options)?))
}

/// Create a registry with the built-in providers: `memory`, `local`, `gcs`.
pub fn create_default_registry() -> ProviderRegistry {
    let mut factories: HashMap<String, ProviderFactory> = HashMap::new();

    // Memory provider (for testing)
    factories.insert("memory".to_string(), Box::new(create_memory_provider));
    factories.insert("local".to_string(), Box::new(create_local_provider));
    factories.insert("gcs".to_string(), Box::new(crate::gcs::create_gcs_provider));

    ProviderRegistry { factories }
}
