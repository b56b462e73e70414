//! Registry of provider adapters, keyed by name.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::ProviderAdapter;

/// Holds every registered adapter. Blocks resolve their provider by name
/// with a fall-back to the first registered adapter.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name. Re-registering a name
    /// replaces the previous adapter.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name().to_owned(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }

    /// The first registered adapter (by name order), if any.
    pub fn first(&self) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.values().next().cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Resolve a preferred name with fall-back to the first registered
    /// adapter, logging when the preference cannot be honored.
    pub fn resolve(&self, preferred: Option<&str>) -> Option<Arc<dyn ProviderAdapter>> {
        if let Some(name) = preferred {
            if let Some(adapter) = self.get(name) {
                return Some(adapter);
            }
            tracing::warn!(
                preferred = name,
                "preferred adapter not found, falling back to first registered"
            );
        }
        self.first()
    }
}
