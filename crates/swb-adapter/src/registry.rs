// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed registry of named adapters.

use std::collections::HashMap;
use std::sync::Arc;

use crate::BackendAdapter;

/// A typed registry of named [`BackendAdapter`] implementations.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn BackendAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name, replacing any previous entry.
    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Look up an adapter by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn BackendAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Return a sorted list of registered adapter names.
    #[must_use]
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Whether an adapter with the given name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Remove an adapter by name, returning it if it existed.
    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn BackendAdapter>> {
        self.adapters.remove(name)
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.list())
            .finish()
    }
}
