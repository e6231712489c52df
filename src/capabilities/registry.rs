//! Capability Registry - the name → factory table populated at bootstrap.
//!
//! The registry is an explicit value built during application startup and
//! handed to [`CapabilityHub::init`](super::hub::CapabilityHub::init); there
//! is no process-wide instance. Registration is last-writer-wins.

use std::collections::HashMap;

use super::capability::CapabilityFactory;

/// Table of capability factories indexed by name.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    factories: HashMap<String, CapabilityFactory>,
}

impl CapabilityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its name.
    ///
    /// A factory already registered under the same name is replaced.
    pub fn register(&mut self, factory: CapabilityFactory) {
        if let Some(previous) = self.factories.insert(factory.name.clone(), factory) {
            log::debug!("Capability factory '{}' replaced", previous.name);
        }
    }

    /// Look up a factory by name.
    pub fn get(&self, name: &str) -> Option<&CapabilityFactory> {
        self.factories.get(name)
    }

    /// Snapshot of all registered factories, sorted by name.
    ///
    /// The returned collection is owned by the caller; changing it has no
    /// effect on the registry.
    pub fn list(&self) -> Vec<CapabilityFactory> {
        let mut factories: Vec<CapabilityFactory> = self.factories.values().cloned().collect();
        factories.sort_by(|a, b| a.name.cmp(&b.name));
        factories
    }

    /// Get the total number of registered factories.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
