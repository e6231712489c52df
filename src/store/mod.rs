//! Storage collaborator - where tenant capability models come from.
//!
//! The hub only needs one read: the persisted [`CapabilityModel`] for an
//! install and capability name. [`MemoryStore`] backs tests and the
//! standalone server, optionally seeded from a YAML tenants file:
//!
//! ```yaml
//! capabilities:
//!   - id: "cap-1"
//!     install_id: "acme"
//!     space_id: "main"
//!     capability: "pubsub"
//!     options: {}
//! ```

use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use crate::capabilities::CapabilityModel;
use crate::error::{HubError, HubResult};

/// Read access to persisted capability models.
#[async_trait]
pub trait CapabilityStore: Send + Sync {
    /// Fetch the model for `(install_id, capability)`.
    ///
    /// Fails with [`HubError::ModelNotFound`] when the tenant has not been
    /// provisioned for this capability.
    async fn get_capability_model(
        &self,
        install_id: &str,
        capability: &str,
    ) -> HubResult<CapabilityModel>;
}

/// In-memory store keyed by `(install_id, capability)`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    models: DashMap<(String, String), CapabilityModel>,
}

#[derive(Debug, Deserialize)]
struct TenantsFile {
    #[serde(default)]
    capabilities: Vec<CapabilityModel>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a model. Returns the previous one, if any.
    pub fn put(&self, model: CapabilityModel) -> Option<CapabilityModel> {
        let key = (model.install_id.clone(), model.capability.clone());
        self.models.insert(key, model)
    }

    pub fn remove(&self, install_id: &str, capability: &str) -> Option<CapabilityModel> {
        self.models
            .remove(&(install_id.to_string(), capability.to_string()))
            .map(|(_, model)| model)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Seed from a YAML document with a top-level `capabilities:` list.
    pub fn load_yaml(&self, content: &str) -> HubResult<usize> {
        let file: TenantsFile = serde_yaml::from_str(content)
            .map_err(|e| HubError::validation(format!("invalid tenants file: {}", e)))?;
        let count = file.capabilities.len();
        for model in file.capabilities {
            self.put(model);
        }
        Ok(count)
    }

    pub fn load_file(&self, path: &Path) -> HubResult<usize> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HubError::upstream(&format!("reading {}", path.display()), e))?;
        self.load_yaml(&content)
    }
}

#[async_trait]
impl CapabilityStore for MemoryStore {
    async fn get_capability_model(
        &self,
        install_id: &str,
        capability: &str,
    ) -> HubResult<CapabilityModel> {
        self.models
            .get(&(install_id.to_string(), capability.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| HubError::ModelNotFound {
                install_id: install_id.to_string(),
                capability: capability.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryStore::new();
        store.put(CapabilityModel::new("m1", "acme", "main", "pubsub"));

        let model = store.get_capability_model("acme", "pubsub").await.unwrap();
        assert_eq!(model.id, "m1");
        assert_eq!(model.space_id, "main");
    }

    #[tokio::test]
    async fn test_missing_model() {
        let store = MemoryStore::new();
        let err = store.get_capability_model("acme", "relay").await.unwrap_err();
        assert!(matches!(err, HubError::ModelNotFound { .. }));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_put_replaces() {
        let store = MemoryStore::new();
        store.put(CapabilityModel::new("m1", "acme", "main", "pubsub"));
        let previous = store.put(CapabilityModel::new("m2", "acme", "main", "pubsub"));
        assert_eq!(previous.unwrap().id, "m1");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_load_yaml() {
        let store = MemoryStore::new();
        let count = store
            .load_yaml(
                r#"
capabilities:
  - id: "cap-1"
    install_id: "acme"
    space_id: "main"
    capability: "pubsub"
  - id: "cap-2"
    install_id: "acme"
    space_id: "main"
    capability: "relay"
    options:
      queue: 8
"#,
            )
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.len(), 2);
        assert!(store.remove("acme", "relay").is_some());
        assert_eq!(store.len(), 1);
    }
}
