//! Capability Hub - builds, caches, reloads, and invokes tenant instances.
//!
//! The hub owns one [`CapabilityBuilder`] per registered name and a cache of
//! realized instances keyed by [`InstanceKey`]. All invocation goes through
//! it:
//!
//! ```text
//! execute(name, install, space, action, params)
//!   → resolve(name, install, space)
//!       cache hit  → instance
//!       cache miss → store.get_capability_model → builder.build
//!                  → insert-if-absent (winner activated, loser shut down)
//!   → instance.execute(action, params)
//! ```
//!
//! # Concurrency
//!
//! At most one instance is ever *visible* per key. Concurrent first access
//! may run `build` more than once; exactly one result wins the insert and
//! every other result has [`Capability::shutdown`] called before the losing
//! caller returns the winner. Only the winner is ever
//! [activated](Capability::activate).
//!
//! `reload` and a concurrent `execute` are not linearized: an execute that
//! resolved the previous instance before the swap finishes on it (and may see
//! it shutting down); every resolve after the swap sees the replacement.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::extract::Request;
use axum::response::Response;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use super::capability::{Capability, CapabilityBuilder, CapabilityFactory, CapabilityModel};
use super::context::HostContext;
use super::params::ActionParams;
use super::registry::CapabilityRegistry;
use crate::error::{HubError, HubResult};

// ---------------------------------------------------------------------------
// InstanceKey
// ---------------------------------------------------------------------------

/// Cache key of a tenant instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub capability: String,
    pub install_id: String,
    pub space_id: String,
}

impl InstanceKey {
    pub fn new(capability: &str, install_id: &str, space_id: &str) -> Self {
        Self {
            capability: capability.to_string(),
            install_id: install_id.to_string(),
            space_id: space_id.to_string(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.capability, self.install_id, self.space_id)
    }
}

// ---------------------------------------------------------------------------
// CapabilityHub
// ---------------------------------------------------------------------------

/// The capability hub.
pub struct CapabilityHub {
    ctx: HostContext,
    /// Catalog snapshot taken at init.
    catalog: Vec<CapabilityFactory>,
    builders: HashMap<String, Arc<dyn CapabilityBuilder>>,
    instances: DashMap<InstanceKey, Arc<dyn Capability>>,
}

impl CapabilityHub {
    /// Construct one builder per registered factory.
    ///
    /// Any constructor failure aborts initialization.
    pub fn init(registry: &CapabilityRegistry, ctx: HostContext) -> HubResult<Self> {
        let catalog = registry.list();
        let mut builders = HashMap::with_capacity(catalog.len());
        for factory in &catalog {
            let builder = factory.construct(&ctx).map_err(|e| HubError::Construction {
                name: factory.name.clone(),
                reason: e.to_string(),
            })?;
            log::info!("Capability builder '{}' initialized", factory.name);
            builders.insert(factory.name.clone(), builder);
        }

        Ok(Self {
            ctx,
            catalog,
            builders,
            instances: DashMap::new(),
        })
    }

    /// The host context shared with builders.
    pub fn context(&self) -> &HostContext {
        &self.ctx
    }

    /// Registered factories, as seen at init.
    pub fn catalog(&self) -> &[CapabilityFactory] {
        &self.catalog
    }

    /// Names of all builders.
    pub fn names(&self) -> Vec<String> {
        self.catalog.iter().map(|f| f.name.clone()).collect()
    }

    /// Number of live cached instances.
    pub fn cached_count(&self) -> usize {
        self.instances.len()
    }

    fn builder(&self, name: &str) -> HubResult<&Arc<dyn CapabilityBuilder>> {
        self.builders
            .get(name)
            .ok_or_else(|| HubError::BuilderNotFound(name.to_string()))
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    /// Return the cached instance for this tenant, building it on first access.
    pub async fn resolve(
        &self,
        name: &str,
        install_id: &str,
        space_id: &str,
    ) -> HubResult<Arc<dyn Capability>> {
        let key = InstanceKey::new(name, install_id, space_id);
        let cached = self.instances.get(&key).map(|entry| Arc::clone(entry.value()));
        if let Some(instance) = cached {
            return Ok(instance);
        }

        let builder = self.builder(name)?;
        log::debug!("Capability cache miss for {}", key);
        let model = self.load_model(&key).await?;
        let built = builder.build(model).await?;

        let (winner, loser) = match self.instances.entry(key.clone()) {
            Entry::Occupied(existing) => (Arc::clone(existing.get()), Some(built)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&built));
                (built, None)
            }
        };

        match loser {
            Some(loser) => {
                log::warn!("Discarding duplicate build of {}", key);
                loser.shutdown().await;
            }
            None => {
                winner.activate().await;
                log::info!("Capability instance {} built", key);
            }
        }
        Ok(winner)
    }

    /// Load the stored model for `key`.
    ///
    /// The store is keyed by install and capability; a model provisioned for
    /// another space is reported as missing.
    async fn load_model(&self, key: &InstanceKey) -> HubResult<CapabilityModel> {
        let model = self
            .ctx
            .store
            .get_capability_model(&key.install_id, &key.capability)
            .await?;
        if model.install_id != key.install_id || model.space_id != key.space_id {
            log::debug!(
                "Model {} belongs to {}/{}, not {}",
                model.id,
                model.install_id,
                model.space_id,
                key
            );
            return Err(HubError::ModelNotFound {
                install_id: key.install_id.clone(),
                capability: key.capability.clone(),
            });
        }
        Ok(model)
    }

    /// Rebuild a tenant instance from a freshly loaded model and swap it in.
    ///
    /// When an instance is cached, its own `reload` produces the replacement;
    /// otherwise the builder builds one. The replaced instance is shut down
    /// after the swap and before the replacement is activated.
    pub async fn reload(
        &self,
        install_id: &str,
        space_id: &str,
        name: &str,
    ) -> HubResult<Arc<dyn Capability>> {
        let builder = self.builder(name)?;
        let key = InstanceKey::new(name, install_id, space_id);
        let model = self.load_model(&key).await?;

        let current = self.instances.get(&key).map(|entry| Arc::clone(entry.value()));
        let replacement = match current {
            Some(current) => current.reload(model).await?,
            None => builder.build(model).await?,
        };

        let previous = self.instances.insert(key.clone(), Arc::clone(&replacement));
        log::info!("Capability instance {} reloaded", key);
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
        replacement.activate().await;
        Ok(replacement)
    }

    /// Drop one cached instance and shut it down. Returns whether one was cached.
    pub async fn invalidate(&self, install_id: &str, space_id: &str, name: &str) -> bool {
        let key = InstanceKey::new(name, install_id, space_id);
        match self.instances.remove(&key) {
            Some((_, instance)) => {
                log::info!("Capability instance {} invalidated", key);
                instance.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Drain the cache, shutting every instance down.
    pub async fn shutdown(&self) {
        let keys: Vec<InstanceKey> = self.instances.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, instance)) = self.instances.remove(&key) {
                instance.shutdown().await;
            }
        }
        log::info!("Capability hub shut down");
    }

    // -----------------------------------------------------------------------
    // Delegation
    // -----------------------------------------------------------------------

    pub async fn list_actions(
        &self,
        install_id: &str,
        space_id: &str,
        name: &str,
    ) -> HubResult<Vec<String>> {
        let instance = self.resolve(name, install_id, space_id).await?;
        Ok(instance.list_actions())
    }

    pub async fn execute(
        &self,
        install_id: &str,
        space_id: &str,
        name: &str,
        action: &str,
        params: ActionParams,
    ) -> HubResult<Value> {
        let instance = self.resolve(name, install_id, space_id).await?;
        instance.execute(action, params).await
    }

    pub async fn handle(
        &self,
        install_id: &str,
        space_id: &str,
        name: &str,
        request: Request,
    ) -> HubResult<Response> {
        let instance = self.resolve(name, install_id, space_id).await?;
        Ok(instance.handle(request).await)
    }

    /// Serve a tenant-less request through the builder.
    pub async fn handle_root(&self, name: &str, request: Request) -> HubResult<Response> {
        let builder = self.builder(name)?;
        Ok(builder.handle_root(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http;
    use crate::config::HubConfig;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counters {
        builds: AtomicUsize,
        activations: AtomicUsize,
        shutdowns: AtomicUsize,
        next_id: AtomicUsize,
    }

    struct CountingCapability {
        serial: usize,
        model: CapabilityModel,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Capability for CountingCapability {
        fn model(&self) -> &CapabilityModel {
            &self.model
        }

        fn list_actions(&self) -> Vec<String> {
            vec!["whoami".to_string()]
        }

        async fn execute(&self, action: &str, _params: ActionParams) -> HubResult<Value> {
            match action {
                "whoami" => Ok(json!({
                    "serial": self.serial,
                    "options": self.model.options,
                })),
                other => Err(HubError::ActionNotFound(other.to_string())),
            }
        }

        async fn reload(&self, model: CapabilityModel) -> HubResult<Arc<dyn Capability>> {
            Ok(make_instance(&self.counters, model))
        }

        async fn activate(&self) {
            self.counters.activations.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&self) {
            self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn make_instance(counters: &Arc<Counters>, model: CapabilityModel) -> Arc<dyn Capability> {
        counters.builds.fetch_add(1, Ordering::SeqCst);
        Arc::new(CountingCapability {
            serial: counters.next_id.fetch_add(1, Ordering::SeqCst),
            model,
            counters: Arc::clone(counters),
        })
    }

    struct CountingBuilder {
        counters: Arc<Counters>,
        delay: Duration,
    }

    #[async_trait]
    impl CapabilityBuilder for CountingBuilder {
        async fn build(&self, model: CapabilityModel) -> HubResult<Arc<dyn Capability>> {
            tokio::time::sleep(self.delay).await;
            Ok(make_instance(&self.counters, model))
        }
    }

    fn setup(delay: Duration) -> (Arc<CapabilityHub>, Arc<Counters>, Arc<MemoryStore>) {
        let counters = Arc::new(Counters::default());
        let store = Arc::new(MemoryStore::new());
        store.put(CapabilityModel::new("m1", "acme", "main", "counting"));

        let mut registry = CapabilityRegistry::new();
        let shared = Arc::clone(&counters);
        registry.register(CapabilityFactory::new("counting", "#", move |_ctx| {
            Ok(Arc::new(CountingBuilder {
                counters: Arc::clone(&shared),
                delay,
            }) as Arc<dyn CapabilityBuilder>)
        }));

        let ctx = HostContext::new(HubConfig::default(), store.clone());
        let hub = CapabilityHub::init(&registry, ctx).unwrap();
        (Arc::new(hub), counters, store)
    }

    #[test]
    fn test_init_builds_one_builder_per_factory() {
        let mut registry = CapabilityRegistry::new();
        for name in ["a", "b", "c"] {
            registry.register(CapabilityFactory::new(name, "#", |_ctx| {
                Ok(Arc::new(CountingBuilder {
                    counters: Arc::new(Counters::default()),
                    delay: Duration::ZERO,
                }) as Arc<dyn CapabilityBuilder>)
            }));
        }
        let ctx = HostContext::new(HubConfig::default(), Arc::new(MemoryStore::new()));
        let hub = CapabilityHub::init(&registry, ctx).unwrap();
        assert_eq!(hub.names(), vec!["a", "b", "c"]);
        assert_eq!(hub.catalog().len(), 3);
    }

    #[test]
    fn test_init_fails_on_constructor_error() {
        let mut registry = CapabilityRegistry::new();
        registry.register(CapabilityFactory::new("broken", "#", |_ctx| {
            Err(HubError::validation("missing credentials"))
        }));
        let ctx = HostContext::new(HubConfig::default(), Arc::new(MemoryStore::new()));
        let err = CapabilityHub::init(&registry, ctx).err().unwrap();
        match err {
            HubError::Construction { name, reason } => {
                assert_eq!(name, "broken");
                assert!(reason.contains("missing credentials"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_caches_instance() {
        let (hub, counters, _) = setup(Duration::ZERO);
        let a = hub.resolve("counting", "acme", "main").await.unwrap();
        let b = hub.resolve("counting", "acme", "main").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(counters.builds.load(Ordering::SeqCst), 1);
        assert_eq!(hub.cached_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_builder() {
        let (hub, _, _) = setup(Duration::ZERO);
        let err = hub.resolve("nope", "acme", "main").await.err().unwrap();
        assert!(matches!(err, HubError::BuilderNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_model_propagates() {
        let (hub, _, _) = setup(Duration::ZERO);
        let err = hub.resolve("counting", "other", "main").await.err().unwrap();
        assert!(matches!(err, HubError::ModelNotFound { .. }));
        assert_eq!(hub.cached_count(), 0);
    }

    #[tokio::test]
    async fn test_install_id_is_part_of_key() {
        let (hub, _, store) = setup(Duration::ZERO);
        store.put(CapabilityModel::new("m2", "globex", "main", "counting"));
        let a = hub.resolve("counting", "acme", "main").await.unwrap();
        let b = hub.resolve("counting", "globex", "main").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_access_yields_one_instance() {
        let (hub, counters, _) = setup(Duration::from_millis(20));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let hub = Arc::clone(&hub);
            tasks.push(tokio::spawn(async move {
                hub.resolve("counting", "acme", "main").await.unwrap()
            }));
        }
        let mut instances = Vec::new();
        for task in tasks {
            instances.push(task.await.unwrap());
        }

        let first = &instances[0];
        assert!(instances.iter().all(|i| Arc::ptr_eq(i, first)));
        assert_eq!(hub.cached_count(), 1);

        // Every losing build was shut down; the winner was not.
        let builds = counters.builds.load(Ordering::SeqCst);
        let shutdowns = counters.shutdowns.load(Ordering::SeqCst);
        assert!(builds >= 1);
        assert_eq!(shutdowns, builds - 1);
        assert_eq!(counters.activations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_space_must_match_stored_model() {
        let (hub, counters, _) = setup(Duration::ZERO);
        let err = hub.resolve("counting", "acme", "elsewhere").await.err().unwrap();
        assert!(matches!(err, HubError::ModelNotFound { .. }));
        let err = hub.reload("acme", "elsewhere", "counting").await.err().unwrap();
        assert!(matches!(err, HubError::ModelNotFound { .. }));

        assert_eq!(hub.cached_count(), 0);
        assert_eq!(counters.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reload_routes_to_replacement() {
        let (hub, counters, store) = setup(Duration::ZERO);
        let before = hub
            .execute("acme", "main", "counting", "whoami", ActionParams::default())
            .await
            .unwrap();
        assert_eq!(before["serial"], 0);

        store.put(
            CapabilityModel::new("m1", "acme", "main", "counting").with_options(json!({"v": 2})),
        );
        let replacement = hub.reload("acme", "main", "counting").await.unwrap();
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(counters.activations.load(Ordering::SeqCst), 2);

        for _ in 0..3 {
            let after = hub
                .execute("acme", "main", "counting", "whoami", ActionParams::default())
                .await
                .unwrap();
            assert_eq!(after["serial"], 1);
            assert_eq!(after["options"]["v"], 2);
        }
        let resolved = hub.resolve("counting", "acme", "main").await.unwrap();
        assert!(Arc::ptr_eq(&resolved, &replacement));
    }

    #[tokio::test]
    async fn test_reload_without_cached_instance_builds() {
        let (hub, counters, _) = setup(Duration::ZERO);
        hub.reload("acme", "main", "counting").await.unwrap();
        assert_eq!(hub.cached_count(), 1);
        assert_eq!(counters.builds.load(Ordering::SeqCst), 1);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_unknown_action() {
        let (hub, _, _) = setup(Duration::ZERO);
        let err = hub
            .execute("acme", "main", "counting", "explode", ActionParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::ActionNotFound(_)));
        let actions = hub.list_actions("acme", "main", "counting").await.unwrap();
        assert_eq!(actions, vec!["whoami"]);
    }

    #[tokio::test]
    async fn test_invalidate_and_shutdown() {
        let (hub, counters, store) = setup(Duration::ZERO);
        store.put(CapabilityModel::new("m2", "globex", "side", "counting"));
        hub.resolve("counting", "acme", "main").await.unwrap();
        hub.resolve("counting", "globex", "side").await.unwrap();

        assert!(hub.invalidate("acme", "main", "counting").await);
        assert!(!hub.invalidate("acme", "main", "counting").await);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);

        hub.shutdown().await;
        assert_eq!(hub.cached_count(), 0);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handle_root_unknown_builder() {
        let (hub, _, _) = setup(Duration::ZERO);
        let request = http::Request::builder()
            .uri("/")
            .body(axum::body::Body::empty())
            .unwrap();
        assert!(hub.handle_root("nope", request).await.is_err());
    }
}
