//! Typed host context handed to capability factories.

use std::sync::Arc;

use crate::config::HubConfig;
use crate::store::CapabilityStore;

/// Services the host exposes to capability builders and the hub.
///
/// Cloning is cheap; every field is shared.
#[derive(Clone)]
pub struct HostContext {
    pub config: Arc<HubConfig>,
    pub store: Arc<dyn CapabilityStore>,
}

impl HostContext {
    pub fn new(config: HubConfig, store: Arc<dyn CapabilityStore>) -> Self {
        Self {
            config: Arc::new(config),
            store,
        }
    }
}
