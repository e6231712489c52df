//! Capabilities shipped with the host.
//!
//! - [`pubsub`] - websocket rooms (Pub/Sub Room Engine)
//! - [`relay`] - paired HTTP byte relay (Paired Relay Engine)

pub mod pubsub;
pub mod relay;

use super::registry::CapabilityRegistry;

/// Register every builtin capability.
pub fn register_builtins(registry: &mut CapabilityRegistry) {
    registry.register(pubsub::factory());
    registry.register(relay::factory());
}
