//! # caphub
//!
//! A multi-tenant capability host. Pluggable server-side units (capabilities)
//! are registered once, built per tenant (an install/space pair) from stored
//! configuration, and invoked through named actions or their own HTTP handler.
//!
//! Three engines carry the load:
//!
//! - [`capabilities::CapabilityHub`] - builds, caches and reloads tenant
//!   instances with at most one visible instance per tenant
//! - [`room::Room`] - in-process pub/sub over websocket connections
//! - [`relay::RelayHub`] - bounded byte relay pairing two HTTP requests

pub mod auth;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod relay;
pub mod room;
pub mod server;
pub mod store;

pub use capabilities::{
    ActionParams, Capability, CapabilityBuilder, CapabilityFactory, CapabilityHub,
    CapabilityModel, CapabilityRegistry, HostContext,
};
pub use config::HubConfig;
pub use error::{HubError, HubResult};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
