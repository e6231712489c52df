//! # Capabilities
//!
//! Pluggable, tenant-scoped server-side units and the hub that hosts them.
//!
//! ## Resolution Flow
//!
//! 1. Bootstrap registers one [`CapabilityFactory`] per name in a [`CapabilityRegistry`]
//! 2. [`CapabilityHub::init`] constructs one [`CapabilityBuilder`] per factory
//! 3. A request names `(capability, install, space)`; the hub resolves the cached
//!    [`Capability`] or builds it from the tenant's [`CapabilityModel`]
//! 4. The instance lists actions, executes one, or serves the HTTP request

pub mod builtin;
pub mod capability;
pub mod context;
pub mod hub;
pub mod params;
pub mod registry;

pub use capability::{
    Capability, CapabilityBuilder, CapabilityFactory, CapabilityModel, OptionField, OptionKind,
};
pub use context::HostContext;
pub use hub::{CapabilityHub, InstanceKey};
pub use params::ActionParams;
pub use registry::CapabilityRegistry;
