//! Capability contract - factories, builders, and per-tenant instances.
//!
//! The lifecycle is:
//!
//! ```text
//! CapabilityFactory  (registered once per name, immutable)
//!   │ construct(&HostContext)              - once, at hub init
//!   ▼
//! CapabilityBuilder  (one per name, no tenant state)
//!   │ build(CapabilityModel)               - on first access per tenant
//!   │ handle_root(request)                 - tenant-less requests
//!   ▼
//! Capability         (stateful, cached by the hub per tenant)
//!     list_actions / execute / handle / reload / activate / shutdown
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::HostContext;
use super::params::ActionParams;
use crate::error::HubResult;

// ---------------------------------------------------------------------------
// Persisted model
// ---------------------------------------------------------------------------

/// Persisted per-tenant configuration of one capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityModel {
    /// Storage id of this capability record.
    pub id: String,
    pub install_id: String,
    pub space_id: String,
    /// Registered capability name this record configures.
    pub capability: String,
    /// Opaque options blob, interpreted only by the capability itself.
    #[serde(default)]
    pub options: Value,
}

impl CapabilityModel {
    pub fn new(
        id: impl Into<String>,
        install_id: impl Into<String>,
        space_id: impl Into<String>,
        capability: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            install_id: install_id.into(),
            space_id: space_id.into(),
            capability: capability.into(),
            options: Value::Null,
        }
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }
}

// ---------------------------------------------------------------------------
// Option schema
// ---------------------------------------------------------------------------

/// Value kind of a declared option field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionKind {
    Text,
    Number,
    Bool,
    Json,
}

/// One entry in a factory's declared option schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionField {
    pub name: String,
    pub label: String,
    pub kind: OptionKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl OptionField {
    pub fn new(name: impl Into<String>, label: impl Into<String>, kind: OptionKind) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            kind,
            required: false,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

// ---------------------------------------------------------------------------
// Instance and builder traits
// ---------------------------------------------------------------------------

/// A realized, tenant-scoped capability.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Model this instance was built from.
    fn model(&self) -> &CapabilityModel;

    /// Names accepted by [`execute`](Self::execute).
    fn list_actions(&self) -> Vec<String>;

    /// Run a named action.
    async fn execute(&self, action: &str, params: ActionParams) -> HubResult<Value>;

    /// Serve an HTTP request addressed to this instance.
    async fn handle(&self, _request: Request) -> Response {
        not_served("capability does not serve HTTP requests")
    }

    /// Produce a replacement instance from a fresh model.
    ///
    /// The hub swaps the replacement into its cache, calls
    /// [`shutdown`](Self::shutdown) on `self`, then activates the replacement.
    async fn reload(&self, model: CapabilityModel) -> HubResult<Arc<dyn Capability>>;

    /// Publish state other instances can observe.
    ///
    /// Called once the hub has made this instance the visible one for its
    /// key. A losing duplicate build is never activated, so `build` and
    /// `reload` must not touch shared state themselves.
    async fn activate(&self) {}

    /// Release resources. Called exactly once when the hub drops the instance.
    async fn shutdown(&self) {}
}

/// Per-name builder created once at hub initialization.
#[async_trait]
pub trait CapabilityBuilder: Send + Sync {
    /// Construct a tenant instance from its persisted model.
    async fn build(&self, model: CapabilityModel) -> HubResult<Arc<dyn Capability>>;

    /// Serve a tenant-less request (catalog-level health, discovery, ...).
    async fn handle_root(&self, _request: Request) -> Response {
        not_served("capability has no root handler")
    }
}

fn not_served(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": message }))).into_response()
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Constructor signature stored in a factory.
pub type BuilderConstructor =
    Arc<dyn Fn(&HostContext) -> HubResult<Arc<dyn CapabilityBuilder>> + Send + Sync>;

/// Immutable registration record for one capability name.
#[derive(Clone)]
pub struct CapabilityFactory {
    pub name: String,
    pub icon: String,
    pub options: Vec<OptionField>,
    constructor: BuilderConstructor,
}

impl CapabilityFactory {
    pub fn new<F>(name: impl Into<String>, icon: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&HostContext) -> HubResult<Arc<dyn CapabilityBuilder>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            icon: icon.into(),
            options: Vec::new(),
            constructor: Arc::new(constructor),
        }
    }

    pub fn with_options(mut self, options: Vec<OptionField>) -> Self {
        self.options = options;
        self
    }

    /// Invoke the constructor.
    pub fn construct(&self, ctx: &HostContext) -> HubResult<Arc<dyn CapabilityBuilder>> {
        (self.constructor)(ctx)
    }
}

impl fmt::Debug for CapabilityFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityFactory")
            .field("name", &self.name)
            .field("icon", &self.icon)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
