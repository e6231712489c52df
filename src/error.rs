//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the hub, the room engine and the relay engine
//! reports a [`HubError`]. Request-scoped failures (not-found, validation,
//! conflict, timeout, upstream I/O) are returned to the caller; only
//! [`HubError::Construction`] is treated as fatal, and only at startup.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Errors produced by the capability host.
#[derive(Debug, Error)]
pub enum HubError {
    /// No builder is registered under the requested capability name.
    #[error("builder not found: {0}")]
    BuilderNotFound(String),

    /// The storage collaborator has no model for this tenant/capability.
    #[error("capability model not found: install={install_id} capability={capability}")]
    ModelNotFound {
        install_id: String,
        capability: String,
    },

    /// The capability instance does not expose the requested action.
    #[error("action not found: {0}")]
    ActionNotFound(String),

    /// The connection id is not registered in the room.
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    /// No relay is in flight under this id.
    #[error("relay not found: {0}")]
    RelayNotFound(String),

    /// A required action field is missing or malformed.
    #[error("{0}")]
    Validation(String),

    /// The operation collides with existing state (duplicate connection id,
    /// second relay producer, ...).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A peer or consumer did not make progress before the deadline.
    #[error("timed out after {after_ms}ms: {what}")]
    Timeout { what: String, after_ms: u64 },

    /// Upstream I/O failed (body read, storage backend, relay producer).
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The target (room, relay, hook queue) has been shut down.
    #[error("closed: {0}")]
    Closed(String),

    /// Token missing, malformed, expired, or not matching the tenant.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A capability factory failed to construct its builder.
    #[error("failed to construct builder '{name}': {reason}")]
    Construction { name: String, reason: String },
}

/// Convenience result alias used throughout the crate.
pub type HubResult<T> = Result<T, HubError>;

impl HubError {
    /// Shorthand for a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Shorthand for an upstream error that wraps a lower-level cause with context.
    pub fn upstream(context: &str, cause: impl std::fmt::Display) -> Self {
        Self::Upstream(format!("{}: {}", context, cause))
    }

    /// Whether this error belongs to the not-found family.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BuilderNotFound(_)
                | Self::ModelNotFound { .. }
                | Self::ActionNotFound(_)
                | Self::ConnectionNotFound(_)
                | Self::RelayNotFound(_)
        )
    }

    /// HTTP status used when this error crosses the HTTP boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            _ if self.is_not_found() => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Closed(_) => StatusCode::GONE,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::warn!("Request failed: {}", self);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
