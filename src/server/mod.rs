//! HTTP entry point.
//!
//! Exposes the capability hub over axum: catalog, tenant-less root requests,
//! named actions, reloads, and each instance's own HTTP handler.
//!
//! # Endpoints
//!
//! - `GET  /health`       - Liveness probe
//! - `GET  /capabilities` - Capability catalog
//! - `/root/:name`        - Builder-level requests
//! - `/c/:name/:install/:space/...` - Tenant instance requests

pub mod routes;

pub use routes::{app_router, AppState};
