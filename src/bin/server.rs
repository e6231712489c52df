//! caphub HTTP server binary.
//!
//! Starts an axum HTTP server hosting the builtin capabilities (`pubsub`,
//! `relay`) for every tenant in the tenants file.
//!
//! # Environment Variables
//!
//! - `CAPHUB_CONFIG` - YAML config file (optional)
//! - `CAPHUB_BIND` / `PORT` - listen address / port (default: 0.0.0.0:8080)
//! - `CAPHUB_TENANTS` - YAML file of tenant capability models
//! - `CAPHUB_AUTH_SECRET` - enables bearer capability tokens
//! - `RUST_LOG` - Tracing filter (default: "info,caphub=debug")
//!
//! # Usage
//!
//! ```bash
//! CAPHUB_TENANTS=tenants.yaml cargo run --bin caphub-server
//! ```

use std::sync::Arc;

use anyhow::Context;
use caphub::auth::HmacTokenVerifier;
use caphub::capabilities::builtin::register_builtins;
use caphub::server::{app_router, AppState};
use caphub::store::MemoryStore;
use caphub::{CapabilityHub, CapabilityRegistry, HostContext, HubConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,caphub=debug".into()),
        )
        .init();

    let config = HubConfig::load().context("loading configuration")?;

    let store = Arc::new(MemoryStore::new());
    if let Some(path) = &config.tenants_file {
        let count = store
            .load_file(path)
            .with_context(|| format!("seeding tenants from {}", path.display()))?;
        tracing::info!("Loaded {} tenant capability models", count);
    } else {
        tracing::warn!("No tenants file configured; every tenant request will 404");
    }

    let mut registry = CapabilityRegistry::new();
    register_builtins(&mut registry);

    let bind_addr = config.bind_addr.clone();
    let auth_secret = config.auth_secret.clone();
    let hub = CapabilityHub::init(&registry, HostContext::new(config, store))
        .context("initializing capability hub")?;
    let hub = Arc::new(hub);

    let mut state = AppState::new(Arc::clone(&hub));
    if let Some(secret) = auth_secret {
        state = state.with_verifier(Arc::new(HmacTokenVerifier::new(secret)?));
        tracing::info!("Capability token auth enabled");
    }
    let app = app_router(state);

    tracing::info!("caphub server starting on {}", bind_addr);
    tracing::info!("Capabilities: {}", hub.names().join(", "));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("server failed")?;

    hub.shutdown().await;
    Ok(())
}
