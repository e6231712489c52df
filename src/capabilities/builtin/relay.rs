//! `relay` - pairs a POST and a GET on the same `relay_id`.
//!
//! ```text
//! POST /c/relay/<install>/<space>/h?relay_id=X   (body streamed in)
//! GET  /c/relay/<install>/<space>/h/X            (body streamed out)
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Query, Request};
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::capabilities::{
    ActionParams, Capability, CapabilityBuilder, CapabilityFactory, CapabilityModel, HostContext,
    OptionField, OptionKind,
};
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::relay::RelayHub;

pub const NAME: &str = "relay";

pub fn factory() -> CapabilityFactory {
    CapabilityFactory::new(NAME, "arrow-left-right", |ctx: &HostContext| {
        Ok(Arc::new(RelayBuilder {
            config: Arc::clone(&ctx.config),
        }) as Arc<dyn CapabilityBuilder>)
    })
    .with_options(vec![
        OptionField::new("queue_capacity", "Queued chunks per relay", OptionKind::Number),
        OptionField::new("chunk_size", "Largest chunk in bytes", OptionKind::Number),
    ])
}

pub struct RelayBuilder {
    config: Arc<HubConfig>,
}

impl RelayBuilder {
    /// Apply per-tenant overrides on top of the host configuration.
    fn open(config: &HubConfig, model: CapabilityModel) -> HubResult<Arc<dyn Capability>> {
        let options = ActionParams::new(model.options.clone());
        let mut tuned = config.clone();
        if let Some(capacity) = options.i64("queue_capacity") {
            tuned.relay_queue_capacity = positive("queue_capacity", capacity)?;
        }
        if let Some(size) = options.i64("chunk_size") {
            tuned.relay_chunk_size = positive("chunk_size", size)?;
        }

        let relays = RelayHub::new(&tuned);
        let reaper = relays.spawn_reaper();
        Ok(Arc::new(RelayCapability {
            model,
            config: Arc::new(config.clone()),
            relays,
            reaper,
        }))
    }
}

fn positive(field: &str, value: i64) -> HubResult<usize> {
    usize::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| HubError::validation(format!("{} must be a positive integer", field)))
}

#[async_trait]
impl CapabilityBuilder for RelayBuilder {
    async fn build(&self, model: CapabilityModel) -> HubResult<Arc<dyn Capability>> {
        Self::open(&self.config, model)
    }

    async fn handle_root(&self, _request: Request) -> Response {
        Json(json!({
            "capability": NAME,
            "queue_capacity": self.config.relay_queue_capacity,
            "chunk_size": self.config.relay_chunk_size,
        }))
        .into_response()
    }
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

pub struct RelayCapability {
    model: CapabilityModel,
    /// Host configuration, before tenant overrides.
    config: Arc<HubConfig>,
    relays: RelayHub,
    reaper: JoinHandle<()>,
}

impl RelayCapability {
    pub fn relays(&self) -> &RelayHub {
        &self.relays
    }

    async fn produce(&self, relay_id: &str, body: Body) -> Response {
        match self.relays.produce(relay_id, body.into_data_stream()).await {
            Ok(bytes) => Json(json!({
                "status": "ok",
                "relay_id": relay_id,
                "bytes": bytes,
            }))
            .into_response(),
            Err(HubError::Upstream(message)) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            Err(e) => e.into_response(),
        }
    }

    async fn consume(&self, relay_id: &str) -> Response {
        let mut consumer = match self.relays.consume(relay_id) {
            Ok(consumer) => consumer,
            Err(e) => return e.into_response(),
        };

        // Wait for the first frame so an early failure is still a clean status.
        let first = match consumer.next_chunk().await {
            Ok(first) => first,
            Err(HubError::Upstream(message)) => {
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": message })))
                    .into_response()
            }
            Err(e) => return e.into_response(),
        };

        let head = futures::stream::iter(first.map(Ok::<_, HubError>));
        let body = Body::from_stream(head.chain(consumer.into_stream()));
        ([(header::CONTENT_TYPE, "application/octet-stream")], body).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct RelayQuery {
    relay_id: Option<String>,
}

/// `relay_id` from the query string, else the trailing path segment.
fn relay_id(uri: &Uri) -> Option<String> {
    let from_query = Query::<RelayQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(q)| q.relay_id)
        .filter(|id| !id.is_empty());
    from_query.or_else(|| {
        uri.path()
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty() && *segment != "h")
            .map(str::to_string)
    })
}

#[async_trait]
impl Capability for RelayCapability {
    fn model(&self) -> &CapabilityModel {
        &self.model
    }

    fn list_actions(&self) -> Vec<String> {
        vec!["relays".to_string(), "status".to_string()]
    }

    async fn execute(&self, action: &str, params: ActionParams) -> HubResult<Value> {
        match action {
            "relays" => Ok(json!({ "relays": self.relays.active() })),
            "status" => {
                let id = params.require_str("relay_id")?;
                let relay = self
                    .relays
                    .get(id)
                    .ok_or_else(|| HubError::RelayNotFound(id.to_string()))?;
                Ok(json!({
                    "relay_id": id,
                    "producer_attached": relay.producer_attached(),
                    "consumer_attached": relay.consumer_attached(),
                }))
            }
            other => Err(HubError::ActionNotFound(other.to_string())),
        }
    }

    async fn handle(&self, request: Request) -> Response {
        let (parts, body) = request.into_parts();
        let Some(relay_id) = relay_id(&parts.uri) else {
            return HubError::validation("relay_id is required").into_response();
        };
        match parts.method {
            Method::POST => self.produce(&relay_id, body).await,
            Method::GET => self.consume(&relay_id).await,
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        }
    }

    async fn reload(&self, model: CapabilityModel) -> HubResult<Arc<dyn Capability>> {
        RelayBuilder::open(&self.config, model)
    }

    async fn shutdown(&self) {
        self.reaper.abort();
        log::debug!(
            "relay instance {}/{} shut down with {} relays in flight",
            self.model.install_id,
            self.model.space_id,
            self.relays.len()
        );
    }
}

impl Drop for RelayCapability {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}
