//! `pubsub` - websocket rooms per tenant.
//!
//! Each tenant instance owns one [`Room`] named `"<install>/<space>"`. Clients
//! connect through the instance's HTTP handler (websocket upgrade, optional
//! `?cid=` connection id); server code drives the room through actions.
//!
//! | action           | params                          |
//! |------------------|---------------------------------|
//! | `broadcast`      | `data`                          |
//! | `publish`        | `topic`, `data`                 |
//! | `direct_message` | `target_conn_id`, `data`        |
//! | `subscribe`      | `topic`, `conn_id`              |
//! | `unsubscribe`    | `topic`, `conn_id`              |
//! | `connections`    | -                               |
//! | `topics`         | -                               |

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Query, Request};
use axum::response::{IntoResponse, Response};
use axum::Json;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::capabilities::{
    ActionParams, Capability, CapabilityBuilder, CapabilityFactory, CapabilityModel, HostContext,
    OptionField, OptionKind,
};
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::room::{
    hook_channel, spawn_hook_consumer, Envelope, HookSender, LoggingHooks, Room, RoomEvent,
    RoomHooks, Rooms,
};

pub const NAME: &str = "pubsub";

const ACTIONS: &[&str] = &[
    "broadcast",
    "connections",
    "direct_message",
    "publish",
    "subscribe",
    "topics",
    "unsubscribe",
];

/// Factory whose command/disconnect events are only logged.
pub fn factory() -> CapabilityFactory {
    factory_with_hooks(Arc::new(LoggingHooks))
}

/// Factory delivering room events to `hooks`.
pub fn factory_with_hooks(hooks: Arc<dyn RoomHooks>) -> CapabilityFactory {
    CapabilityFactory::new(NAME, "radio-tower", move |ctx: &HostContext| {
        Ok(Arc::new(PubSubBuilder::new(ctx, Arc::clone(&hooks))) as Arc<dyn CapabilityBuilder>)
    })
    .with_options(vec![OptionField::new(
        "auto_subscribe",
        "Topics every new connection joins",
        OptionKind::Json,
    )
    .with_default(json!([]))])
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// State shared by the builder and every instance it builds.
///
/// A freshly built instance owns a private room; it joins `rooms` only when
/// the hub activates it.
struct Shared {
    config: Arc<HubConfig>,
    rooms: Rooms,
    hooks: HookSender,
}

impl Shared {
    async fn open(self: &Arc<Self>, model: CapabilityModel) -> HubResult<Arc<dyn Capability>> {
        let options = ActionParams::new(model.options.clone());
        let auto_subscribe: Vec<String> = match options.raw("auto_subscribe") {
            Some(value) => serde_json::from_value(value).map_err(|e| {
                HubError::validation(format!("auto_subscribe must be a list of topics: {}", e))
            })?,
            None => Vec::new(),
        };

        // The hub only hands over models whose ids match the instance key.
        let name = format!("{}/{}", model.install_id, model.space_id);
        let room = Room::spawn(name, &self.config, Some(self.hooks.clone()));

        Ok(Arc::new(PubSubCapability {
            model,
            room,
            auto_subscribe,
            shared: Arc::clone(self),
        }))
    }
}

/// Builds rooms and owns the hook consumer for all of them.
pub struct PubSubBuilder {
    shared: Arc<Shared>,
    /// Started on the first build, inside the runtime.
    pending_consumer: Mutex<Option<(mpsc::Receiver<RoomEvent>, Arc<dyn RoomHooks>)>>,
}

impl PubSubBuilder {
    pub fn new(ctx: &HostContext, hooks: Arc<dyn RoomHooks>) -> Self {
        let (sender, rx) = hook_channel(&ctx.config);
        Self {
            shared: Arc::new(Shared {
                config: Arc::clone(&ctx.config),
                rooms: Rooms::new(),
                hooks: sender,
            }),
            pending_consumer: Mutex::new(Some((rx, hooks))),
        }
    }

    fn ensure_consumer(&self) {
        if let Some((rx, hooks)) = self.pending_consumer.lock().take() {
            spawn_hook_consumer(rx, hooks);
            log::debug!("pubsub hook consumer started");
        }
    }
}

#[async_trait]
impl CapabilityBuilder for PubSubBuilder {
    async fn build(&self, model: CapabilityModel) -> HubResult<Arc<dyn Capability>> {
        self.ensure_consumer();
        self.shared.open(model).await
    }

    async fn handle_root(&self, _request: Request) -> Response {
        Json(json!({
            "capability": NAME,
            "rooms": self.shared.rooms.len(),
        }))
        .into_response()
    }
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

pub struct PubSubCapability {
    model: CapabilityModel,
    room: Room,
    auto_subscribe: Vec<String>,
    shared: Arc<Shared>,
}

impl PubSubCapability {
    pub fn room(&self) -> &Room {
        &self.room
    }
}

#[async_trait]
impl Capability for PubSubCapability {
    fn model(&self) -> &CapabilityModel {
        &self.model
    }

    fn list_actions(&self) -> Vec<String> {
        ACTIONS.iter().map(|a| a.to_string()).collect()
    }

    async fn execute(&self, action: &str, params: ActionParams) -> HubResult<Value> {
        match action {
            "broadcast" => {
                let data = params
                    .raw("data")
                    .ok_or_else(|| HubError::validation("data is required"))?;
                self.room.broadcast(data).await?;
            }
            "publish" => {
                let topic = params.require_str("topic")?;
                let data = params.raw("data").unwrap_or(Value::Null);
                self.room.publish(topic, data).await?;
            }
            "direct_message" => {
                let target = params.require_str("target_conn_id")?;
                let data = params.raw("data").unwrap_or(Value::Null);
                self.room.direct_message(target, data).await?;
            }
            "subscribe" => {
                let topic = params.require_str("topic")?;
                let conn_id = params.require_str("conn_id")?;
                self.room.subscribe(topic, conn_id).await?;
            }
            "unsubscribe" => {
                let topic = params.require_str("topic")?;
                let conn_id = params.require_str("conn_id")?;
                self.room.unsubscribe(topic, conn_id).await?;
            }
            "connections" => {
                return Ok(json!({ "connections": self.room.connections().await? }));
            }
            "topics" => {
                return Ok(json!({ "topics": self.room.topics().await? }));
            }
            other => return Err(HubError::ActionNotFound(other.to_string())),
        }
        Ok(json!({ "status": "ok" }))
    }

    async fn handle(&self, request: Request) -> Response {
        let (mut parts, _body) = request.into_parts();
        let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => upgrade,
            Err(rejection) => return rejection.into_response(),
        };
        let conn_id = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(query)| query.get("cid").filter(|c| !c.is_empty()).cloned())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let room = self.room.clone();
        let topics = self.auto_subscribe.clone();
        upgrade.on_upgrade(move |socket| serve_socket(room, socket, conn_id, topics))
    }

    async fn reload(&self, model: CapabilityModel) -> HubResult<Arc<dyn Capability>> {
        self.shared.open(model).await
    }

    async fn activate(&self) {
        self.shared.rooms.install(self.room.clone()).await;
    }

    async fn shutdown(&self) {
        self.shared.rooms.retire(&self.room).await;
    }
}

// ---------------------------------------------------------------------------
// Websocket connection
// ---------------------------------------------------------------------------

async fn serve_socket(room: Room, mut socket: WebSocket, conn_id: String, topics: Vec<String>) {
    let mut connection = match room.attach(&conn_id).await {
        Ok(connection) => connection,
        Err(e) => {
            let _ = send_envelope(&mut socket, &Envelope::error(None, e.to_string())).await;
            return;
        }
    };
    for topic in &topics {
        if let Err(e) = room.subscribe(topic, &conn_id).await {
            log::warn!("Auto-subscribe of {} to '{}' failed: {}", conn_id, topic, e);
        }
    }

    loop {
        tokio::select! {
            outbound = connection.recv() => match outbound {
                Some(envelope) => {
                    if send_envelope(&mut socket, &envelope).await.is_err() {
                        break;
                    }
                }
                // Room closed.
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = room.handle_client_frame(&conn_id, &text).await {
                        if send_envelope(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = socket.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    room.disconnect(&conn_id).await;
}

async fn send_envelope(socket: &mut WebSocket, envelope: &Envelope) -> Result<(), axum::Error> {
    match envelope.to_text() {
        Ok(text) => socket.send(Message::Text(text)).await,
        Err(e) => {
            log::warn!("Skipping envelope: {}", e);
            Ok(())
        }
    }
}
