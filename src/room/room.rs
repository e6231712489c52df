//! The room: one serialized worker owning connections and subscriptions.
//!
//! ```text
//!  Room (handle, Clone) ──Op──▶ mailbox ──▶ RoomWorker
//!                                             conns:  conn_id → outbound tx
//!                                             topics: topic   → {conn_id}
//!  RoomConnection ◀──Envelope── outbound (bounded, try_send)
//! ```
//!
//! Every public operation enqueues an [`Op`]; the worker applies ops in
//! mailbox order and never awaits anything but its mailbox. Delivery to a
//! connection is `try_send`: a full outbound buffer drops that message for
//! that connection only.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;

use super::envelope::{Envelope, MessageType, PRESENCE_JOIN, PRESENCE_LEAVE};
use super::hooks::{HookSender, RoomEvent};
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};

/// Caller-assigned connection id.
pub type ConnId = String;

// ---------------------------------------------------------------------------
// Mailbox operations
// ---------------------------------------------------------------------------

enum Op {
    Attach {
        conn_id: ConnId,
        outbound: mpsc::Sender<Envelope>,
        reply: oneshot::Sender<HubResult<()>>,
    },
    Detach {
        conn_id: ConnId,
    },
    Broadcast {
        envelope: Envelope,
        except: Option<ConnId>,
    },
    Publish {
        topic: String,
        envelope: Envelope,
    },
    Direct {
        conn_id: ConnId,
        envelope: Envelope,
        reply: oneshot::Sender<HubResult<()>>,
    },
    Subscribe {
        topic: String,
        conn_id: ConnId,
        reply: oneshot::Sender<HubResult<()>>,
    },
    Unsubscribe {
        topic: String,
        conn_id: ConnId,
        reply: oneshot::Sender<()>,
    },
    Connections {
        reply: oneshot::Sender<Vec<ConnId>>,
    },
    Topics {
        reply: oneshot::Sender<BTreeMap<String, Vec<ConnId>>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct RoomWorker {
    name: String,
    conns: HashMap<ConnId, mpsc::Sender<Envelope>>,
    topics: HashMap<String, HashSet<ConnId>>,
}

impl RoomWorker {
    async fn run(mut self, mut mailbox: mpsc::Receiver<Op>) {
        while let Some(op) = mailbox.recv().await {
            if let Op::Close { reply } = op {
                // Dropping the outbound senders ends every connection's stream.
                self.conns.clear();
                self.topics.clear();
                mailbox.close();
                log::info!("Room '{}' closed", self.name);
                let _ = reply.send(());
                break;
            }
            self.apply(op);
        }
        log::debug!("Room '{}' worker stopped", self.name);
    }

    fn apply(&mut self, op: Op) {
        match op {
            Op::Attach {
                conn_id,
                outbound,
                reply,
            } => {
                let result = if self.conns.contains_key(&conn_id) {
                    Err(HubError::Conflict(format!(
                        "connection '{}' is already attached",
                        conn_id
                    )))
                } else {
                    self.announce(&conn_id, PRESENCE_JOIN);
                    self.conns.insert(conn_id.clone(), outbound);
                    log::debug!("Room '{}' attached {}", self.name, conn_id);
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Op::Detach { conn_id } => {
                if self.conns.remove(&conn_id).is_some() {
                    self.topics.retain(|_, members| {
                        members.remove(&conn_id);
                        !members.is_empty()
                    });
                    self.announce(&conn_id, PRESENCE_LEAVE);
                    log::debug!("Room '{}' detached {}", self.name, conn_id);
                }
            }
            Op::Broadcast { envelope, except } => {
                for (conn_id, tx) in &self.conns {
                    if except.as_ref() != Some(conn_id) {
                        self.deliver(conn_id, tx, envelope.clone());
                    }
                }
            }
            Op::Publish { topic, envelope } => {
                if let Some(members) = self.topics.get(&topic) {
                    for conn_id in members {
                        if let Some(tx) = self.conns.get(conn_id) {
                            self.deliver(conn_id, tx, envelope.clone());
                        }
                    }
                }
            }
            Op::Direct {
                conn_id,
                envelope,
                reply,
            } => {
                let result = match self.conns.get(&conn_id) {
                    Some(tx) => {
                        self.deliver(&conn_id, tx, envelope);
                        Ok(())
                    }
                    None => Err(HubError::ConnectionNotFound(conn_id)),
                };
                let _ = reply.send(result);
            }
            Op::Subscribe {
                topic,
                conn_id,
                reply,
            } => {
                let result = if self.conns.contains_key(&conn_id) {
                    log::debug!("Room '{}': {} subscribed to '{}'", self.name, conn_id, topic);
                    self.topics.entry(topic).or_default().insert(conn_id);
                    Ok(())
                } else {
                    Err(HubError::ConnectionNotFound(conn_id))
                };
                let _ = reply.send(result);
            }
            Op::Unsubscribe {
                topic,
                conn_id,
                reply,
            } => {
                if let Some(members) = self.topics.get_mut(&topic) {
                    members.remove(&conn_id);
                    if members.is_empty() {
                        self.topics.remove(&topic);
                    }
                }
                let _ = reply.send(());
            }
            Op::Connections { reply } => {
                let mut ids: Vec<ConnId> = self.conns.keys().cloned().collect();
                ids.sort();
                let _ = reply.send(ids);
            }
            Op::Topics { reply } => {
                let snapshot = self
                    .topics
                    .iter()
                    .map(|(topic, members)| {
                        let mut ids: Vec<ConnId> = members.iter().cloned().collect();
                        ids.sort();
                        (topic.clone(), ids)
                    })
                    .collect();
                let _ = reply.send(snapshot);
            }
            Op::Close { .. } => {}
        }
    }

    fn announce(&self, conn_id: &str, sub_type: &str) {
        let envelope = Envelope::presence(sub_type, conn_id);
        for (other, tx) in &self.conns {
            if other != conn_id {
                self.deliver(other, tx, envelope.clone());
            }
        }
    }

    fn deliver(&self, conn_id: &str, tx: &mpsc::Sender<Envelope>, envelope: Envelope) {
        match tx.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!(
                    "Room '{}': outbound buffer of {} full, message dropped",
                    self.name,
                    conn_id
                );
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Room '{}': {} is gone", self.name, conn_id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Room handle
// ---------------------------------------------------------------------------

/// Handle to a running room. Clones share the same worker.
#[derive(Debug, Clone)]
pub struct Room {
    name: Arc<str>,
    mailbox: mpsc::Sender<Op>,
    connection_buffer: usize,
    hooks: Option<HookSender>,
}

impl Room {
    /// Spawn a room worker. Must be called inside a tokio runtime.
    pub fn spawn(name: impl Into<String>, config: &HubConfig, hooks: Option<HookSender>) -> Self {
        let name: String = name.into();
        let (mailbox, rx) = mpsc::channel(config.room_mailbox_capacity);
        let worker = RoomWorker {
            name: name.clone(),
            conns: HashMap::new(),
            topics: HashMap::new(),
        };
        tokio::spawn(worker.run(rx));
        log::info!("Room '{}' started", name);

        Self {
            name: Arc::from(name),
            mailbox,
            connection_buffer: config.room_connection_buffer,
            hooks,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker has stopped.
    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    /// Whether both handles drive the same worker.
    pub fn same_room(&self, other: &Room) -> bool {
        self.mailbox.same_channel(&other.mailbox)
    }

    async fn enqueue(&self, op: Op) -> HubResult<()> {
        self.mailbox
            .send(op)
            .await
            .map_err(|_| HubError::Closed(format!("room '{}'", self.name)))
    }

    async fn request<T>(&self, op: Op, reply: oneshot::Receiver<T>) -> HubResult<T> {
        self.enqueue(op).await?;
        reply
            .await
            .map_err(|_| HubError::Closed(format!("room '{}'", self.name)))
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Register a connection. A live duplicate id is a [`HubError::Conflict`].
    pub async fn attach(&self, conn_id: &str) -> HubResult<RoomConnection> {
        let (outbound, rx) = mpsc::channel(self.connection_buffer);
        let (reply, result) = oneshot::channel();
        let op = Op::Attach {
            conn_id: conn_id.to_string(),
            outbound,
            reply,
        };
        self.request(op, result).await??;
        Ok(RoomConnection {
            conn_id: conn_id.to_string(),
            outbound: rx,
        })
    }

    /// Remove a connection and raise the OnDisconnect hook.
    ///
    /// Runs on the connection's own path, so the hook may block here without
    /// stalling the worker.
    pub async fn disconnect(&self, conn_id: &str) {
        let _ = self
            .enqueue(Op::Detach {
                conn_id: conn_id.to_string(),
            })
            .await;
        if let Some(hooks) = &self.hooks {
            hooks
                .send(RoomEvent::Disconnect {
                    room: self.name.to_string(),
                    conn_id: conn_id.to_string(),
                })
                .await;
        }
    }

    /// Stop the worker and drop every connection. Idempotent.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.enqueue(Op::Close { reply }).await.is_ok() {
            let _ = done.await;
        }
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    /// Deliver to every connection registered when the op is processed.
    pub async fn broadcast(&self, data: Value) -> HubResult<()> {
        self.enqueue(Op::Broadcast {
            envelope: Envelope::broadcast(data),
            except: None,
        })
        .await
    }

    /// Deliver to the subscribers of `topic`. Unknown topics are a no-op.
    pub async fn publish(&self, topic: &str, data: Value) -> HubResult<()> {
        self.enqueue(Op::Publish {
            topic: topic.to_string(),
            envelope: Envelope::publish(topic, data),
        })
        .await
    }

    /// Deliver to exactly one connection.
    pub async fn direct_message(&self, conn_id: &str, data: Value) -> HubResult<()> {
        self.send_direct(Envelope::direct(conn_id, data)).await
    }

    async fn send_direct(&self, envelope: Envelope) -> HubResult<()> {
        let conn_id = envelope.to_cid.clone().unwrap_or_default();
        let (reply, result) = oneshot::channel();
        self.request(
            Op::Direct {
                conn_id,
                envelope,
                reply,
            },
            result,
        )
        .await?
    }

    pub async fn subscribe(&self, topic: &str, conn_id: &str) -> HubResult<()> {
        let (reply, result) = oneshot::channel();
        let op = Op::Subscribe {
            topic: topic.to_string(),
            conn_id: conn_id.to_string(),
            reply,
        };
        self.request(op, result).await?
    }

    /// Idempotent: unknown topics and non-members are a no-op.
    pub async fn unsubscribe(&self, topic: &str, conn_id: &str) -> HubResult<()> {
        let (reply, result) = oneshot::channel();
        let op = Op::Unsubscribe {
            topic: topic.to_string(),
            conn_id: conn_id.to_string(),
            reply,
        };
        self.request(op, result).await
    }

    /// Sorted snapshot of attached connection ids.
    pub async fn connections(&self) -> HubResult<Vec<ConnId>> {
        let (reply, result) = oneshot::channel();
        self.request(Op::Connections { reply }, result).await
    }

    /// Snapshot of topic → sorted subscriber ids.
    pub async fn topics(&self) -> HubResult<BTreeMap<String, Vec<ConnId>>> {
        let (reply, result) = oneshot::channel();
        self.request(Op::Topics { reply }, result).await
    }

    // -----------------------------------------------------------------------
    // Client protocol
    // -----------------------------------------------------------------------

    /// Route one text frame received from `conn_id`.
    ///
    /// Returns a `server_error` envelope to send back when the frame is
    /// rejected.
    pub async fn handle_client_frame(&self, conn_id: &str, text: &str) -> Option<Envelope> {
        let mut envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => return Some(Envelope::error(None, e.to_string())),
        };
        envelope.from_cid = Some(conn_id.to_string());
        let rid = envelope.rid.clone();
        match self.route_client(conn_id, envelope).await {
            Ok(()) => None,
            Err(e) => Some(Envelope::error(rid, e.to_string())),
        }
    }

    async fn route_client(&self, conn_id: &str, envelope: Envelope) -> HubResult<()> {
        if !envelope.kind.is_client() {
            return Err(HubError::validation(format!(
                "clients may not send {:?} messages",
                envelope.kind
            )));
        }
        match envelope.kind {
            MessageType::ClientBroadcast => {
                self.enqueue(Op::Broadcast {
                    envelope: envelope.relabel(MessageType::ServerBroadcast),
                    except: Some(conn_id.to_string()),
                })
                .await
            }
            MessageType::ClientPublish => {
                let topic = required(envelope.topic.as_deref(), "topic")?;
                self.enqueue(Op::Publish {
                    topic,
                    envelope: envelope.relabel(MessageType::ServerPublish),
                })
                .await
            }
            MessageType::ClientDirect => {
                required(envelope.to_cid.as_deref(), "to_cid")?;
                self.send_direct(envelope.relabel(MessageType::ServerDirect))
                    .await
            }
            MessageType::ClientSubscribe => {
                let topic = required(envelope.topic.as_deref(), "topic")?;
                self.subscribe(&topic, conn_id).await
            }
            MessageType::ClientUnsubscribe => {
                let topic = required(envelope.topic.as_deref(), "topic")?;
                self.unsubscribe(&topic, conn_id).await
            }
            MessageType::ClientCommand => {
                match &self.hooks {
                    Some(hooks) => {
                        hooks
                            .send(RoomEvent::Command {
                                room: self.name.to_string(),
                                conn_id: conn_id.to_string(),
                                envelope,
                            })
                            .await;
                    }
                    None => log::debug!("Room '{}' has no command handler", self.name),
                }
                Ok(())
            }
            // Server types are rejected above.
            _ => Ok(()),
        }
    }
}

fn required(value: Option<&str>, field: &str) -> HubResult<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(HubError::validation(format!("{} is required", field))),
    }
}

// ---------------------------------------------------------------------------
// RoomConnection
// ---------------------------------------------------------------------------

/// Receiving end of one attached connection.
#[derive(Debug)]
pub struct RoomConnection {
    conn_id: ConnId,
    outbound: mpsc::Receiver<Envelope>,
}

impl RoomConnection {
    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Next envelope for this connection; `None` once the room closes.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.outbound.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.outbound.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

/// Rooms by logical name. Installing a room closes the one it replaces
/// before the new one becomes visible.
#[derive(Debug, Default)]
pub struct Rooms {
    rooms: DashMap<String, Room>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn install(&self, room: Room) {
        if room.is_closed() {
            log::debug!("Room '{}' closed before install, skipped", room.name());
            return;
        }
        if let Some((_, previous)) = self.rooms.remove(room.name()) {
            log::info!("Replacing room '{}'", previous.name());
            previous.close().await;
        }
        if let Some(raced) = self.rooms.insert(room.name().to_string(), room) {
            raced.close().await;
        }
    }

    pub fn get(&self, name: &str) -> Option<Room> {
        self.rooms.get(name).map(|entry| entry.value().clone())
    }

    /// Remove `room` if it is still the one installed under its name, and close it.
    pub async fn retire(&self, room: &Room) {
        self.rooms
            .remove_if(room.name(), |_, installed| installed.same_room(room));
        room.close().await;
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
