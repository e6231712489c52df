//! OnCommand / OnDisconnect hand-off from rooms to their owning capability.
//!
//! Events travel over a bounded queue to one long-lived consumer task per
//! builder. Producers are the connection paths (frame reader, teardown), never
//! a room worker, so handlers may call back into a [`Room`](super::Room).
//!
//! When the queue is full the [`HookOverflow`] policy applies: `Block` waits up
//! to the configured deadline and then drops the event, `Drop` drops at once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use super::envelope::Envelope;
use crate::config::{HookOverflow, HubConfig};

/// Event handed to the owning capability.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// A client sent a `client_command` frame.
    Command {
        room: String,
        conn_id: String,
        envelope: Envelope,
    },
    /// A connection left the room.
    Disconnect { room: String, conn_id: String },
}

impl RoomEvent {
    pub fn room(&self) -> &str {
        match self {
            Self::Command { room, .. } | Self::Disconnect { room, .. } => room,
        }
    }
}

/// Producer side of the hook queue.
#[derive(Debug, Clone)]
pub struct HookSender {
    tx: mpsc::Sender<RoomEvent>,
    overflow: HookOverflow,
    send_timeout: Duration,
}

/// Create a hook queue sized and policed by `config`.
pub fn hook_channel(config: &HubConfig) -> (HookSender, mpsc::Receiver<RoomEvent>) {
    let (tx, rx) = mpsc::channel(config.hook_queue_capacity);
    let sender = HookSender {
        tx,
        overflow: config.hook_overflow,
        send_timeout: config.hook_send_timeout(),
    };
    (sender, rx)
}

impl HookSender {
    /// Hand an event to the consumer. Returns whether it was accepted.
    pub async fn send(&self, event: RoomEvent) -> bool {
        match self.overflow {
            HookOverflow::Drop => match self.tx.try_send(event) {
                Ok(()) => true,
                Err(TrySendError::Full(event)) => {
                    log::warn!("Hook queue full, dropping event for room '{}'", event.room());
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    log::debug!("Hook consumer gone, event discarded");
                    false
                }
            },
            HookOverflow::Block => {
                match tokio::time::timeout(self.send_timeout, self.tx.send(event)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(_)) => {
                        log::debug!("Hook consumer gone, event discarded");
                        false
                    }
                    Err(_) => {
                        log::warn!(
                            "Hook consumer stalled for {:?}, event dropped",
                            self.send_timeout
                        );
                        false
                    }
                }
            }
        }
    }
}

/// Consumer of room events.
#[async_trait]
pub trait RoomHooks: Send + Sync {
    async fn on_command(&self, room: &str, conn_id: &str, envelope: Envelope);

    async fn on_disconnect(&self, room: &str, conn_id: &str);
}

/// Handler that only logs events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHooks;

#[async_trait]
impl RoomHooks for LoggingHooks {
    async fn on_command(&self, room: &str, conn_id: &str, envelope: Envelope) {
        log::info!(
            "Room '{}' command from {} (target={:?})",
            room,
            conn_id,
            envelope.target
        );
    }

    async fn on_disconnect(&self, room: &str, conn_id: &str) {
        log::debug!("Room '{}' lost connection {}", room, conn_id);
    }
}

/// Spawn the consumer task. It ends when every [`HookSender`] is dropped.
pub fn spawn_hook_consumer(
    mut rx: mpsc::Receiver<RoomEvent>,
    hooks: Arc<dyn RoomHooks>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                RoomEvent::Command {
                    room,
                    conn_id,
                    envelope,
                } => hooks.on_command(&room, &conn_id, envelope).await,
                RoomEvent::Disconnect { room, conn_id } => {
                    hooks.on_disconnect(&room, &conn_id).await
                }
            }
        }
        log::debug!("Hook consumer stopped");
    })
}
