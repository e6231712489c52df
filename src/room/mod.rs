//! Pub/Sub Room Engine.
//!
//! A [`Room`] serves websocket connections with topics, broadcast and direct
//! addressing. Its connection registry and subscription sets are written only
//! by the room's own worker task; everything else talks to it through a
//! mailbox. Commands and disconnects are handed to the owning capability over
//! a separate [`hooks`] queue.

pub mod envelope;
pub mod hooks;
#[allow(clippy::module_inception)]
pub mod room;

pub use envelope::{Envelope, MessageType};
pub use hooks::{hook_channel, spawn_hook_consumer, HookSender, LoggingHooks, RoomEvent, RoomHooks};
pub use room::{ConnId, Room, RoomConnection, Rooms};
