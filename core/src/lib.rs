//! Messaging engine: persistence, chat and message services, link previews
//! and real-time room fan-out. Transport-agnostic; the HTTP and WebSocket
//! surface lives in the `chatline` crate.

pub mod chats;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod messages;
pub mod model;
pub mod preview;
pub mod reactions;
pub mod reads;
pub mod rooms;

pub use chats::ChatService;
pub use db::Store;
pub use dispatch::Dispatcher;
pub use error::{ChatError, Result};
pub use events::{InboundEvent, OutboundEvent};
pub use messages::{MessageService, NewMessage};
pub use preview::LinkPreviewResolver;
pub use reactions::ReactionService;
pub use rooms::{ConnId, RoomBroadcaster};
