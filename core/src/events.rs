//! Real-time wire protocol. Every frame is `{"event": <name>, "data": {...}}`.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ChatError, Result};
use crate::model::{MessageKind, MessageView, ReactionAdded, ReactionEvent, ReactionRemoved};

/// Events a client may send.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    Join {
        username: String,
        #[serde(deserialize_with = "flexible_id")]
        room: i64,
    },
    Leave {
        username: String,
        #[serde(deserialize_with = "flexible_id")]
        room: i64,
    },
    SendMessage {
        #[serde(deserialize_with = "flexible_id")]
        chat_id: i64,
        user_id: i64,
        #[serde(default)]
        content: Option<String>,
        #[serde(rename = "type", default)]
        kind: MessageKind,
        #[serde(default)]
        file_path: Option<String>,
        #[serde(default)]
        reply_to_id: Option<i64>,
    },
    Typing {
        username: String,
        #[serde(deserialize_with = "flexible_id")]
        chat_id: i64,
    },
    AddReaction {
        message_id: i64,
        user_id: i64,
        emoji: String,
        #[serde(deserialize_with = "flexible_id")]
        chat_id: i64,
    },
    RemoveReaction {
        message_id: i64,
        user_id: i64,
        #[serde(deserialize_with = "flexible_id")]
        chat_id: i64,
    },
}

impl InboundEvent {
    /// Decode a text frame; malformed frames are `InvalidArgument`.
    pub fn decode(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(|e| ChatError::invalid(format!("bad frame: {e}")))
    }
}

/// Events pushed to clients.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    UserJoined { username: String },
    UserLeft { username: String },
    NewMessage(MessageView),
    ChatUpdated { chat_id: i64 },
    UserTyping { username: String, chat_id: i64 },
    ReactionAdded(ReactionAdded),
    ReactionRemoved(ReactionRemoved),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::NewMessage(_) => "new_message",
            Self::ChatUpdated { .. } => "chat_updated",
            Self::UserTyping { .. } => "user_typing",
            Self::ReactionAdded(_) => "reaction_added",
            Self::ReactionRemoved(_) => "reaction_removed",
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<ReactionEvent> for OutboundEvent {
    fn from(event: ReactionEvent) -> Self {
        match event {
            ReactionEvent::Added(added) => Self::ReactionAdded(added),
            ReactionEvent::Removed(removed) => Self::ReactionRemoved(removed),
        }
    }
}

/// Chat ids arrive either as numbers or as numeric strings (room names).
fn flexible_id<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(i64),
        Text(String),
    }
    match Repr::deserialize(deserializer)? {
        Repr::Number(n) => Ok(n),
        Repr::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_inbound_frames() {
        let join =
            InboundEvent::decode(r#"{"event":"join","data":{"username":"alice","room":"5"}}"#)
                .unwrap();
        assert_eq!(
            join,
            InboundEvent::Join {
                username: "alice".into(),
                room: 5
            }
        );

        let send = InboundEvent::decode(
            r#"{"event":"send_message","data":{"chat_id":5,"user_id":1,"content":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(
            send,
            InboundEvent::SendMessage {
                chat_id: 5,
                user_id: 1,
                content: Some("hi".into()),
                kind: MessageKind::Text,
                file_path: None,
                reply_to_id: None,
            }
        );

        let photo = InboundEvent::decode(
            r#"{"event":"send_message","data":{"chat_id":"7","user_id":1,"content":null,"type":"image","file_path":"f.png"}}"#,
        )
        .unwrap();
        assert!(matches!(
            photo,
            InboundEvent::SendMessage { chat_id: 7, kind: MessageKind::Image, .. }
        ));
    }

    #[test]
    fn rejects_malformed_frames() {
        for frame in [
            "not json",
            r#"{"event":"dance","data":{}}"#,
            r#"{"event":"join","data":{"username":"a","room":"lobby"}}"#,
            r#"{"event":"send_message","data":{"chat_id":1,"user_id":1,"type":"hologram"}}"#,
        ] {
            assert!(matches!(
                InboundEvent::decode(frame),
                Err(ChatError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn encodes_outbound_with_event_names() {
        let event = OutboundEvent::UserTyping {
            username: "bob".into(),
            chat_id: 3,
        };
        let value: serde_json::Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"event": "user_typing", "data": {"username": "bob", "chat_id": 3}})
        );
        assert_eq!(event.name(), "user_typing");

        let removed: OutboundEvent = ReactionEvent::Removed(ReactionRemoved {
            message_id: 9,
            user_id: 2,
        })
        .into();
        let value: serde_json::Value = serde_json::from_str(&removed.encode().unwrap()).unwrap();
        assert_eq!(value["event"], removed.name());
        assert_eq!(value["data"], json!({"message_id": 9, "user_id": 2}));
    }
}
