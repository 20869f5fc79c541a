use indexmap::IndexMap;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ChatError;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Direct,
    Group,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Chat {
    pub id: i64,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    pub created_at: i64,
}

/// A chat as shown in a member's chat list.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatSummary {
    pub id: i64,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    pub members: Vec<String>,
    pub unread_count: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::File => "file",
        }
    }

    /// Label shown in reply quotes instead of the media reference.
    pub fn placeholder(&self) -> Option<&'static str> {
        match self {
            Self::Text => None,
            Self::Image => Some("📷 Image"),
            Self::Video => Some("🎥 Video"),
            Self::Audio => Some("🎵 Audio"),
            Self::File => Some("📎 File"),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "file" => Ok(Self::File),
            other => Err(ChatError::invalid(format!("unknown message type `{other}`"))),
        }
    }
}

impl ToSql for MessageKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for MessageKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: ChatError| FromSqlError::Other(Box::new(e)))
    }
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }
}

impl ToSql for ChatKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ChatKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// Open Graph style summary of a linked page.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LinkPreview {
    pub url: String,
    pub title: String,
    pub description: String,
    pub image: Option<String>,
    pub domain: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReplySummary {
    pub id: i64,
    pub username: String,
    pub content: Option<String>,
}

/// A persisted message in the shape clients receive it, both live and in history.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: i64,
    pub chat_id: i64,
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub file_path: Option<String>,
    pub link_preview: Option<LinkPreview>,
    pub username: String,
    pub user_id: i64,
    pub reply_to: Option<ReplySummary>,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReactionUser {
    pub username: String,
    pub user_id: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EnrichedMessage {
    #[serde(flatten)]
    pub message: MessageView,
    /// Emoji to reacting users, keyed in order of first use.
    pub reactions: IndexMap<String, Vec<ReactionUser>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReactionAdded {
    pub message_id: i64,
    pub emoji: String,
    pub username: String,
    pub user_id: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReactionRemoved {
    pub message_id: i64,
    pub user_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionEvent {
    Added(ReactionAdded),
    Removed(ReactionRemoved),
}
