use indexmap::IndexMap;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{self, now_millis, Store};
use crate::error::{ChatError, Result};
use crate::model::{
    EnrichedMessage, LinkPreview, MessageKind, MessageView, ReactionUser, ReplySummary,
};
use crate::preview::{self, LinkPreviewResolver};

/// A message as submitted by a client.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub chat_id: i64,
    pub author_id: i64,
    pub content: Option<String>,
    pub kind: MessageKind,
    pub file_ref: Option<String>,
    pub reply_to_id: Option<i64>,
}

/// A [`NewMessage`] whose fields and references have been checked.
#[derive(Debug, Clone)]
pub struct ValidatedMessage(NewMessage);

impl ValidatedMessage {
    pub fn chat_id(&self) -> i64 {
        self.0.chat_id
    }
}

/// Message creation and history retrieval.
#[derive(Clone)]
pub struct MessageService {
    store: Store,
    previews: Option<Arc<LinkPreviewResolver>>,
}

impl MessageService {
    /// `previews` may be `None` to disable link preview fetching.
    pub fn new(store: Store, previews: Option<Arc<LinkPreviewResolver>>) -> Self {
        Self { store, previews }
    }

    /// Validate, enrich with a link preview and persist a message.
    pub async fn create_message(&self, draft: NewMessage) -> Result<MessageView> {
        let draft = self.validate(draft)?;
        let preview = self.resolve_preview(&draft).await;
        self.persist(draft, preview)
    }

    /// Check required fields and that chat, author and reply target exist.
    pub fn validate(&self, mut draft: NewMessage) -> Result<ValidatedMessage> {
        draft.content = draft.content.filter(|c| !c.trim().is_empty());
        draft.file_ref = draft.file_ref.filter(|f| !f.trim().is_empty());
        match draft.kind {
            MessageKind::Text if draft.content.is_none() => {
                return Err(ChatError::invalid("text messages need content"));
            }
            MessageKind::Text => {}
            _ if draft.file_ref.is_none() => {
                return Err(ChatError::invalid(format!(
                    "{} messages need a file reference",
                    draft.kind
                )));
            }
            _ => {}
        }

        let conn = self.store.conn()?;
        if !db::chat_exists(&conn, draft.chat_id)? {
            return Err(ChatError::NotFound("chat"));
        }
        db::get_user(&conn, draft.author_id)?;
        if let Some(reply_to) = draft.reply_to_id {
            let chat: Option<i64> = conn
                .query_row(
                    "SELECT chat_id FROM messages WHERE id = ?1",
                    [reply_to],
                    |row| row.get(0),
                )
                .optional()?;
            match chat {
                None => return Err(ChatError::NotFound("message")),
                Some(chat) if chat != draft.chat_id => {
                    return Err(ChatError::invalid("replies must stay within the same chat"));
                }
                Some(_) => {}
            }
        }
        Ok(ValidatedMessage(draft))
    }

    /// Preview for the first URL of a text message. Never fails.
    pub async fn resolve_preview(&self, draft: &ValidatedMessage) -> Option<LinkPreview> {
        let resolver = self.previews.as_ref()?;
        if draft.0.kind != MessageKind::Text {
            return None;
        }
        let url = preview::first_url(draft.0.content.as_deref()?)?;
        resolver.resolve(url.as_str()).await
    }

    /// Append the message to its chat.
    ///
    /// `created_at` is clamped to the newest timestamp already in the chat,
    /// so ordering by time and by id agree.
    pub fn persist(
        &self,
        draft: ValidatedMessage,
        preview: Option<LinkPreview>,
    ) -> Result<MessageView> {
        let NewMessage {
            chat_id,
            author_id,
            content,
            kind,
            file_ref,
            reply_to_id,
        } = draft.0;
        let preview_json = preview.as_ref().map(serde_json::to_string).transpose()?;
        let conn = self.store.conn()?;
        let (id, created_at): (i64, i64) = conn.query_row(
            "INSERT INTO messages (chat_id, user_id, content, kind, file_ref, link_preview, reply_to_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, \
               MAX(?8, COALESCE((SELECT MAX(created_at) FROM messages WHERE chat_id = ?1), 0))) \
             RETURNING id, created_at",
            params![
                chat_id,
                author_id,
                content,
                kind,
                file_ref,
                preview_json,
                reply_to_id,
                now_millis()
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let username = db::get_user(&conn, author_id)?.username;
        let reply_to = reply_to_id
            .map(|reply_id| reply_summary(&conn, reply_id))
            .transpose()?;
        info!(message_id = id, chat_id, user_id = author_id, kind = %kind, "message stored");
        Ok(MessageView {
            id,
            chat_id,
            content,
            kind,
            file_path: file_ref,
            link_preview: preview,
            username,
            user_id: author_id,
            reply_to,
            created_at,
        })
    }

    /// Full history of a chat in canonical order with replies and reactions.
    pub fn list_messages(&self, chat_id: i64) -> Result<Vec<EnrichedMessage>> {
        let conn = self.store.conn()?;
        if !db::chat_exists(&conn, chat_id)? {
            return Err(ChatError::NotFound("chat"));
        }
        let mut reactions = reactions_by_message(&conn, chat_id)?;
        let mut stmt = conn.prepare(
            "SELECT m.id, m.chat_id, m.content, m.kind, m.file_ref, m.link_preview, \
                    u.username, m.user_id, m.reply_to_id, m.created_at, \
                    rm.content, rm.kind, ru.username \
             FROM messages m \
             JOIN users u ON u.id = m.user_id \
             LEFT JOIN messages rm ON rm.id = m.reply_to_id \
             LEFT JOIN users ru ON ru.id = rm.user_id \
             WHERE m.chat_id = ?1 \
             ORDER BY m.created_at ASC, m.id ASC",
        )?;
        let rows = stmt.query_map([chat_id], |row| {
            let id: i64 = row.get(0)?;
            let preview: Option<String> = row.get(5)?;
            let reply_to_id: Option<i64> = row.get(8)?;
            let reply_to = match (reply_to_id, row.get::<_, Option<String>>(12)?) {
                (Some(reply_id), Some(username)) => {
                    let kind: MessageKind = row.get(11)?;
                    Some(ReplySummary {
                        id: reply_id,
                        username,
                        content: redacted(kind, row.get(10)?),
                    })
                }
                _ => None,
            };
            Ok(MessageView {
                id,
                chat_id: row.get(1)?,
                content: row.get(2)?,
                kind: row.get(3)?,
                file_path: row.get(4)?,
                link_preview: preview.and_then(|p| decode_preview(id, &p)),
                username: row.get(6)?,
                user_id: row.get(7)?,
                reply_to,
                created_at: row.get(9)?,
            })
        })?;
        let mut out = Vec::new();
        for message in rows {
            let message = message?;
            let reactions = reactions.remove(&message.id).unwrap_or_default();
            out.push(EnrichedMessage { message, reactions });
        }
        debug!(chat_id, count = out.len(), "history loaded");
        Ok(out)
    }
}

/// Reply quotes show text as-is and a label for media.
fn redacted(kind: MessageKind, content: Option<String>) -> Option<String> {
    match kind.placeholder() {
        Some(label) => Some(label.to_owned()),
        None => content,
    }
}

fn decode_preview(message_id: i64, raw: &str) -> Option<LinkPreview> {
    match serde_json::from_str(raw) {
        Ok(preview) => Some(preview),
        Err(e) => {
            warn!(message_id, error = %e, "stored link preview is unreadable");
            None
        }
    }
}

pub(crate) fn reply_summary(conn: &Connection, reply_id: i64) -> Result<ReplySummary> {
    let (username, content, kind): (String, Option<String>, MessageKind) = conn.query_row(
        "SELECT u.username, m.content, m.kind FROM messages m \
         JOIN users u ON u.id = m.user_id WHERE m.id = ?1",
        [reply_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    Ok(ReplySummary {
        id: reply_id,
        username,
        content: redacted(kind, content),
    })
}

type ReactionMap = IndexMap<String, Vec<ReactionUser>>;

fn reactions_by_message(conn: &Connection, chat_id: i64) -> Result<HashMap<i64, ReactionMap>> {
    let mut stmt = conn.prepare(
        "SELECT r.message_id, r.emoji, u.username, r.user_id FROM reactions r \
         JOIN messages m ON m.id = r.message_id \
         JOIN users u ON u.id = r.user_id \
         WHERE m.chat_id = ?1 ORDER BY r.id",
    )?;
    let mut rows = stmt.query([chat_id])?;
    let mut out: HashMap<i64, ReactionMap> = HashMap::new();
    while let Some(row) = rows.next()? {
        out.entry(row.get(0)?)
            .or_default()
            .entry(row.get(1)?)
            .or_default()
            .push(ReactionUser {
                username: row.get(2)?,
                user_id: row.get(3)?,
            });
    }
    Ok(out)
}
