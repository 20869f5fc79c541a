use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::db::{self, now_millis, Store};
use crate::error::{ChatError, Result};
use crate::model::{ReactionAdded, ReactionEvent, ReactionRemoved};

/// Room for ZWJ sequences and tag flags, which run up to 7 scalars.
const MAX_EMOJI_CHARS: usize = 16;

/// One emoji per user per message.
#[derive(Clone)]
pub struct ReactionService {
    store: Store,
}

impl ReactionService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Set the user's reaction on a message, replacing any previous emoji.
    ///
    /// The replace is a single statement against the `(message_id, user_id)`
    /// unique key, so readers never observe zero or two rows for the pair.
    pub fn set_reaction(
        &self,
        message_id: i64,
        user_id: i64,
        emoji: &str,
        chat_id: i64,
    ) -> Result<ReactionEvent> {
        let emoji = emoji.trim();
        if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_CHARS {
            return Err(ChatError::invalid("emoji must be 1 to 16 characters"));
        }
        let conn = self.store.conn()?;
        ensure_message_in_chat(&conn, message_id, chat_id)?;
        let user = db::get_user(&conn, user_id)?;
        conn.execute(
            "INSERT OR REPLACE INTO reactions (message_id, user_id, emoji, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![message_id, user_id, emoji, now_millis()],
        )?;
        info!(message_id, user_id, emoji, "reaction set");
        Ok(ReactionEvent::Added(ReactionAdded {
            message_id,
            emoji: emoji.to_owned(),
            username: user.username,
            user_id,
        }))
    }

    /// Remove the user's reaction. Removing a missing reaction is a no-op.
    pub fn clear_reaction(
        &self,
        message_id: i64,
        user_id: i64,
        chat_id: i64,
    ) -> Result<ReactionEvent> {
        let conn = self.store.conn()?;
        ensure_message_in_chat(&conn, message_id, chat_id)?;
        let removed = conn.execute(
            "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2",
            params![message_id, user_id],
        )?;
        info!(message_id, user_id, removed, "reaction cleared");
        Ok(ReactionEvent::Removed(ReactionRemoved {
            message_id,
            user_id,
        }))
    }
}

fn ensure_message_in_chat(conn: &Connection, message_id: i64, chat_id: i64) -> Result<()> {
    let owner: Option<i64> = conn
        .query_row(
            "SELECT chat_id FROM messages WHERE id = ?1",
            [message_id],
            |row| row.get(0),
        )
        .optional()?;
    match owner {
        None => Err(ChatError::NotFound("message")),
        Some(owner) if owner != chat_id => {
            Err(ChatError::invalid("message belongs to another chat"))
        }
        Some(_) => Ok(()),
    }
}
