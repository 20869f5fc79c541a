use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::db::{self, now_millis, Store};
use crate::error::{ChatError, Result};
use crate::model::{Chat, ChatKind, ChatSummary};
use crate::reads;

/// Normalized key of the unordered member pair of a direct chat.
pub fn direct_key(a: i64, b: i64) -> String {
    let (min, max) = if a < b { (a, b) } else { (b, a) };
    format!("{min}:{max}")
}

/// Chat creation, membership and unread bookkeeping.
#[derive(Clone)]
pub struct ChatService {
    store: Store,
}

impl ChatService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Create a chat, or return the existing direct chat for the same pair.
    ///
    /// The boolean is true when a new chat was persisted. Lookup and insert
    /// run inside one IMMEDIATE transaction, so concurrent callers for the
    /// same pair serialize on the database write lock.
    pub fn create_or_get_chat(
        &self,
        kind: ChatKind,
        member_ids: &[i64],
        name: Option<&str>,
    ) -> Result<(Chat, bool)> {
        let mut members = member_ids.to_vec();
        members.sort_unstable();
        members.dedup();
        if members.is_empty() {
            return Err(ChatError::invalid("a chat needs at least one member"));
        }
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        let key = match (kind, members.as_slice()) {
            (ChatKind::Direct, [a, b]) => Some(direct_key(*a, *b)),
            _ => None,
        };

        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for id in &members {
            db::get_user(&tx, *id)?;
        }
        if let Some(key) = &key {
            if let Some(chat) = find_direct(&tx, key)? {
                tx.commit()?;
                debug!(chat_id = chat.id, key = %key, "direct chat already exists");
                return Ok((chat, false));
            }
        }
        let now = now_millis();
        tx.execute(
            "INSERT INTO chats (name, kind, direct_key, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, kind, key, now],
        )?;
        let id = tx.last_insert_rowid();
        for user_id in &members {
            tx.execute(
                "INSERT INTO chat_members (chat_id, user_id) VALUES (?1, ?2)",
                params![id, user_id],
            )?;
        }
        tx.commit()?;
        info!(chat_id = id, kind = kind.as_str(), members = members.len(), "chat created");
        Ok((
            Chat {
                id,
                name: name.map(str::to_owned),
                kind,
                created_at: now,
            },
            true,
        ))
    }

    /// Every chat the user belongs to, newest first, with member names and
    /// unread counts.
    pub fn list_chats_for_user(&self, user_id: i64) -> Result<Vec<ChatSummary>> {
        let conn = self.store.conn()?;
        db::get_user(&conn, user_id)?;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.name, c.kind FROM chats c \
             JOIN chat_members cm ON cm.chat_id = c.id \
             WHERE cm.user_id = ?1 ORDER BY c.id DESC",
        )?;
        let chats = stmt
            .query_map([user_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, ChatKind>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(chats.len());
        for (id, name, kind) in chats {
            out.push(ChatSummary {
                id,
                name,
                kind,
                members: member_names(&conn, id)?,
                unread_count: reads::unread_count(&conn, id, user_id)?,
            });
        }
        Ok(out)
    }

    /// Advance the user's read receipt; see [`reads::mark_read`].
    pub fn mark_read(
        &self,
        chat_id: i64,
        user_id: i64,
        up_to: Option<i64>,
    ) -> Result<Option<i64>> {
        let conn = self.store.conn()?;
        reads::mark_read(&conn, chat_id, user_id, up_to)
    }

    pub fn unread_count(&self, chat_id: i64, user_id: i64) -> Result<u32> {
        let conn = self.store.conn()?;
        reads::unread_count(&conn, chat_id, user_id)
    }
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn find_direct(conn: &Connection, key: &str) -> Result<Option<Chat>> {
    let chat = conn
        .query_row(
            "SELECT id, name, kind, created_at FROM chats WHERE direct_key = ?1",
            [key],
            row_to_chat,
        )
        .optional()?;
    Ok(chat)
}

fn member_names(conn: &Connection, chat_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT u.username FROM chat_members cm JOIN users u ON u.id = cm.user_id \
         WHERE cm.chat_id = ?1 ORDER BY u.id",
    )?;
    let names = stmt
        .query_map([chat_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(names)
}
