use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::db::{self, now_millis};
use crate::error::{ChatError, Result};

/// Advance the read receipt for a user in a chat.
///
/// Without `up_to` the chat's newest message is used. The stored watermark
/// never moves backwards. Returns the watermark after the update, or `None`
/// when nothing has been read yet.
pub fn mark_read(
    conn: &Connection,
    chat_id: i64,
    user_id: i64,
    up_to: Option<i64>,
) -> Result<Option<i64>> {
    if !db::chat_exists(conn, chat_id)? {
        return Err(ChatError::NotFound("chat"));
    }
    db::get_user(conn, user_id)?;
    let target = match up_to {
        Some(id) => {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT id FROM messages WHERE id = ?1 AND chat_id = ?2",
                    params![id, chat_id],
                    |row| row.get(0),
                )
                .optional()?;
            Some(found.ok_or(ChatError::NotFound("message"))?)
        }
        None => conn.query_row(
            "SELECT MAX(id) FROM messages WHERE chat_id = ?1",
            [chat_id],
            |row| row.get::<_, Option<i64>>(0),
        )?,
    };
    if let Some(target) = target {
        conn.execute(
            "INSERT INTO read_receipts (chat_id, user_id, last_read_message_id, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(chat_id, user_id) DO UPDATE SET \
               last_read_message_id = MAX(last_read_message_id, excluded.last_read_message_id), \
               updated_at = excluded.updated_at",
            params![chat_id, user_id, target, now_millis()],
        )?;
        debug!(chat_id, user_id, target, "read receipt updated");
    }
    last_read(conn, chat_id, user_id)
}

/// Highest message id the user has acknowledged in the chat.
pub fn last_read(conn: &Connection, chat_id: i64, user_id: i64) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT last_read_message_id FROM read_receipts WHERE chat_id = ?1 AND user_id = ?2",
            params![chat_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Messages from other authors newer than the user's watermark.
pub fn unread_count(conn: &Connection, chat_id: i64, user_id: i64) -> Result<u32> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM messages m \
         LEFT JOIN read_receipts rr ON rr.chat_id = m.chat_id AND rr.user_id = ?2 \
         WHERE m.chat_id = ?1 AND m.user_id <> ?2 \
           AND (rr.last_read_message_id IS NULL OR m.id > rr.last_read_message_id)",
        params![chat_id, user_id],
        |row| row.get::<_, u32>(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn unread_math() {
        let (store, users) = testutil::store_with_users(&["alice", "bob"]);
        let (alice, bob) = (users[0].id, users[1].id);
        let chat = testutil::direct_chat(&store, alice, bob);
        testutil::insert_message(&store, chat, alice, "m1");
        testutil::insert_message(&store, chat, bob, "m2");
        let conn = store.conn().unwrap();
        assert_eq!(unread_count(&conn, chat, alice).unwrap(), 1);
        assert_eq!(unread_count(&conn, chat, bob).unwrap(), 1);

        let latest = mark_read(&conn, chat, alice, None).unwrap();
        assert!(latest.is_some());
        assert_eq!(unread_count(&conn, chat, alice).unwrap(), 0);
        drop(conn);

        for n in 1..=3 {
            testutil::insert_message(&store, chat, bob, "more");
            let conn = store.conn().unwrap();
            assert_eq!(unread_count(&conn, chat, alice).unwrap(), n);
        }
        testutil::insert_message(&store, chat, alice, "mine");
        let conn = store.conn().unwrap();
        assert_eq!(unread_count(&conn, chat, alice).unwrap(), 3);
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let (store, users) = testutil::store_with_users(&["alice", "bob"]);
        let (alice, bob) = (users[0].id, users[1].id);
        let chat = testutil::direct_chat(&store, alice, bob);
        let m1 = testutil::insert_message(&store, chat, bob, "one");
        let m2 = testutil::insert_message(&store, chat, bob, "two");
        let conn = store.conn().unwrap();
        assert_eq!(mark_read(&conn, chat, alice, Some(m2)).unwrap(), Some(m2));
        assert_eq!(mark_read(&conn, chat, alice, Some(m1)).unwrap(), Some(m2));
        assert_eq!(last_read(&conn, chat, alice).unwrap(), Some(m2));
    }

    #[test]
    fn empty_chat_and_foreign_message() {
        let (store, users) = testutil::store_with_users(&["alice", "bob", "carol"]);
        let chat = testutil::direct_chat(&store, users[0].id, users[1].id);
        let other = testutil::direct_chat(&store, users[0].id, users[2].id);
        let foreign = testutil::insert_message(&store, other, users[2].id, "elsewhere");
        let conn = store.conn().unwrap();
        assert_eq!(mark_read(&conn, chat, users[0].id, None).unwrap(), None);
        assert!(matches!(
            mark_read(&conn, chat, users[0].id, Some(foreign)),
            Err(ChatError::NotFound("message"))
        ));
        assert!(matches!(
            mark_read(&conn, 404, users[0].id, None),
            Err(ChatError::NotFound("chat"))
        ));
    }
}
