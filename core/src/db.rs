use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::info;

use crate::error::{is_constraint_violation, ChatError, Result};
use crate::model::User;

pub type Conn = PooledConnection<SqliteConnectionManager>;

/// Durable store backed by a pooled SQLite database.
#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

impl Store {
    /// Open (or create) the database file and run migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(init_conn);
        let pool = Pool::builder().max_size(8).build(manager)?;
        let store = Self { pool };
        store.migrate()?;
        info!(path = %path.as_ref().display(), "database ready");
        Ok(store)
    }

    /// In-memory database. The pool holds a single connection so every
    /// caller sees the same data.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(init_conn);
        let pool = Pool::builder().max_size(1).build(manager)?;
        let store = Self { pool };
        store.migrate()?;
        Ok(store)
    }

    pub fn conn(&self) -> Result<Conn> {
        Ok(self.pool.get()?)
    }

    fn migrate(&self) -> Result<()> {
        self.conn()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Insert a new user. Usernames are unique.
    pub fn create_user(&self, username: &str, password_hash: &str) -> Result<User> {
        let conn = self.conn()?;
        let res = conn.execute(
            "INSERT INTO users (username, password_hash, created_at) VALUES (?1, ?2, ?3)",
            params![username, password_hash, now_millis()],
        );
        match res {
            Ok(_) => Ok(User {
                id: conn.last_insert_rowid(),
                username: username.into(),
            }),
            Err(e) if is_constraint_violation(&e) => {
                Err(ChatError::Conflict(format!("username `{username}` already exists")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a user together with the stored credential hash.
    pub fn find_credentials(&self, username: &str) -> Result<Option<(User, String)>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, username, password_hash FROM users WHERE username = ?1",
                [username],
                |row| {
                    Ok((
                        User {
                            id: row.get(0)?,
                            username: row.get(1)?,
                        },
                        row.get(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, username FROM users ORDER BY id")?;
        let users = stmt
            .query_map([], |row| {
                Ok(User {
                    id: row.get(0)?,
                    username: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    }
}

fn init_conn(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "foreign_keys", "ON")
}

pub(crate) fn get_user(conn: &Connection, id: i64) -> Result<User> {
    conn.query_row(
        "SELECT id, username FROM users WHERE id = ?1",
        [id],
        |row| {
            Ok(User {
                id: row.get(0)?,
                username: row.get(1)?,
            })
        },
    )
    .optional()?
    .ok_or(ChatError::NotFound("user"))
}

pub(crate) fn chat_exists(conn: &Connection, id: i64) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM chats WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  username TEXT UNIQUE NOT NULL,
  password_hash TEXT NOT NULL,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS chats (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT,
  kind TEXT NOT NULL CHECK (kind IN ('direct', 'group')),
  direct_key TEXT UNIQUE,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS chat_members (
  chat_id INTEGER NOT NULL REFERENCES chats(id),
  user_id INTEGER NOT NULL REFERENCES users(id),
  PRIMARY KEY (chat_id, user_id)
);

CREATE TABLE IF NOT EXISTS messages (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  chat_id INTEGER NOT NULL REFERENCES chats(id),
  user_id INTEGER NOT NULL REFERENCES users(id),
  content TEXT,
  kind TEXT NOT NULL DEFAULT 'text',
  file_ref TEXT,
  link_preview TEXT,
  reply_to_id INTEGER REFERENCES messages(id),
  created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS messages_chat_order ON messages(chat_id, created_at, id);

CREATE TABLE IF NOT EXISTS reactions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  message_id INTEGER NOT NULL REFERENCES messages(id),
  user_id INTEGER NOT NULL REFERENCES users(id),
  emoji TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  UNIQUE(message_id, user_id)
);

CREATE TABLE IF NOT EXISTS read_receipts (
  chat_id INTEGER NOT NULL REFERENCES chats(id),
  user_id INTEGER NOT NULL REFERENCES users(id),
  last_read_message_id INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  PRIMARY KEY (chat_id, user_id)
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames_are_unique() {
        let store = Store::open_in_memory().unwrap();
        let alice = store.create_user("alice", "hash").unwrap();
        assert!(matches!(
            store.create_user("alice", "other"),
            Err(ChatError::Conflict(_))
        ));
        let (user, hash) = store.find_credentials("alice").unwrap().unwrap();
        assert_eq!(user, alice);
        assert_eq!(hash, "hash");
        assert!(store.find_credentials("bob").unwrap().is_none());
    }

    #[test]
    fn lists_users_in_id_order() {
        let store = Store::open_in_memory().unwrap();
        store.create_user("b", "x").unwrap();
        store.create_user("a", "x").unwrap();
        let names: Vec<_> = store
            .list_users()
            .unwrap()
            .into_iter()
            .map(|u| u.username)
            .collect();
        assert_eq!(names, vec!["b", "a"]);
        let conn = store.conn().unwrap();
        assert!(matches!(get_user(&conn, 99), Err(ChatError::NotFound("user"))));
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");
        {
            let store = Store::open(&path).unwrap();
            store.create_user("alice", "h").unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.list_users().unwrap().len(), 1);
    }
}
