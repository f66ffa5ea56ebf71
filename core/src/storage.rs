//! Local storage using SQLite
//!
//! Holds conversation metadata, the unread index and cached message bodies.
//! Only the conversation store writes here.

use crate::error::Result;
use crate::models::*;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::info;

/// Settings key holding the account the cached state belongs to.
pub const CURRENT_USER_KEY: &str = "current_user_id";

pub struct LocalStorage {
    conn: Mutex<Connection>,
}

impl LocalStorage {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("alumni-chat.db");
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    /// Open the database for `user_id`. Cached state left by a different
    /// account is wiped first.
    pub fn open_for_user(data_dir: &Path, user_id: &str) -> Result<Self> {
        let storage = Self::new(data_dir)?;
        if let Some(previous) = storage.get_setting(CURRENT_USER_KEY) {
            if previous != user_id {
                info!(previous = %previous, user_id, "Account changed, clearing cached chat state");
                storage.clear_all()?;
            }
        }
        storage.save_setting(CURRENT_USER_KEY, user_id)?;
        Ok(storage)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                participant_ids TEXT NOT NULL,
                is_group INTEGER NOT NULL DEFAULT 0,
                name TEXT,
                last_activity_at INTEGER,
                last_message_preview TEXT,
                unread_count INTEGER NOT NULL DEFAULT 0,
                last_read_at INTEGER,
                peer_read_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                client_id TEXT,
                conversation_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                content_json TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                read_at INTEGER,
                delivery_state TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
            CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
            "#,
        )?;

        Ok(())
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn save_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Option<String> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .ok()
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    /// Upsert in place; the row is never deleted, so cached messages keep
    /// their parent.
    pub fn save_conversation(&self, conv: &Conversation) -> Result<()> {
        let participants = serde_json::to_string(&conv.participant_ids)?;
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO conversations
               (id, participant_ids, is_group, name, last_activity_at, last_message_preview,
                unread_count, last_read_at, peer_read_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
               ON CONFLICT(id) DO UPDATE SET
                participant_ids = excluded.participant_ids,
                is_group = excluded.is_group,
                name = excluded.name,
                last_activity_at = excluded.last_activity_at,
                last_message_preview = excluded.last_message_preview,
                unread_count = excluded.unread_count,
                last_read_at = excluded.last_read_at,
                peer_read_at = excluded.peer_read_at"#,
            params![
                conv.id,
                participants,
                conv.is_group as i32,
                conv.name,
                conv.last_activity_at,
                conv.last_message_preview,
                conv.unread_count,
                conv.last_read_at,
                conv.peer_read_at,
            ],
        )?;
        Ok(())
    }

    /// Conversation metadata only; `messages` is left empty.
    pub fn get_conversations(&self) -> Result<Vec<Conversation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"SELECT id, participant_ids, is_group, name, last_activity_at, last_message_preview,
                      unread_count, last_read_at, peer_read_at
               FROM conversations
               ORDER BY last_activity_at DESC"#,
        )?;

        let rows = stmt.query_map([], |row| {
            let participants: String = row.get(1)?;
            Ok(Conversation {
                id: row.get(0)?,
                participant_ids: serde_json::from_str::<BTreeSet<String>>(&participants)
                    .unwrap_or_default(),
                is_group: row.get::<_, i32>(2)? != 0,
                name: row.get(3)?,
                messages: Vec::new(),
                last_activity_at: row.get(4)?,
                last_message_preview: row.get(5)?,
                unread_count: row.get(6)?,
                last_read_at: row.get(7)?,
                peer_read_at: row.get(8)?,
            })
        })?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }

        Ok(conversations)
    }

    pub fn update_unread_count(&self, conversation_id: &str, count: u32) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE conversations SET unread_count = ?1 WHERE id = ?2",
            params![count, conversation_id],
        )?;
        Ok(())
    }

    // ========================================================================
    // Messages
    // ========================================================================

    pub fn save_message(&self, msg: &Message) -> Result<()> {
        let content_json = serde_json::to_string(&msg.content)?;
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT OR REPLACE INTO messages
               (message_id, client_id, conversation_id, sender_id, content_json, timestamp,
                read_at, delivery_state)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                msg.id,
                msg.client_id,
                msg.conversation_id,
                msg.sender_id,
                content_json,
                msg.timestamp,
                msg.read_at,
                msg.delivery_state.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Swap a provisional row for its acknowledged server copy.
    pub fn replace_message(&self, old_id: &str, msg: &Message) -> Result<()> {
        let content_json = serde_json::to_string(&msg.content)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM messages WHERE message_id = ?1", params![old_id])?;
        tx.execute(
            r#"INSERT OR REPLACE INTO messages
               (message_id, client_id, conversation_id, sender_id, content_json, timestamp,
                read_at, delivery_state)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                msg.id,
                msg.client_id,
                msg.conversation_id,
                msg.sender_id,
                content_json,
                msg.timestamp,
                msg.read_at,
                msg.delivery_state.as_str(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Newest `limit` messages of a conversation, oldest first.
    pub fn get_messages(&self, conversation_id: &str, limit: i64) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"SELECT message_id, client_id, conversation_id, sender_id, content_json,
                      timestamp, read_at, delivery_state
               FROM messages
               WHERE conversation_id = ?1
               ORDER BY timestamp DESC
               LIMIT ?2"#,
        )?;

        let rows = stmt.query_map(params![conversation_id, limit], message_from_row)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse(); // Oldest first

        Ok(messages)
    }

    pub fn mark_messages_read(&self, conversation_id: &str, read_at: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE messages SET read_at = ?1 WHERE conversation_id = ?2 AND read_at IS NULL",
            params![read_at, conversation_id],
        )?;
        Ok(())
    }

    pub fn delete_message(&self, message_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM messages WHERE message_id = ?1", params![message_id])?;
        Ok(())
    }

    // ========================================================================
    // Storage management
    // ========================================================================

    pub fn clear_all(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            DELETE FROM messages;
            DELETE FROM conversations;
            DELETE FROM settings;
            "#,
        )?;
        Ok(())
    }
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let content_json: String = row.get(4)?;
    let state: String = row.get(7)?;
    let content = serde_json::from_str(&content_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Message {
        id: row.get(0)?,
        client_id: row.get(1)?,
        conversation_id: row.get(2)?,
        sender_id: row.get(3)?,
        content,
        timestamp: row.get(5)?,
        read_at: row.get(6)?,
        delivery_state: DeliveryState::parse(&state),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(id: &str, unread: u32) -> Conversation {
        let mut conv = Conversation::new(id);
        conv.participant_ids = ["me".to_string(), "u2".to_string()].into_iter().collect();
        conv.unread_count = unread;
        conv.last_activity_at = Some(1_000);
        conv
    }

    #[test]
    fn test_unread_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = LocalStorage::new(dir.path()).unwrap();
            storage.save_conversation(&conversation("c1", 3)).unwrap();
            storage.save_conversation(&conversation("c2", 0)).unwrap();
        }

        let storage = LocalStorage::new(dir.path()).unwrap();
        storage.update_unread_count("c2", 1).unwrap();
        let mut convs = storage.get_conversations().unwrap();
        convs.sort_by(|a, b| a.id.cmp(&b.id));
        let counts: Vec<(&str, u32)> = convs.iter().map(|c| (c.id.as_str(), c.unread_count)).collect();
        assert_eq!(counts, vec![("c1", 3), ("c2", 1)]);
        assert!(convs.iter().all(|c| c.participant_ids.len() == 2));
    }

    #[test]
    fn test_replace_provisional_message() {
        let storage = LocalStorage::in_memory().unwrap();
        storage.save_conversation(&conversation("c1", 0)).unwrap();

        let pending = Message::pending("c1", "me", MessageContent::text("hello"));
        storage.save_message(&pending).unwrap();

        let mut acked = pending.clone();
        acked.id = "srv-1".to_string();
        acked.delivery_state = DeliveryState::Sent;
        storage.replace_message(&pending.id, &acked).unwrap();

        let stored = storage.get_messages("c1", 10).unwrap();
        assert_eq!(stored.len(), 1);
        let stored = &stored[0];
        assert_eq!(stored.id, "srv-1");
        assert_eq!(stored.content, MessageContent::text("hello"));
        assert_eq!(stored.delivery_state, DeliveryState::Sent);
    }

    #[test]
    fn test_get_messages_oldest_first() {
        let storage = LocalStorage::in_memory().unwrap();
        storage.save_conversation(&conversation("c1", 0)).unwrap();
        for (i, ts) in [1_700_000_000_300i64, 1_700_000_000_100, 1_700_000_000_200].iter().enumerate() {
            let mut msg = Message::pending("c1", "u2", MessageContent::text(format!("m{}", i)));
            msg.id = format!("id{}", i);
            msg.timestamp = *ts;
            msg.delivery_state = DeliveryState::Sent;
            storage.save_message(&msg).unwrap();
        }

        let messages = storage.get_messages("c1", 2).unwrap();
        let stamps: Vec<i64> = messages.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, vec![1_700_000_000_200, 1_700_000_000_300]);
    }

    #[test]
    fn test_account_switch_clears_cache() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = LocalStorage::open_for_user(dir.path(), "u1").unwrap();
            storage.save_conversation(&conversation("c1", 2)).unwrap();
        }
        {
            let storage = LocalStorage::open_for_user(dir.path(), "u1").unwrap();
            assert_eq!(storage.get_conversations().unwrap().len(), 1);
        }
        let storage = LocalStorage::open_for_user(dir.path(), "u2").unwrap();
        assert!(storage.get_conversations().unwrap().is_empty());
        assert_eq!(storage.get_setting(CURRENT_USER_KEY).as_deref(), Some("u2"));
    }

    #[test]
    fn test_settings() {
        let storage = LocalStorage::in_memory().unwrap();
        assert!(storage.get_setting("current_user_id").is_none());
        storage.save_setting("current_user_id", "u1").unwrap();
        assert_eq!(storage.get_setting("current_user_id").as_deref(), Some("u1"));
        storage.save_setting("current_user_id", "u2").unwrap();
        assert_eq!(storage.get_setting("current_user_id").as_deref(), Some("u2"));
        storage.clear_all().unwrap();
        assert!(storage.get_setting("current_user_id").is_none());
    }
}
