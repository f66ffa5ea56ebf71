//! Conversation store
//!
//! Owns every conversation and message this client knows about. Messages are
//! kept ordered by `(timestamp, id)` with binary-search insertion and are
//! unique by id. Metadata, unread counts and message bodies are written
//! through to [`LocalStorage`]; write failures are logged and the in-memory
//! state stays authoritative.

use crate::error::{Error, Result};
use crate::models::*;
use crate::storage::LocalStorage;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of merging one message into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Id already present; nothing changed.
    Duplicate,
    /// A provisional entry with this id was swapped for the server copy.
    Replaced(String),
    /// Server sent a second message for an already acknowledged client id.
    Conflict,
}

#[derive(Debug, Clone)]
struct MessageLocation {
    conversation_id: String,
    key: MessageKey,
}

pub struct ConversationStore {
    current_user_id: String,
    conversations: HashMap<String, Conversation>,
    index: HashMap<String, MessageLocation>,
    /// client id -> server id of acknowledged sends
    acked: HashMap<String, String>,
    /// Conversation ids by `last_activity_at` descending.
    order: Vec<String>,
    hydrated: HashSet<String>,
    /// Ids removed by explicit delete; never re-inserted.
    deleted: HashSet<String>,
    storage: Option<Arc<LocalStorage>>,
}

impl ConversationStore {
    /// Store without persistence.
    pub fn new(current_user_id: &str) -> Self {
        Self {
            current_user_id: current_user_id.to_string(),
            conversations: HashMap::new(),
            index: HashMap::new(),
            acked: HashMap::new(),
            order: Vec::new(),
            hydrated: HashSet::new(),
            deleted: HashSet::new(),
            storage: None,
        }
    }

    /// Restore metadata and unread counts from disk. Message bodies are
    /// loaded later by [`hydrate`](Self::hydrate).
    pub fn open(storage: Arc<LocalStorage>, current_user_id: &str) -> Result<Self> {
        let mut store = Self::new(current_user_id);
        for conv in storage.get_conversations()? {
            store.conversations.insert(conv.id.clone(), conv);
        }
        store.storage = Some(storage);
        store.reorder();
        debug!(
            conversations = store.conversations.len(),
            total_unread = store.total_unread(),
            "Conversation store restored"
        );
        Ok(store)
    }

    pub fn current_user_id(&self) -> &str {
        &self.current_user_id
    }

    fn persist<F>(&self, what: &str, f: F)
    where
        F: FnOnce(&LocalStorage) -> Result<()>,
    {
        if let Some(storage) = &self.storage {
            if let Err(e) = f(storage) {
                let err = Error::Persistence(format!("{}: {}", what, e));
                warn!(error = %err, "Write-through failed, keeping in-memory state");
            }
        }
    }

    fn persist_conversation(&self, conversation_id: &str) {
        if let Some(conv) = self.conversations.get(conversation_id) {
            self.persist("conversation", |s| s.save_conversation(conv));
        }
    }

    fn reorder(&mut self) {
        let mut ids: Vec<(&String, Option<i64>)> = self
            .conversations
            .values()
            .map(|c| (&c.id, c.last_activity_at))
            .collect();
        ids.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        self.order = ids.into_iter().map(|(id, _)| id.clone()).collect();
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    /// Insert or update conversation metadata. Returns true if anything changed.
    pub fn upsert_conversation(&mut self, summary: &ConversationSummary) -> Result<bool> {
        summary.validate()?;

        let changed = match self.conversations.get_mut(&summary.id) {
            Some(conv) => conv.apply_summary(summary),
            None => {
                self.conversations
                    .insert(summary.id.clone(), Conversation::from_summary(summary));
                true
            }
        };

        if changed {
            self.persist_conversation(&summary.id);
            self.reorder();
        }
        Ok(changed)
    }

    pub fn get_conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    /// Conversations ordered by most recent activity.
    pub fn list_conversations(&self) -> Vec<&Conversation> {
        self.order
            .iter()
            .filter_map(|id| self.conversations.get(id))
            .collect()
    }

    fn ensure_conversation(&mut self, msg: &Message) {
        if self.conversations.contains_key(&msg.conversation_id) {
            return;
        }
        let mut conv = Conversation::new(&msg.conversation_id);
        conv.participant_ids.insert(msg.sender_id.clone());
        conv.participant_ids.insert(self.current_user_id.clone());
        self.conversations.insert(conv.id.clone(), conv);
    }

    // ========================================================================
    // Messages
    // ========================================================================

    pub fn message(&self, id: &str) -> Option<&Message> {
        let loc = self.index.get(id)?;
        let conv = self.conversations.get(&loc.conversation_id)?;
        conv.position_of(&loc.key).ok().map(|i| &conv.messages[i])
    }

    fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        let loc = self.index.get(id)?;
        let conv = self.conversations.get_mut(&loc.conversation_id)?;
        let pos = conv.position_of(&loc.key).ok()?;
        Some(&mut conv.messages[pos])
    }

    /// Idempotent by message id. A message whose client id names a local
    /// provisional entry replaces that entry instead of being appended.
    pub fn upsert_message(&mut self, msg: Message) -> UpsertOutcome {
        self.insert_message(msg, false)
    }

    /// Like [`upsert_message`](Self::upsert_message), for messages from a
    /// history page: anything at or before the read watermark comes in read.
    pub fn upsert_history_message(&mut self, msg: Message) -> UpsertOutcome {
        self.insert_message(msg, true)
    }

    fn insert_message(&mut self, mut msg: Message, apply_watermark: bool) -> UpsertOutcome {
        if self.index.contains_key(&msg.id) || self.deleted.contains(&msg.id) {
            debug!(message_id = %msg.id, "Duplicate message ignored");
            return UpsertOutcome::Duplicate;
        }

        if let Some(client_id) = msg.client_id.clone().filter(|c| *c != msg.id) {
            if self.deleted.contains(&client_id) {
                debug!(
                    message_id = %msg.id,
                    client_id = %client_id,
                    "Echo of a deleted message dropped"
                );
                self.deleted.insert(msg.id.clone());
                return UpsertOutcome::Duplicate;
            }
            if self.index.contains_key(&client_id) {
                return self.replace_provisional(&client_id, msg);
            }
            if let Some(server_id) = self.acked.get(&client_id) {
                let err = Error::MergeConflict {
                    message_id: msg.id.clone(),
                };
                warn!(
                    error = %err,
                    client_id = %client_id,
                    acked_as = %server_id,
                    "Client id already acknowledged, dropping"
                );
                return UpsertOutcome::Conflict;
            }
        }

        self.ensure_conversation(&msg);
        let me = self.current_user_id.clone();
        let Some(conv) = self.conversations.get_mut(&msg.conversation_id) else {
            return UpsertOutcome::Duplicate;
        };

        if apply_watermark && msg.is_unread_for(&me) {
            if let Some(watermark) = conv.last_read_at {
                if msg.timestamp <= watermark {
                    msg.read_at = Some(watermark);
                }
            }
        }

        let key = msg.key();
        let pos = match conv.position_of(&key) {
            Ok(_) => return UpsertOutcome::Duplicate,
            Err(pos) => pos,
        };
        if conv.last_activity_at.map_or(true, |t| msg.timestamp >= t) {
            conv.last_activity_at = Some(msg.timestamp);
        }
        if pos == conv.messages.len() {
            conv.last_message_preview = Some(msg.content.preview());
        }
        conv.messages.insert(pos, msg.clone());

        self.index.insert(
            msg.id.clone(),
            MessageLocation {
                conversation_id: msg.conversation_id.clone(),
                key,
            },
        );
        // Parent row first: messages reference it.
        self.persist_conversation(&msg.conversation_id);
        self.persist("message", |s| s.save_message(&msg));
        self.reorder();
        UpsertOutcome::Inserted
    }

    /// Apply a server acknowledgment to a provisional message.
    /// A repeated ack, or one that arrives after a live echo, is a no-op.
    pub fn acknowledge(&mut self, provisional_id: &str, mut msg: Message) -> UpsertOutcome {
        msg.client_id.get_or_insert_with(|| provisional_id.to_string());

        if self.index.contains_key(&msg.id) {
            if self.index.contains_key(provisional_id) {
                // Server copy arrived without a client id; drop the optimistic twin.
                self.remove_entry(provisional_id);
                self.acked.insert(provisional_id.to_string(), msg.id.clone());
                return UpsertOutcome::Replaced(provisional_id.to_string());
            }
            debug!(message_id = %msg.id, "Duplicate ack ignored");
            return UpsertOutcome::Duplicate;
        }

        if !self.index.contains_key(provisional_id) {
            debug!(provisional_id, "Ack for unknown provisional message ignored");
            return UpsertOutcome::Duplicate;
        }

        self.replace_provisional(provisional_id, msg)
    }

    fn replace_provisional(&mut self, provisional_id: &str, mut msg: Message) -> UpsertOutcome {
        let Some(loc) = self.index.remove(provisional_id) else {
            return UpsertOutcome::Duplicate;
        };
        let Some(conv) = self.conversations.get_mut(&loc.conversation_id) else {
            return UpsertOutcome::Duplicate;
        };
        let Ok(old_pos) = conv.position_of(&loc.key) else {
            return UpsertOutcome::Duplicate;
        };

        msg.delivery_state = DeliveryState::Sent;
        msg.conversation_id = loc.conversation_id.clone();
        let old = conv.messages.remove(old_pos);
        if msg.read_at.is_none() {
            msg.read_at = old.read_at;
        }

        // Same slot unless the server timestamp moved the message.
        let key = msg.key();
        let pos = match conv.position_of(&key) {
            Ok(pos) | Err(pos) => pos,
        };
        if pos != old_pos {
            debug!(
                message_id = %msg.id,
                from = old_pos,
                to = pos,
                "Acknowledged message repositioned"
            );
        }
        if conv.last_activity_at.map_or(true, |t| msg.timestamp >= t) {
            conv.last_activity_at = Some(msg.timestamp);
        }
        if pos == conv.messages.len() {
            conv.last_message_preview = Some(msg.content.preview());
        }
        conv.messages.insert(pos, msg.clone());

        self.index.insert(
            msg.id.clone(),
            MessageLocation {
                conversation_id: loc.conversation_id.clone(),
                key,
            },
        );
        self.acked.insert(provisional_id.to_string(), msg.id.clone());
        self.persist("acknowledged message", |s| {
            s.replace_message(provisional_id, &msg)
        });
        self.persist_conversation(&loc.conversation_id);
        self.reorder();
        UpsertOutcome::Replaced(provisional_id.to_string())
    }

    /// An ack arrived for a provisional message the user already deleted.
    /// Tombstones the server id so echoes and history never bring it back.
    /// Returns false if the provisional message was not deleted.
    pub fn tombstone_ack(&mut self, provisional_id: &str, server_id: &str) -> bool {
        if !self.deleted.contains(provisional_id) {
            return false;
        }
        self.deleted.insert(server_id.to_string());
        self.acked.insert(provisional_id.to_string(), server_id.to_string());
        true
    }

    /// Server id an optimistic message was acknowledged as, if any.
    pub fn acknowledged_id(&self, provisional_id: &str) -> Option<&str> {
        self.acked.get(provisional_id).map(String::as_str)
    }

    pub fn set_delivery_state(&mut self, message_id: &str, state: DeliveryState) -> bool {
        let Some(msg) = self.message_mut(message_id) else {
            return false;
        };
        if msg.delivery_state == state {
            return false;
        }
        msg.delivery_state = state;
        let msg = msg.clone();
        self.persist("delivery state", |s| s.save_message(&msg));
        true
    }

    fn remove_entry(&mut self, message_id: &str) -> Option<Message> {
        let loc = self.index.remove(message_id)?;
        let conv = self.conversations.get_mut(&loc.conversation_id)?;
        let pos = conv.position_of(&loc.key).ok()?;
        let removed = conv.messages.remove(pos);
        conv.last_message_preview = conv.messages.last().map(|m| m.content.preview());
        self.persist("message deletion", |s| s.delete_message(message_id));
        self.persist_conversation(&loc.conversation_id);
        Some(removed)
    }

    /// Terminal removal. Returns the removed message.
    pub fn delete_message(&mut self, message_id: &str) -> Option<Message> {
        let removed = self.remove_entry(message_id)?;
        self.deleted.insert(message_id.to_string());
        self.reorder();
        Some(removed)
    }

    /// Stamp every unread message from others. Returns how many were stamped.
    pub fn mark_messages_read(&mut self, conversation_id: &str, read_at: i64) -> usize {
        let me = self.current_user_id.clone();
        let Some(conv) = self.conversations.get_mut(conversation_id) else {
            return 0;
        };
        let mut stamped = 0;
        for msg in conv.messages.iter_mut().filter(|m| m.is_unread_for(&me)) {
            msg.read_at = Some(read_at);
            stamped += 1;
        }
        // Watermark in server time: the newest message we hold, not our clock.
        if let Some(newest) = conv.messages.last().map(|m| m.timestamp) {
            conv.last_read_at = Some(conv.last_read_at.map_or(newest, |t| t.max(newest)));
        }
        self.persist("read state", |s| s.mark_messages_read(conversation_id, read_at));
        self.persist_conversation(conversation_id);
        stamped
    }

    /// Move the read watermark forward to a server timestamp, e.g. from a
    /// receipt sent by another of our devices.
    pub fn advance_read_watermark(&mut self, conversation_id: &str, server_ts: i64) -> bool {
        let Some(conv) = self.conversations.get_mut(conversation_id) else {
            return false;
        };
        if conv.last_read_at.map_or(false, |t| t >= server_ts) {
            return false;
        }
        conv.last_read_at = Some(server_ts);
        self.persist_conversation(conversation_id);
        true
    }

    /// Messages from others in memory with no `read_at`.
    pub fn count_unread_messages(&self, conversation_id: &str) -> u32 {
        self.conversations.get(conversation_id).map_or(0, |conv| {
            conv.messages
                .iter()
                .filter(|m| m.is_unread_for(&self.current_user_id))
                .count() as u32
        })
    }

    /// Stamp a single message as read, e.g. one arriving in the open conversation.
    pub fn mark_message_read(&mut self, message_id: &str, read_at: i64) -> bool {
        let Some(msg) = self.message_mut(message_id) else {
            return false;
        };
        if msg.read_at.is_some() {
            return false;
        }
        msg.read_at = Some(read_at);
        let msg = msg.clone();
        self.persist("read state", |s| s.save_message(&msg));
        true
    }

    pub fn set_peer_read(&mut self, conversation_id: &str, read_at: i64) -> bool {
        let Some(conv) = self.conversations.get_mut(conversation_id) else {
            return false;
        };
        if conv.peer_read_at.map_or(false, |t| t >= read_at) {
            return false;
        }
        conv.peer_read_at = Some(read_at);
        self.persist_conversation(conversation_id);
        true
    }

    // ========================================================================
    // Unread index
    // ========================================================================

    pub fn unread_count(&self, conversation_id: &str) -> u32 {
        self.conversations
            .get(conversation_id)
            .map_or(0, |c| c.unread_count)
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations.values().map(|c| c.unread_count).sum()
    }

    /// Set a conversation's count. Returns true if it changed.
    pub fn set_unread(&mut self, conversation_id: &str, count: u32) -> bool {
        let Some(conv) = self.conversations.get_mut(conversation_id) else {
            return false;
        };
        if conv.unread_count == count {
            return false;
        }
        conv.unread_count = count;
        self.persist("unread count", |s| s.update_unread_count(conversation_id, count));
        true
    }

    pub fn unread_index(&self) -> HashMap<String, u32> {
        self.conversations
            .values()
            .map(|c| (c.id.clone(), c.unread_count))
            .collect()
    }

    // ========================================================================
    // Lazy loading
    // ========================================================================

    /// Pull cached message bodies for a conversation from disk, once.
    /// Messages left `pending` by a previous process come back as `failed`.
    pub fn hydrate(&mut self, conversation_id: &str, limit: i64) -> Vec<String> {
        if !self.hydrated.insert(conversation_id.to_string()) {
            return Vec::new();
        }
        let Some(storage) = self.storage.clone() else {
            return Vec::new();
        };
        let cached = match storage.get_messages(conversation_id, limit) {
            Ok(cached) => cached,
            Err(e) => {
                warn!(error = %e, conversation_id, "Failed to load cached messages");
                return Vec::new();
            }
        };

        let mut loaded = Vec::new();
        for mut msg in cached {
            if msg.delivery_state == DeliveryState::Pending {
                msg.delivery_state = DeliveryState::Failed;
            }
            let id = msg.id.clone();
            if self.upsert_message(msg) == UpsertOutcome::Inserted {
                loaded.push(id);
            }
        }
        loaded
    }
}
