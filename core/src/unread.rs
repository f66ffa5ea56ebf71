//! Unread tracking
//!
//! Per conversation the count moves through a two-state machine:
//!
//! ```text
//!   Seen ──incoming (not active)──▶ Unseen(1) ──incoming──▶ Unseen(n + 1)
//!    ▲                                   │
//!    └───────────── mark_read ───────────┘
//! ```
//!
//! Counts live in the [`ConversationStore`] so they are persisted by the
//! single writer; this type only decides how they move.

use crate::models::{now_millis, OutboundEvent};
use crate::store::ConversationStore;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadState {
    Seen,
    Unseen(u32),
}

impl UnreadState {
    pub fn from_count(count: u32) -> Self {
        if count == 0 {
            Self::Seen
        } else {
            Self::Unseen(count)
        }
    }

    pub fn count(&self) -> u32 {
        match self {
            Self::Seen => 0,
            Self::Unseen(n) => *n,
        }
    }
}

/// What an incoming message did to the unread state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingEffect {
    /// Own message, already read, or unknown id.
    Unchanged,
    /// Conversation is open: stamped read, a receipt is owed.
    ReadInPlace,
    Incremented(u32),
}

#[derive(Debug, Default)]
pub struct UnreadTracker {
    active: Option<String>,
}

impl UnreadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn set_active(&mut self, conversation_id: &str) {
        self.active = Some(conversation_id.to_string());
    }

    /// Clears the flag only if `conversation_id` is the active one.
    pub fn clear_active(&mut self, conversation_id: &str) -> bool {
        if self.active.as_deref() == Some(conversation_id) {
            self.active = None;
            true
        } else {
            false
        }
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.active.as_deref() == Some(conversation_id)
    }

    pub fn state(&self, store: &ConversationStore, conversation_id: &str) -> UnreadState {
        UnreadState::from_count(store.unread_count(conversation_id))
    }

    pub fn get_unread_count(&self, store: &ConversationStore, conversation_id: &str) -> u32 {
        store.unread_count(conversation_id)
    }

    pub fn get_total_unread(&self, store: &ConversationStore) -> u32 {
        store.total_unread()
    }

    /// Account for a message that was just inserted into the store.
    pub fn on_incoming(&self, store: &mut ConversationStore, message_id: &str) -> IncomingEffect {
        let Some(msg) = store.message(message_id) else {
            return IncomingEffect::Unchanged;
        };
        if !msg.is_unread_for(store.current_user_id()) {
            return IncomingEffect::Unchanged;
        }
        let conversation_id = msg.conversation_id.clone();

        if self.is_active(&conversation_id) {
            store.mark_message_read(message_id, now_millis());
            return IncomingEffect::ReadInPlace;
        }

        let count = store.unread_count(&conversation_id) + 1;
        store.set_unread(&conversation_id, count);
        debug!(conversation_id = %conversation_id, unread = count, "Unread incremented");
        IncomingEffect::Incremented(count)
    }

    /// Account for a message removed from the store.
    pub fn on_removed(
        &self,
        store: &mut ConversationStore,
        removed_was_unread: bool,
        conversation_id: &str,
    ) -> bool {
        if !removed_was_unread {
            return false;
        }
        let count = store.unread_count(conversation_id).saturating_sub(1);
        store.set_unread(conversation_id, count)
    }

    /// Recount after a history page is merged. The persisted count stands in
    /// for messages not loaded yet; once a page is in, the loaded messages
    /// decide. History shown in the open conversation is read on arrival.
    /// Returns the new count if it changed.
    pub fn on_history_merged(
        &self,
        store: &mut ConversationStore,
        conversation_id: &str,
    ) -> Option<u32> {
        if self.is_active(conversation_id) {
            store.mark_messages_read(conversation_id, now_millis());
        }
        let count = store.count_unread_messages(conversation_id);
        if !store.set_unread(conversation_id, count) {
            return None;
        }
        debug!(conversation_id, unread = count, "Unread recounted from history");
        Some(count)
    }

    /// Stamp everything read, zero and persist the count, and return the
    /// receipt to emit. Local state stays read even if the receipt is lost.
    pub fn mark_read(&self, store: &mut ConversationStore, conversation_id: &str) -> OutboundEvent {
        let stamped = store.mark_messages_read(conversation_id, now_millis());
        store.set_unread(conversation_id, 0);
        debug!(conversation_id, stamped, "Conversation marked read");
        self.receipt(store, conversation_id)
    }

    pub fn receipt(&self, store: &ConversationStore, conversation_id: &str) -> OutboundEvent {
        OutboundEvent::MarkAsRead {
            conversation_id: conversation_id.to_string(),
            user_id: store.current_user_id().to_string(),
        }
    }
}
