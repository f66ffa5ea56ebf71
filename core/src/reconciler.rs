//! Message reconciler
//!
//! Normalizes REST history pages and live transport frames into store
//! mutations. Every path funnels through the store's idempotent upsert,
//! so the result is the same whichever order pages and live events arrive in.

use crate::error::Result;
use crate::models::*;
use crate::store::{ConversationStore, UpsertOutcome};
use crate::unread::{IncomingEffect, UnreadTracker};
use serde::Deserialize;
use tracing::{debug, warn};

pub const RECEIVE_MESSAGE: &str = "receive-message";
pub const MESSAGE_DELETED: &str = "message-deleted";
pub const READ_RECEIPT: &str = "read-receipt";

/// A live frame the reconciler understands.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    ReceiveMessage {
        conversation: Option<ConversationSummary>,
        new_message: Message,
    },
    MessageDeleted {
        conversation_id: String,
        message_id: String,
    },
    ReadReceipt {
        conversation_id: String,
        user_id: String,
        read_at: i64,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiveMessagePayload {
    // Kept loose: partial metadata must not cost us the message.
    #[serde(default)]
    conversation: Option<serde_json::Value>,
    new_message: Message,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDeletedPayload {
    #[serde(alias = "chatId")]
    conversation_id: String,
    message_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadReceiptPayload {
    #[serde(alias = "chatId")]
    conversation_id: String,
    user_id: String,
    #[serde(default)]
    read_at: Option<i64>,
}

impl LiveEvent {
    /// `Ok(None)` for event names this layer does not handle.
    pub fn parse(raw: &RawEvent) -> Result<Option<Self>> {
        let event = match raw.name.as_str() {
            RECEIVE_MESSAGE => {
                let p: ReceiveMessagePayload = serde_json::from_value(raw.payload.clone())?;
                let mut new_message = p.new_message;
                let conversation = p.conversation.and_then(|value| {
                    if new_message.conversation_id.is_empty() {
                        if let Some(id) = value.get("_id").or_else(|| value.get("id")) {
                            new_message.conversation_id = id.as_str().unwrap_or_default().to_string();
                        }
                    }
                    serde_json::from_value::<ConversationSummary>(value)
                        .map_err(|e| {
                            warn!(
                                error = %e,
                                message_id = %new_message.id,
                                "Ignoring unparseable conversation metadata"
                            )
                        })
                        .ok()
                });
                Self::ReceiveMessage {
                    conversation,
                    new_message,
                }
            }
            MESSAGE_DELETED => {
                let p: MessageDeletedPayload = serde_json::from_value(raw.payload.clone())?;
                Self::MessageDeleted {
                    conversation_id: p.conversation_id,
                    message_id: p.message_id,
                }
            }
            READ_RECEIPT => {
                let p: ReadReceiptPayload = serde_json::from_value(raw.payload.clone())?;
                Self::ReadReceipt {
                    conversation_id: p.conversation_id,
                    user_id: p.user_id,
                    read_at: p.read_at.unwrap_or_else(now_millis),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// Store changes produced by one reconcile step.
#[derive(Debug, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub updates: Vec<ChatUpdate>,
    /// Conversation that received a message while open and owes a read receipt.
    pub receipt_due: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MessageReconciler;

impl MessageReconciler {
    pub fn new() -> Self {
        Self
    }

    /// Merge a page of older messages. Pages may overlap each other or live
    /// messages and may arrive in any order. Messages at or before the read
    /// watermark come in read; the unread count is then recounted from the
    /// loaded messages.
    pub fn merge_history_page(
        &self,
        store: &mut ConversationStore,
        tracker: &UnreadTracker,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> Vec<ChatUpdate> {
        let mut updates = Vec::new();
        let total = messages.len();

        for mut msg in messages {
            if msg.conversation_id.is_empty() {
                msg.conversation_id = conversation_id.to_string();
            } else if msg.conversation_id != conversation_id {
                warn!(
                    message_id = %msg.id,
                    expected = conversation_id,
                    got = %msg.conversation_id,
                    "History message for another conversation dropped"
                );
                continue;
            }
            msg.delivery_state = DeliveryState::Sent;
            updates.extend(self.upsert(store, msg, true).0);
        }

        debug!(
            conversation_id,
            received = total,
            merged = updates.len(),
            "History page merged"
        );
        if store.get_conversation(conversation_id).is_some() {
            if let Some(count) = tracker.on_history_merged(store, conversation_id) {
                updates.push(ChatUpdate::UnreadChanged {
                    conversation_id: conversation_id.to_string(),
                    unread_count: count,
                    total_unread: store.total_unread(),
                });
            }
        }
        updates
    }

    /// Parse and apply one raw transport frame. Unknown or malformed frames
    /// are logged and dropped.
    pub fn apply_live_event(
        &self,
        store: &mut ConversationStore,
        tracker: &UnreadTracker,
        raw: &RawEvent,
    ) -> ReconcileOutcome {
        match LiveEvent::parse(raw) {
            Ok(Some(event)) => self.apply(store, tracker, event),
            Ok(None) => {
                warn!(event = %raw.name, "Unknown live event dropped");
                ReconcileOutcome::default()
            }
            Err(e) => {
                warn!(event = %raw.name, error = %e, "Malformed live event dropped");
                ReconcileOutcome::default()
            }
        }
    }

    pub fn apply(
        &self,
        store: &mut ConversationStore,
        tracker: &UnreadTracker,
        event: LiveEvent,
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        match event {
            LiveEvent::ReceiveMessage {
                conversation,
                mut new_message,
            } => {
                if let Some(summary) = conversation {
                    match store.upsert_conversation(&summary) {
                        Ok(true) => outcome.updates.push(ChatUpdate::ConversationUpdated {
                            conversation_id: summary.id.clone(),
                        }),
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, "Ignoring invalid conversation metadata"),
                    }
                    if new_message.conversation_id.is_empty() {
                        new_message.conversation_id = summary.id;
                    }
                }
                if new_message.conversation_id.is_empty() {
                    warn!(message_id = %new_message.id, "Live message without conversation dropped");
                    return outcome;
                }
                new_message.delivery_state = DeliveryState::Sent;

                let conversation_id = new_message.conversation_id.clone();
                let message_id = new_message.id.clone();
                let (updates, inserted) = self.upsert(store, new_message, false);
                outcome.updates.extend(updates);

                if inserted {
                    match tracker.on_incoming(store, &message_id) {
                        IncomingEffect::Incremented(count) => {
                            outcome.updates.push(ChatUpdate::UnreadChanged {
                                conversation_id: conversation_id.clone(),
                                unread_count: count,
                                total_unread: store.total_unread(),
                            });
                        }
                        IncomingEffect::ReadInPlace => {
                            outcome.receipt_due = Some(conversation_id);
                        }
                        IncomingEffect::Unchanged => {}
                    }
                }
            }

            LiveEvent::MessageDeleted {
                conversation_id,
                message_id,
            } => {
                let Some(removed) = store.delete_message(&message_id) else {
                    debug!(message_id = %message_id, "Delete for unknown message ignored");
                    return outcome;
                };
                if removed.conversation_id != conversation_id {
                    warn!(
                        message_id = %message_id,
                        claimed = %conversation_id,
                        actual = %removed.conversation_id,
                        "Delete event named the wrong conversation"
                    );
                }
                let was_unread = removed.is_unread_for(store.current_user_id());
                if tracker.on_removed(store, was_unread, &removed.conversation_id) {
                    outcome.updates.push(ChatUpdate::UnreadChanged {
                        conversation_id: removed.conversation_id.clone(),
                        unread_count: store.unread_count(&removed.conversation_id),
                        total_unread: store.total_unread(),
                    });
                }
                outcome.updates.push(ChatUpdate::MessageDeleted {
                    conversation_id: removed.conversation_id,
                    message_id,
                });
            }

            LiveEvent::ReadReceipt {
                conversation_id,
                user_id,
                read_at,
            } => {
                if user_id == store.current_user_id() {
                    // Read on another of our devices
                    store.mark_messages_read(&conversation_id, read_at);
                    store.advance_read_watermark(&conversation_id, read_at);
                    if store.set_unread(&conversation_id, 0) {
                        outcome.updates.push(ChatUpdate::UnreadChanged {
                            conversation_id,
                            unread_count: 0,
                            total_unread: store.total_unread(),
                        });
                    }
                } else if store.set_peer_read(&conversation_id, read_at) {
                    outcome.updates.push(ChatUpdate::PeerRead {
                        conversation_id,
                        user_id,
                        read_at,
                    });
                }
            }
        }

        outcome
    }

    fn upsert(
        &self,
        store: &mut ConversationStore,
        msg: Message,
        from_history: bool,
    ) -> (Vec<ChatUpdate>, bool) {
        let conversation_id = msg.conversation_id.clone();
        let message_id = msg.id.clone();

        let outcome = if from_history {
            store.upsert_history_message(msg)
        } else {
            store.upsert_message(msg)
        };
        match outcome {
            UpsertOutcome::Inserted => {
                let update = store
                    .message(&message_id)
                    .cloned()
                    .map(|message| ChatUpdate::MessageUpserted {
                        conversation_id,
                        message,
                    });
                (update.into_iter().collect(), true)
            }
            UpsertOutcome::Replaced(provisional_id) => {
                let update = store
                    .message(&message_id)
                    .cloned()
                    .map(|message| ChatUpdate::MessageReplaced {
                        conversation_id,
                        provisional_id,
                        message,
                    });
                (update.into_iter().collect(), false)
            }
            UpsertOutcome::Duplicate | UpsertOutcome::Conflict => (Vec::new(), false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn wire_message(id: &str, ts: i64, sender: &str) -> serde_json::Value {
        json!({
            "_id": id,
            "chatId": "c1",
            "senderId": sender,
            "content": format!("text {}", id),
            "timestamp": ts
        })
    }

    fn receive(id: &str, ts: i64) -> RawEvent {
        RawEvent::new(
            RECEIVE_MESSAGE,
            json!({
                "conversation": {"_id": "c1", "members": ["me", "u2"]},
                "newMessage": wire_message(id, ts, "u2")
            }),
        )
    }

    fn history(entries: &[(&str, i64)]) -> Vec<Message> {
        entries
            .iter()
            .map(|(id, ts)| serde_json::from_value(wire_message(id, *ts, "u2")).unwrap())
            .collect()
    }

    fn order(store: &ConversationStore) -> Vec<String> {
        store
            .get_conversation("c1")
            .unwrap()
            .messages
            .iter()
            .map(|m| m.id.clone())
            .collect()
    }

    #[test]
    fn test_receive_increments_when_inactive() {
        let mut store = ConversationStore::new("me");
        let tracker = UnreadTracker::new();
        let reconciler = MessageReconciler::new();

        let outcome = reconciler.apply_live_event(&mut store, &tracker, &receive("m1", 10));
        assert_eq!(store.unread_count("c1"), 1);
        assert!(outcome.receipt_due.is_none());
        assert!(outcome.updates.iter().any(|u| matches!(
            u,
            ChatUpdate::UnreadChanged { unread_count: 1, total_unread: 1, .. }
        )));
    }

    #[test]
    fn test_receive_while_active_keeps_zero() {
        let mut store = ConversationStore::new("me");
        let mut tracker = UnreadTracker::new();
        tracker.set_active("c1");
        let reconciler = MessageReconciler::new();

        let outcome = reconciler.apply_live_event(&mut store, &tracker, &receive("m1", 10));
        assert_eq!(store.unread_count("c1"), 0);
        assert_eq!(outcome.receipt_due.as_deref(), Some("c1"));
    }

    #[test]
    fn test_duplicate_live_delivery_counts_once() {
        let mut store = ConversationStore::new("me");
        let tracker = UnreadTracker::new();
        let reconciler = MessageReconciler::new();

        reconciler.apply_live_event(&mut store, &tracker, &receive("m1", 10));
        let second = reconciler.apply_live_event(&mut store, &tracker, &receive("m1", 10));
        assert!(second.updates.is_empty());
        assert_eq!(store.unread_count("c1"), 1);
        assert_eq!(order(&store), vec!["m1"]);
    }

    #[test]
    fn test_history_overlapping_live_no_duplicates() {
        let mut store = ConversationStore::new("me");
        let tracker = UnreadTracker::new();
        let reconciler = MessageReconciler::new();

        reconciler.apply_live_event(&mut store, &tracker, &receive("m3", 30));
        reconciler.merge_history_page(&mut store, &tracker, "c1", history(&[("m2", 20), ("m3", 30)]));
        reconciler.merge_history_page(&mut store, &tracker, "c1", history(&[("m1", 10), ("m2", 20)]));

        assert_eq!(order(&store), vec!["m1", "m2", "m3"]);
        // Once history is in, the count matches the unread messages held
        assert_eq!(store.unread_count("c1"), 3);
    }

    #[test]
    fn test_live_echo_replaces_pending_in_place() {
        let mut store = ConversationStore::new("me");
        let tracker = UnreadTracker::new();
        let reconciler = MessageReconciler::new();

        reconciler.merge_history_page(&mut store, &tracker, "c1", history(&[("m1", 10), ("m3", 30)]));
        let mut pending = Message::pending("c1", "me", MessageContent::text("mine"));
        pending.timestamp = 20;
        let provisional = pending.id.clone();
        store.upsert_message(pending);

        let echo = RawEvent::new(
            RECEIVE_MESSAGE,
            json!({
                "newMessage": {
                    "_id": "m2",
                    "clientId": provisional,
                    "chatId": "c1",
                    "senderId": "me",
                    "content": "mine",
                    "timestamp": 20
                }
            }),
        );
        let outcome = reconciler.apply_live_event(&mut store, &tracker, &echo);

        assert_eq!(order(&store), vec!["m1", "m2", "m3"]);
        assert!(matches!(
            outcome.updates.as_slice(),
            [ChatUpdate::MessageReplaced { provisional_id, .. }] if *provisional_id == provisional
        ));
        assert_eq!(store.message("m2").unwrap().delivery_state, DeliveryState::Sent);
    }

    #[test]
    fn test_delete_event_adjusts_unread() {
        let mut store = ConversationStore::new("me");
        let tracker = UnreadTracker::new();
        let reconciler = MessageReconciler::new();

        reconciler.apply_live_event(&mut store, &tracker, &receive("m1", 10));
        reconciler.apply_live_event(&mut store, &tracker, &receive("m2", 20));
        assert_eq!(store.unread_count("c1"), 2);

        let delete = RawEvent::new(
            MESSAGE_DELETED,
            json!({"conversationId": "c1", "messageId": "m2"}),
        );
        let outcome = reconciler.apply_live_event(&mut store, &tracker, &delete);
        assert_eq!(store.unread_count("c1"), 1);
        assert_eq!(order(&store), vec!["m1"]);
        assert!(outcome
            .updates
            .iter()
            .any(|u| matches!(u, ChatUpdate::MessageDeleted { message_id, .. } if message_id == "m2")));
    }

    #[test]
    fn test_read_receipts() {
        let mut store = ConversationStore::new("me");
        let tracker = UnreadTracker::new();
        let reconciler = MessageReconciler::new();
        reconciler.apply_live_event(&mut store, &tracker, &receive("m1", 10));

        let peer = RawEvent::new(
            READ_RECEIPT,
            json!({"conversationId": "c1", "userId": "u2", "readAt": 500}),
        );
        let outcome = reconciler.apply_live_event(&mut store, &tracker, &peer);
        assert_eq!(store.get_conversation("c1").unwrap().peer_read_at, Some(500));
        assert_eq!(outcome.updates.len(), 1);
        assert_eq!(store.unread_count("c1"), 1);

        let own_device = RawEvent::new(
            READ_RECEIPT,
            json!({"conversationId": "c1", "userId": "me", "readAt": 600}),
        );
        reconciler.apply_live_event(&mut store, &tracker, &own_device);
        assert_eq!(store.unread_count("c1"), 0);
    }

    #[test]
    fn test_unknown_and_malformed_events_dropped() {
        let mut store = ConversationStore::new("me");
        let tracker = UnreadTracker::new();
        let reconciler = MessageReconciler::new();

        let unknown = RawEvent::new("typing", json!({"userId": "u2"}));
        assert_eq!(
            reconciler.apply_live_event(&mut store, &tracker, &unknown),
            ReconcileOutcome::default()
        );

        let malformed = RawEvent::new(RECEIVE_MESSAGE, json!({"newMessage": 42}));
        assert_eq!(
            reconciler.apply_live_event(&mut store, &tracker, &malformed),
            ReconcileOutcome::default()
        );
        assert!(store.list_conversations().is_empty());
    }

    #[test]
    fn test_history_for_closed_conversation_counts_unread() {
        let mut store = ConversationStore::new("me");
        let tracker = UnreadTracker::new();
        let reconciler = MessageReconciler::new();
        reconciler.apply_live_event(&mut store, &tracker, &receive("m0", 1_700_000_000_000));

        let mut page = history(&[("m1", 1_700_000_001_000), ("m2", 1_700_000_002_000)]);
        page.push(
            serde_json::from_value(wire_message("m3", 1_700_000_003_000, "me")).unwrap(),
        );
        let updates = reconciler.merge_history_page(&mut store, &tracker, "c1", page);

        assert_eq!(store.unread_count("c1"), 3);
        assert_eq!(store.count_unread_messages("c1"), 3);
        assert!(updates.iter().any(|u| matches!(
            u,
            ChatUpdate::UnreadChanged { unread_count: 3, .. }
        )));
    }

    #[test]
    fn test_history_for_open_conversation_arrives_read() {
        let mut store = ConversationStore::new("me");
        let mut tracker = UnreadTracker::new();
        let reconciler = MessageReconciler::new();
        tracker.set_active("c1");

        reconciler.merge_history_page(
            &mut store,
            &tracker,
            "c1",
            history(&[("m1", 1_700_000_001_000), ("m2", 1_700_000_002_000)]),
        );
        assert_eq!(store.unread_count("c1"), 0);
        assert_eq!(store.count_unread_messages("c1"), 0);
    }

    #[test]
    fn test_live_message_counts_after_read_with_lagging_server_clock() {
        let mut store = ConversationStore::new("me");
        let mut tracker = UnreadTracker::new();
        let reconciler = MessageReconciler::new();
        let now = now_millis();

        tracker.set_active("c1");
        reconciler.apply_live_event(&mut store, &tracker, &receive("m1", now - 5_000));
        tracker.mark_read(&mut store, "c1");
        tracker.clear_active("c1");

        // Server clock two seconds behind ours
        reconciler.apply_live_event(&mut store, &tracker, &receive("m2", now - 2_000));
        assert_eq!(store.unread_count("c1"), 1);
        assert!(store.message("m2").unwrap().read_at.is_none());
    }

    #[test]
    fn test_partial_conversation_metadata_keeps_message() {
        let mut store = ConversationStore::new("me");
        let tracker = UnreadTracker::new();
        let reconciler = MessageReconciler::new();

        let event = RawEvent::new(
            RECEIVE_MESSAGE,
            json!({
                "conversation": {"_id": "c1"},
                "newMessage": {"_id": "m1", "senderId": "u2", "content": "hi",
                               "timestamp": 1_700_000_000_000i64}
            }),
        );
        reconciler.apply_live_event(&mut store, &tracker, &event);

        assert_eq!(order(&store), vec!["m1"]);
        assert_eq!(store.unread_count("c1"), 1);
    }

    #[test]
    fn test_own_device_receipt_marks_later_history_read() {
        let mut store = ConversationStore::new("me");
        let tracker = UnreadTracker::new();
        let reconciler = MessageReconciler::new();
        reconciler.apply_live_event(&mut store, &tracker, &receive("m5", 1_700_000_005_000));

        let own_device = RawEvent::new(
            READ_RECEIPT,
            json!({"conversationId": "c1", "userId": "me", "readAt": 1_700_000_009_000i64}),
        );
        reconciler.apply_live_event(&mut store, &tracker, &own_device);
        reconciler.merge_history_page(
            &mut store,
            &tracker,
            "c1",
            history(&[("m1", 1_700_000_001_000), ("m2", 1_700_000_002_000)]),
        );

        assert_eq!(store.unread_count("c1"), 0);
        assert!(store.message("m1").unwrap().read_at.is_some());
    }

    proptest! {
        #[test]
        fn prop_interleaving_yields_sorted_order(
            stamps in prop::collection::vec(0i64..8, 1..40),
            live_mask in prop::collection::vec(any::<bool>(), 40),
            page_size in 1usize..6,
        ) {
            let mut store = ConversationStore::new("me");
            let tracker = UnreadTracker::new();
            let reconciler = MessageReconciler::new();

            let all: Vec<(String, i64)> = stamps
                .iter()
                .enumerate()
                .map(|(i, ts)| (format!("id{:02}", (i * 7) % 40), *ts))
                .collect();

            let mut page = Vec::new();
            for (i, (id, ts)) in all.iter().enumerate() {
                if live_mask[i] {
                    reconciler.apply_live_event(&mut store, &tracker, &receive(id, *ts));
                } else {
                    page.push((id.as_str(), *ts));
                    if page.len() == page_size {
                        reconciler.merge_history_page(&mut store, &tracker, "c1", history(&page));
                        page.clear();
                    }
                }
            }
            if !page.is_empty() {
                reconciler.merge_history_page(&mut store, &tracker, "c1", history(&page));
            }
            // Replay everything once more as a single page
            let replay: Vec<(&str, i64)> = all.iter().map(|(id, ts)| (id.as_str(), *ts)).collect();
            reconciler.merge_history_page(&mut store, &tracker, "c1", history(&replay));

            let conv = store.get_conversation("c1").unwrap();
            let mut expected: Vec<MessageKey> = all
                .iter()
                .map(|(id, ts)| MessageKey::new(*ts, id))
                .collect();
            expected.sort();
            expected.dedup();
            let actual: Vec<MessageKey> = conv.messages.iter().map(|m| m.key()).collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
