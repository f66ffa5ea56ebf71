//! Chat session
//!
//! The facade screens talk to. It owns the conversation store behind a single
//! lock, feeds transport frames through the reconciler, runs the optimistic
//! send pipeline and fans [`ChatUpdate`]s out to subscribers.
//!
//! Store mutations are synchronous and finish before the lock is released;
//! listeners are always called afterwards, outside the lock.

use crate::config::{ClientConfig, SyncConfig};
use crate::error::{Error, Result, TransportError};
use crate::models::*;
use crate::network::{ApiClient, ChatApi, OutgoingMessage};
use crate::reconciler::MessageReconciler;
use crate::storage::LocalStorage;
use crate::store::{ConversationStore, UpsertOutcome};
use crate::transport::{ConnectionManager, Transport, TransportEvent};
use crate::unread::UnreadTracker;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type ListenerId = u64;

/// Subscriber callback. Errors are logged and do not affect other listeners.
pub type Listener = Arc<dyn Fn(&ChatUpdate) -> anyhow::Result<()> + Send + Sync>;

/// Which updates a subscriber wants. Session-wide updates (connection state,
/// auth rejection) reach every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateFilter {
    All,
    Conversations(HashSet<String>),
}

impl UpdateFilter {
    pub fn conversation(id: &str) -> Self {
        Self::Conversations(HashSet::from([id.to_string()]))
    }

    pub fn matches(&self, update: &ChatUpdate) -> bool {
        match (self, update.conversation_id()) {
            (Self::All, _) | (_, None) => true,
            (Self::Conversations(ids), Some(id)) => ids.contains(id),
        }
    }
}

/// Handle to an optimistic send. The message is already visible in the store
/// as `pending`; awaiting [`delivered`](Self::delivered) yields the
/// acknowledged copy.
pub struct PendingSend {
    message_id: String,
    handle: JoinHandle<Result<Message>>,
}

impl PendingSend {
    /// Provisional id of the optimistic entry.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub async fn delivered(self) -> Result<Message> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::SendFailed {
                message_id: self.message_id,
                reason: e.to_string(),
            }),
        }
    }
}

struct SessionState {
    store: ConversationStore,
    tracker: UnreadTracker,
    reconciler: MessageReconciler,
    /// History cursor per conversation. `None` once the oldest page is in.
    cursors: HashMap<String, Option<String>>,
    receipt_tasks: HashMap<String, JoinHandle<()>>,
    /// Provisional ids with a delivery task running.
    in_flight: HashSet<String>,
    /// Conversation rooms joined on the transport.
    joined: HashSet<String>,
}

struct Subscriber {
    id: ListenerId,
    filter: UpdateFilter,
    listener: Listener,
}

struct Shared {
    state: Mutex<SessionState>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_listener: AtomicU64,
    transport: Arc<dyn Transport>,
    api: Arc<dyn ChatApi>,
    config: SyncConfig,
}

#[derive(Clone)]
pub struct ChatSession {
    shared: Arc<Shared>,
}

impl ChatSession {
    pub fn new(
        store: ConversationStore,
        transport: Arc<dyn Transport>,
        api: Arc<dyn ChatApi>,
        config: SyncConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState {
                store,
                tracker: UnreadTracker::new(),
                reconciler: MessageReconciler::new(),
                cursors: HashMap::new(),
                receipt_tasks: HashMap::new(),
                in_flight: HashSet::new(),
                joined: HashSet::new(),
            }),
            subscribers: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            transport,
            api,
            config,
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        shared.transport.on_event(Arc::new(move |event: &TransportEvent| {
            if let Some(shared) = weak.upgrade() {
                shared.on_transport_event(event);
            }
        }));

        // Every known conversation listens for live messages, open or not.
        let known: Vec<String> = {
            let state = shared.state.lock();
            state
                .store
                .list_conversations()
                .iter()
                .map(|c| c.id.clone())
                .collect()
        };
        shared.join_rooms(known);

        Self { shared }
    }

    /// Wire up the on-disk store, REST client and websocket for `user_id`
    /// and start connecting. Must be called from within a tokio runtime.
    pub fn connect(
        config: &ClientConfig,
        user_id: &str,
        token: &str,
    ) -> Result<(Self, ConnectionManager)> {
        let storage = Arc::new(LocalStorage::open_for_user(&config.storage.data_dir, user_id)?);
        let store = ConversationStore::open(storage, user_id)?;

        let api = ApiClient::new(config)?;
        api.set_token(token);

        let manager = ConnectionManager::new(config);
        let session = Self::new(
            store,
            Arc::new(manager.clone()),
            Arc::new(api),
            config.sync.clone(),
        );
        manager.connect(token);
        info!(user_id, server = %config.http_url(), "Chat session started");
        Ok((session, manager))
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub fn subscribe(&self, filter: UpdateFilter, listener: Listener) -> ListenerId {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared.subscribers.write().push(Subscriber {
            id,
            filter,
            listener,
        });
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut subscribers = self.shared.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Insert a pending message and start delivering it in the background.
    pub fn send_message(
        &self,
        conversation_id: &str,
        content: MessageContent,
    ) -> Result<PendingSend> {
        let message = {
            let mut state = self.shared.state.lock();
            if state.store.get_conversation(conversation_id).is_none() {
                return Err(Error::UnknownConversation(conversation_id.to_string()));
            }
            let me = state.store.current_user_id().to_string();
            let message = Message::pending(conversation_id, &me, content);
            state.store.upsert_message(message.clone());
            state.in_flight.insert(message.id.clone());
            message
        };

        debug!(message_id = %message.id, conversation_id, "Message queued");
        let message_id = message.id.clone();
        self.shared.notify(vec![ChatUpdate::MessageUpserted {
            conversation_id: conversation_id.to_string(),
            message,
        }]);
        Ok(self.spawn_delivery(message_id))
    }

    /// Send a `failed` message again.
    pub fn retry_message(&self, message_id: &str) -> Result<PendingSend> {
        let conversation_id = {
            let mut state = self.shared.state.lock();
            let Some(msg) = state.store.message(message_id) else {
                return Err(Error::UnknownMessage(message_id.to_string()));
            };
            let retryable = msg.is_provisional()
                && (msg.delivery_state == DeliveryState::Failed
                    || !state.in_flight.contains(message_id));
            if !retryable {
                return Err(Error::SendFailed {
                    message_id: message_id.to_string(),
                    reason: "message is not awaiting retry".to_string(),
                });
            }
            let conversation_id = msg.conversation_id.clone();
            state
                .store
                .set_delivery_state(message_id, DeliveryState::Pending);
            state.in_flight.insert(message_id.to_string());
            conversation_id
        };

        info!(message_id, "Retrying message");
        self.shared.notify(vec![ChatUpdate::DeliveryStateChanged {
            conversation_id,
            message_id: message_id.to_string(),
            state: DeliveryState::Pending,
        }]);
        Ok(self.spawn_delivery(message_id.to_string()))
    }

    fn spawn_delivery(&self, message_id: String) -> PendingSend {
        let shared = self.shared.clone();
        let id = message_id.clone();
        let handle = tokio::spawn(async move { shared.deliver(id).await });
        PendingSend { message_id, handle }
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    /// Make a conversation the active one: load cached messages, join its
    /// room and mark it read. Fetches the first history page if none has
    /// been fetched yet; a failed fetch is logged, not returned.
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<()> {
        let (updates, receipt, needs_history) = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if state.store.get_conversation(conversation_id).is_none() {
                return Err(Error::UnknownConversation(conversation_id.to_string()));
            }
            state.tracker.set_active(conversation_id);

            let mut updates = Vec::new();
            let limit = i64::from(self.shared.config.history_page_size);
            if !state.store.hydrate(conversation_id, limit).is_empty() {
                updates.push(ChatUpdate::ConversationUpdated {
                    conversation_id: conversation_id.to_string(),
                });
            }

            let had_unread = state.store.unread_count(conversation_id) > 0;
            let receipt = state.tracker.mark_read(&mut state.store, conversation_id);
            if had_unread {
                updates.push(ChatUpdate::UnreadChanged {
                    conversation_id: conversation_id.to_string(),
                    unread_count: 0,
                    total_unread: state.store.total_unread(),
                });
            }
            let needs_history = !state.cursors.contains_key(conversation_id);
            (updates, receipt, needs_history)
        };

        self.shared.join_rooms([conversation_id.to_string()]);
        self.shared.emit(receipt);
        self.shared.notify(updates);
        debug!(conversation_id, "Conversation opened");

        if needs_history {
            if let Err(e) = self.load_older_messages(conversation_id).await {
                warn!(conversation_id, error = %e, "Initial history fetch failed");
            }
        }
        Ok(())
    }

    /// Leave the active conversation. Pending debounced receipts for it are
    /// cancelled; sends in flight are not. The room stays joined so new
    /// messages keep counting as unread.
    pub fn close_conversation(&self, conversation_id: &str) {
        let mut state = self.shared.state.lock();
        state.tracker.clear_active(conversation_id);
        if let Some(task) = state.receipt_tasks.remove(conversation_id) {
            task.abort();
        }
        debug!(conversation_id, "Conversation closed");
    }

    pub fn mark_read(&self, conversation_id: &str) -> Result<()> {
        let (receipt, update) = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if state.store.get_conversation(conversation_id).is_none() {
                return Err(Error::UnknownConversation(conversation_id.to_string()));
            }
            let had_unread = state.store.unread_count(conversation_id) > 0;
            let receipt = state.tracker.mark_read(&mut state.store, conversation_id);
            let update = had_unread.then(|| ChatUpdate::UnreadChanged {
                conversation_id: conversation_id.to_string(),
                unread_count: 0,
                total_unread: state.store.total_unread(),
            });
            (receipt, update)
        };

        self.shared.emit(receipt);
        self.shared.notify(update.into_iter().collect());
        Ok(())
    }

    /// Remove a message locally and delete it on the server too. A message
    /// still awaiting its ack is removed there by the delivery task once the
    /// ack arrives. The local removal stands even if the server call fails.
    pub async fn delete_message(&self, message_id: &str) -> Result<()> {
        let removed = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let Some(removed) = state.store.delete_message(message_id) else {
                return Err(Error::UnknownMessage(message_id.to_string()));
            };
            state.in_flight.remove(message_id);

            let mut updates = Vec::new();
            let was_unread = removed.is_unread_for(state.store.current_user_id());
            if state
                .tracker
                .on_removed(&mut state.store, was_unread, &removed.conversation_id)
            {
                updates.push(ChatUpdate::UnreadChanged {
                    conversation_id: removed.conversation_id.clone(),
                    unread_count: state.store.unread_count(&removed.conversation_id),
                    total_unread: state.store.total_unread(),
                });
            }
            updates.push(ChatUpdate::MessageDeleted {
                conversation_id: removed.conversation_id.clone(),
                message_id: message_id.to_string(),
            });
            drop(guard);
            self.shared.notify(updates);
            removed
        };

        if removed.is_provisional() {
            return Ok(());
        }
        self.shared
            .api
            .delete_message(&removed.conversation_id, message_id)
            .await
    }

    /// Fetch the next page of older messages. Returns how many new messages
    /// were merged; 0 once the beginning of the conversation is reached.
    pub async fn load_older_messages(&self, conversation_id: &str) -> Result<usize> {
        let before = {
            let state = self.shared.state.lock();
            if state.store.get_conversation(conversation_id).is_none() {
                return Err(Error::UnknownConversation(conversation_id.to_string()));
            }
            match state.cursors.get(conversation_id) {
                None => None,
                Some(Some(cursor)) => Some(cursor.clone()),
                Some(None) => return Ok(0),
            }
        };

        let limit = self.shared.config.history_page_size;
        let page = self
            .shared
            .api
            .fetch_messages(conversation_id, before.as_deref(), limit)
            .await?;

        let next_cursor = page.next_cursor.clone().or_else(|| {
            if page.messages.len() as u32 >= limit {
                page.messages.iter().min_by_key(|m| m.key()).map(|m| m.id.clone())
            } else {
                None
            }
        });

        let updates = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            state
                .cursors
                .insert(conversation_id.to_string(), next_cursor);
            state
                .reconciler
                .merge_history_page(&mut state.store, &state.tracker, conversation_id, page.messages)
        };

        let merged = updates
            .iter()
            .filter(|u| matches!(u, ChatUpdate::MessageUpserted { .. }))
            .count();
        self.shared.notify(updates);
        Ok(merged)
    }

    /// Pull the conversation list from the server. Returns how many
    /// conversations changed.
    pub async fn refresh_conversations(&self) -> Result<usize> {
        let me = self.current_user_id();
        let summaries = self.shared.api.list_conversations(&me).await?;

        let mut known = Vec::new();
        let mut updates = Vec::new();
        {
            let mut state = self.shared.state.lock();
            for summary in &summaries {
                match state.store.upsert_conversation(summary) {
                    Ok(changed) => {
                        known.push(summary.id.clone());
                        if changed {
                            updates.push(ChatUpdate::ConversationUpdated {
                                conversation_id: summary.id.clone(),
                            });
                        }
                    }
                    Err(e) => warn!(error = %e, "Skipping invalid conversation from server"),
                }
            }
        }

        let changed = updates.len();
        debug!(received = summaries.len(), changed, "Conversation list refreshed");
        self.shared.join_rooms(known);
        self.shared.notify(updates);
        Ok(changed)
    }

    /// Create a conversation with `member_ids` (the current user is added if
    /// missing). Returns the new conversation id.
    pub async fn start_conversation(
        &self,
        member_ids: &[String],
        name: Option<&str>,
    ) -> Result<String> {
        let me = self.current_user_id();
        let mut members = member_ids.to_vec();
        if !members.contains(&me) {
            members.push(me);
        }

        let is_group = members.len() > 2;
        ConversationSummary {
            id: String::new(),
            participant_ids: members.clone(),
            is_group,
            name: name.map(str::to_string),
            last_activity_at: None,
        }
        .validate()?;

        let summary = self.shared.api.create_conversation(&members, name).await?;
        {
            let mut state = self.shared.state.lock();
            state.store.upsert_conversation(&summary)?;
        }
        info!(conversation_id = %summary.id, members = members.len(), "Conversation started");
        self.shared.join_rooms([summary.id.clone()]);
        self.shared.notify(vec![ChatUpdate::ConversationUpdated {
            conversation_id: summary.id.clone(),
        }]);
        Ok(summary.id)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn current_user_id(&self) -> String {
        self.shared.state.lock().store.current_user_id().to_string()
    }

    pub fn get_conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.shared
            .state
            .lock()
            .store
            .get_conversation(conversation_id)
            .cloned()
    }

    /// Conversations by most recent activity.
    pub fn list_conversations(&self) -> Vec<Conversation> {
        self.shared
            .state
            .lock()
            .store
            .list_conversations()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.shared
            .state
            .lock()
            .store
            .get_conversation(conversation_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn message(&self, message_id: &str) -> Option<Message> {
        self.shared.state.lock().store.message(message_id).cloned()
    }

    pub fn get_unread_count(&self, conversation_id: &str) -> u32 {
        let state = self.shared.state.lock();
        state.tracker.get_unread_count(&state.store, conversation_id)
    }

    pub fn get_total_unread(&self) -> u32 {
        let state = self.shared.state.lock();
        state.tracker.get_total_unread(&state.store)
    }

    pub fn unread_index(&self) -> HashMap<String, u32> {
        self.shared.state.lock().store.unread_index()
    }

    pub fn active_conversation(&self) -> Option<String> {
        self.shared
            .state
            .lock()
            .tracker
            .active()
            .map(str::to_string)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.transport.state()
    }
}

impl Shared {
    fn notify(&self, updates: Vec<ChatUpdate>) {
        if updates.is_empty() {
            return;
        }
        let subscribers: Vec<(ListenerId, UpdateFilter, Listener)> = self
            .subscribers
            .read()
            .iter()
            .map(|s| (s.id, s.filter.clone(), s.listener.clone()))
            .collect();

        for update in &updates {
            for (id, filter, listener) in &subscribers {
                if !filter.matches(update) {
                    continue;
                }
                match catch_unwind(AssertUnwindSafe(|| listener(update))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(listener = *id, error = %e, "Listener failed"),
                    Err(_) => error!(listener = *id, "Listener panicked"),
                }
            }
        }
    }

    /// Join the room of every conversation not joined yet. Rooms stay joined
    /// for the life of the session; the transport re-joins them on reconnect.
    fn join_rooms<I>(&self, conversation_ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        let fresh: Vec<String> = {
            let mut state = self.state.lock();
            conversation_ids
                .into_iter()
                .filter(|id| state.joined.insert(id.clone()))
                .collect()
        };
        for id in &fresh {
            self.transport.join_room(id);
        }
        if !fresh.is_empty() {
            debug!(rooms = fresh.len(), "Joined conversation rooms");
        }
    }

    /// Fire-and-forget; the event is dropped if the transport is down.
    fn emit(&self, event: OutboundEvent) {
        let name = event.name();
        if let Err(e) = self.transport.emit(event) {
            debug!(event = name, error = %e, "Event not sent");
        }
    }

    fn on_transport_event(self: &Arc<Self>, event: &TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => {
                self.notify(vec![ChatUpdate::ConnectionStateChanged(*state)]);
            }
            TransportEvent::AuthFailed(reason) => {
                self.notify(vec![ChatUpdate::AuthRejected(reason.clone())]);
            }
            TransportEvent::Frame(raw) => {
                let updates = {
                    let mut guard = self.state.lock();
                    let state = &mut *guard;
                    let outcome =
                        state
                            .reconciler
                            .apply_live_event(&mut state.store, &state.tracker, raw);
                    if let Some(conversation_id) = outcome.receipt_due {
                        self.schedule_receipt(state, conversation_id);
                    }
                    outcome.updates
                };
                // Conversations first seen through a live message
                let seen: Vec<String> = updates
                    .iter()
                    .filter(|u| {
                        matches!(
                            u,
                            ChatUpdate::ConversationUpdated { .. }
                                | ChatUpdate::MessageUpserted { .. }
                        )
                    })
                    .filter_map(|u| u.conversation_id().map(str::to_string))
                    .collect();
                self.join_rooms(seen);
                self.notify(updates);
            }
        }
    }

    /// Debounce read receipts for the open conversation: each new message
    /// restarts the timer.
    fn schedule_receipt(self: &Arc<Self>, state: &mut SessionState, conversation_id: String) {
        if let Some(previous) = state.receipt_tasks.remove(&conversation_id) {
            previous.abort();
        }
        let weak = Arc::downgrade(self);
        let delay = self.config.read_receipt_debounce();
        let id = conversation_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.flush_receipt(&id);
            }
        });
        state.receipt_tasks.insert(conversation_id, task);
    }

    fn flush_receipt(&self, conversation_id: &str) {
        let receipt = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.receipt_tasks.remove(conversation_id);
            if !state.tracker.is_active(conversation_id) {
                return;
            }
            state.tracker.mark_read(&mut state.store, conversation_id)
        };
        self.emit(receipt);
    }

    // ========================================================================
    // Delivery pipeline
    // ========================================================================

    async fn deliver(self: Arc<Self>, provisional_id: String) -> Result<Message> {
        let result = self.deliver_with_retry(&provisional_id).await;
        self.state.lock().in_flight.remove(&provisional_id);

        match result {
            Ok(message) => Ok(message),
            Err(e) => {
                warn!(message_id = %provisional_id, error = %e, "Message delivery failed");
                let update = {
                    let mut state = self.state.lock();
                    let conversation_id = state
                        .store
                        .message(&provisional_id)
                        .map(|m| m.conversation_id.clone());
                    match conversation_id {
                        Some(conversation_id)
                            if state
                                .store
                                .set_delivery_state(&provisional_id, DeliveryState::Failed) =>
                        {
                            Some(ChatUpdate::DeliveryStateChanged {
                                conversation_id,
                                message_id: provisional_id.clone(),
                                state: DeliveryState::Failed,
                            })
                        }
                        _ => None,
                    }
                };
                self.notify(update.into_iter().collect());
                Err(Error::SendFailed {
                    message_id: provisional_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// One attempt, plus one more after a transient failure once the
    /// transport is connected again.
    async fn deliver_with_retry(&self, provisional_id: &str) -> Result<Message> {
        let mut retried = false;
        loop {
            let (conversation_id, outgoing) = {
                let state = self.state.lock();
                if let Some(server_id) = state.store.acknowledged_id(provisional_id) {
                    debug!(message_id = provisional_id, "Already acknowledged by live echo");
                    return state
                        .store
                        .message(server_id)
                        .cloned()
                        .ok_or_else(|| Error::UnknownMessage(server_id.to_string()));
                }
                let Some(msg) = state.store.message(provisional_id) else {
                    return Err(Error::UnknownMessage(provisional_id.to_string()));
                };
                (
                    msg.conversation_id.clone(),
                    OutgoingMessage {
                        sender_id: msg.sender_id.clone(),
                        content: msg.content.clone(),
                        client_id: provisional_id.to_string(),
                    },
                )
            };

            let timeout = self.config.ack_timeout();
            let error = match tokio::time::timeout(
                timeout,
                self.api.post_message(&conversation_id, &outgoing),
            )
            .await
            {
                Ok(Ok(acked)) => {
                    let deleted = self
                        .state
                        .lock()
                        .store
                        .tombstone_ack(provisional_id, &acked.id);
                    if deleted {
                        info!(
                            message_id = %acked.id,
                            provisional_id,
                            "Deleted before acknowledgment, removing from server"
                        );
                        if let Err(e) = self.api.delete_message(&conversation_id, &acked.id).await {
                            warn!(message_id = %acked.id, error = %e, "Server delete failed");
                        }
                        return Err(Error::DeletedBeforeAck(provisional_id.to_string()));
                    }
                    return Ok(self.on_ack(provisional_id, acked));
                }
                Ok(Err(e)) => e,
                Err(_) => Error::Transport(TransportError::Timeout(timeout.as_millis() as u64)),
            };

            if retried || !error.is_transient() {
                return Err(error);
            }
            retried = true;
            warn!(message_id = provisional_id, error = %error, "Send failed, retrying once connected");
            match tokio::time::timeout(timeout, self.wait_connected()).await {
                Ok(connected) => connected?,
                Err(_) => {
                    return Err(TransportError::Timeout(timeout.as_millis() as u64).into());
                }
            }
        }
    }

    async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.transport.watch_state();
        let state = rx
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Disconnected))
            .await
            .map(|s| *s)
            .map_err(|_| TransportError::NotConnected)?;
        match state {
            ConnectionState::Connected => Ok(()),
            _ => Err(TransportError::NotConnected.into()),
        }
    }

    fn on_ack(&self, provisional_id: &str, acked: Message) -> Message {
        let server_id = acked.id.clone();
        let (result, update, fan_out) = {
            let mut state = self.state.lock();
            let outcome = state.store.acknowledge(provisional_id, acked.clone());
            let stored = state.store.message(&server_id).cloned();
            let result = stored.clone().unwrap_or(acked);

            match (outcome, stored) {
                (UpsertOutcome::Replaced(_), Some(message)) => {
                    let fan_out = OutboundEvent::UserSendMessage {
                        chat_id: message.conversation_id.clone(),
                        sender_id: message.sender_id.clone(),
                        content: message.content.clone(),
                        message_id: message.id.clone(),
                        client_id: provisional_id.to_string(),
                    };
                    let update = ChatUpdate::MessageReplaced {
                        conversation_id: message.conversation_id.clone(),
                        provisional_id: provisional_id.to_string(),
                        message,
                    };
                    (result, Some(update), Some(fan_out))
                }
                _ => (result, None, None),
            }
        };

        debug!(provisional_id, message_id = %server_id, "Message acknowledged");
        if let Some(event) = fan_out {
            self.emit(event);
        }
        self.notify(update.into_iter().collect());
        result
    }
}
