//! Scripted transport and REST fakes for driving a `ChatSession`.

#![allow(dead_code)]

use alumni_chat_core::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;

pub struct ScriptedTransport {
    pub emitted: Mutex<Vec<OutboundEvent>>,
    pub rooms: Mutex<Vec<String>>,
    handlers: Mutex<Vec<EventHandler>>,
    pub state: watch::Sender<ConnectionState>,
}

impl ScriptedTransport {
    pub fn connected() -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Connected);
        Arc::new(Self {
            emitted: Mutex::new(Vec::new()),
            rooms: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
            state,
        })
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
        self.fire(TransportEvent::StateChanged(state));
    }

    pub fn fire(&self, event: TransportEvent) {
        let handlers = self.handlers.lock().clone();
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn frame(&self, name: &str, payload: serde_json::Value) {
        self.fire(TransportEvent::Frame(RawEvent::new(name, payload)));
    }

    pub fn emitted_names(&self) -> Vec<&'static str> {
        self.emitted.lock().iter().map(|e| e.name()).collect()
    }
}

impl Transport for ScriptedTransport {
    fn emit(&self, event: OutboundEvent) -> std::result::Result<(), TransportError> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.emitted.lock().push(event);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn on_event(&self, handler: EventHandler) {
        self.handlers.lock().push(handler);
    }

    fn join_room(&self, room_id: &str) {
        let mut rooms = self.rooms.lock();
        if !rooms.iter().any(|r| r == room_id) {
            rooms.push(room_id.to_string());
        }
    }

    fn leave_room(&self, room_id: &str) {
        self.rooms.lock().retain(|r| r != room_id);
    }
}

/// REST fake. Every call is counted; history pages are served per
/// `(chat id, cursor)`.
#[derive(Default)]
pub struct ScriptedApi {
    pub conversations: Mutex<Vec<ConversationSummary>>,
    pub pages: Mutex<HashMap<(String, Option<String>), MessagePage>>,
    pub post_results: Mutex<VecDeque<Result<Message>>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ChatApi for ScriptedApi {
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>> {
        self.calls.lock().push(format!("list {}", user_id));
        Ok(self.conversations.lock().clone())
    }

    async fn fetch_messages(
        &self,
        chat_id: &str,
        before: Option<&str>,
        _limit: u32,
    ) -> Result<MessagePage> {
        self.calls
            .lock()
            .push(format!("fetch {} {}", chat_id, before.unwrap_or("-")));
        let key = (chat_id.to_string(), before.map(str::to_string));
        Ok(self.pages.lock().get(&key).cloned().unwrap_or_default())
    }

    async fn post_message(&self, chat_id: &str, message: &OutgoingMessage) -> Result<Message> {
        let n = {
            let mut calls = self.calls.lock();
            calls.push(format!("post {}", chat_id));
            calls.iter().filter(|c| c.starts_with("post")).count()
        };
        let scripted = self.post_results.lock().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(Message {
                id: format!("srv-{}", n),
                client_id: Some(message.client_id.clone()),
                conversation_id: chat_id.to_string(),
                sender_id: message.sender_id.clone(),
                content: message.content.clone(),
                timestamp: now_millis(),
                read_at: None,
                delivery_state: DeliveryState::Sent,
            })
        })
    }

    async fn create_conversation(
        &self,
        member_ids: &[String],
        name: Option<&str>,
    ) -> Result<ConversationSummary> {
        self.calls.lock().push("create".to_string());
        Ok(ConversationSummary {
            id: format!("c-{}", member_ids.join("-")),
            participant_ids: member_ids.to_vec(),
            is_group: member_ids.len() > 2,
            name: name.map(str::to_string),
            last_activity_at: None,
        })
    }

    async fn delete_message(&self, chat_id: &str, message_id: &str) -> Result<()> {
        self.calls
            .lock()
            .push(format!("delete {} {}", chat_id, message_id));
        Ok(())
    }
}

pub fn summary(id: &str, members: &[&str]) -> ConversationSummary {
    ConversationSummary {
        id: id.to_string(),
        participant_ids: members.iter().map(|m| m.to_string()).collect(),
        is_group: members.len() > 2,
        name: (members.len() > 2).then(|| format!("group {}", id)),
        last_activity_at: None,
    }
}

pub fn wire(id: &str, conv: &str, sender: &str, ts: i64) -> serde_json::Value {
    serde_json::json!({
        "_id": id,
        "chatId": conv,
        "senderId": sender,
        "content": format!("text {}", id),
        "timestamp": ts
    })
}

pub fn message(id: &str, conv: &str, sender: &str, ts: i64) -> Message {
    serde_json::from_value(wire(id, conv, sender, ts)).expect("valid message")
}
