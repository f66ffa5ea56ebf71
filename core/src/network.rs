//! HTTP API client for the chat backend

use crate::config::ClientConfig;
use crate::error::{Error, Result, TransportError};
use crate::models::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

/// Body of `POST /chats/{chatId}/messages`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub sender_id: String,
    pub content: MessageContent,
    pub client_id: String,
}

/// REST operations the session depends on.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>>;

    async fn fetch_messages(
        &self,
        chat_id: &str,
        before: Option<&str>,
        limit: u32,
    ) -> Result<MessagePage>;

    /// Persist a message. The returned copy is the server acknowledgment.
    async fn post_message(&self, chat_id: &str, message: &OutgoingMessage) -> Result<Message>;

    async fn create_conversation(
        &self,
        member_ids: &[String],
        name: Option<&str>,
    ) -> Result<ConversationSummary>;

    async fn delete_message(&self, chat_id: &str, message_id: &str) -> Result<()>;
}

// Older servers answer history requests with a bare array.
#[derive(Deserialize)]
#[serde(untagged)]
enum PageBody {
    Page(MessagePage),
    Bare(Vec<Message>),
}

pub struct ApiClient {
    client: Client,
    base_url: String,
    timeout: Duration,
    token: Mutex<Option<String>>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Self::with_base_url(&config.http_url(), config.sync.ack_timeout())
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            token: Mutex::new(None),
        })
    }

    pub fn set_token(&self, token: &str) {
        *self.token.lock() = Some(token.to_string());
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match self.token.lock().as_ref() {
            Some(t) => req.header("Authorization", format!("Bearer {}", t)),
            None => req,
        }
    }

    /// Send with auth and map the status. Timeouts report the configured limit.
    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let resp = self.authorized(req).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Transport(TransportError::Timeout(self.timeout.as_millis() as u64))
            } else {
                Error::from(e)
            }
        })?;
        Self::check(resp).await
    }

    async fn check(resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status.as_u16() == 401 {
            return Err(Error::AuthRejected(body));
        }
        Err(Error::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ChatApi for ApiClient {
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>> {
        let req = self
            .client
            .get(format!("{}/chats/{}", self.base_url, user_id));
        let resp = self.send(req).await?;
        Ok(resp.json().await?)
    }

    async fn fetch_messages(
        &self,
        chat_id: &str,
        before: Option<&str>,
        limit: u32,
    ) -> Result<MessagePage> {
        let mut req = self
            .client
            .get(format!("{}/chats/{}/messages", self.base_url, chat_id))
            .query(&[("limit", limit.to_string())]);
        if let Some(cursor) = before {
            req = req.query(&[("before", cursor)]);
        }

        let resp = self.send(req).await?;
        let page = match resp.json::<PageBody>().await? {
            PageBody::Page(page) => page,
            PageBody::Bare(messages) => MessagePage {
                messages,
                next_cursor: None,
            },
        };
        Ok(page)
    }

    async fn post_message(&self, chat_id: &str, message: &OutgoingMessage) -> Result<Message> {
        let req = self
            .client
            .post(format!("{}/chats/{}/messages", self.base_url, chat_id))
            .json(message);
        let resp = self.send(req).await?;

        let mut acked: Message = resp.json().await?;
        if acked.conversation_id.is_empty() {
            acked.conversation_id = chat_id.to_string();
        }
        acked.client_id.get_or_insert_with(|| message.client_id.clone());
        Ok(acked)
    }

    async fn create_conversation(
        &self,
        member_ids: &[String],
        name: Option<&str>,
    ) -> Result<ConversationSummary> {
        let req = self
            .client
            .post(format!("{}/chats", self.base_url))
            .json(&json!({
                "memberIds": member_ids,
                "name": name,
            }));
        let resp = self.send(req).await?;
        Ok(resp.json().await?)
    }

    async fn delete_message(&self, chat_id: &str, message_id: &str) -> Result<()> {
        let req = self.client.delete(format!(
            "{}/chats/{}/messages/{}",
            self.base_url, chat_id, message_id
        ));
        self.send(req).await?;
        Ok(())
    }
}
