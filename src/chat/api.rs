use anyhow::{Context, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::events::{Attachment, Message, StreamEvent};
use super::stream::SseDecoder;

/// Boxed event stream returned by a chat send; finite and single-use.
pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

/// Body of a chat send request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub chat_session_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Remote chat backend seam.
///
/// The production implementation is [`HttpBackend`]; tests substitute a
/// scripted backend to drive the manager without a network.
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    /// List existing chat tab ids for a backend session.
    async fn list_chat_sessions(&self, session_id: &str) -> Result<Vec<String>>;

    /// Provision a new chat tab; returns its id.
    async fn create_chat_session(&self, session_id: &str) -> Result<String>;

    /// Delete a chat tab remotely.
    async fn delete_chat_session(&self, session_id: &str, chat_id: &str) -> Result<()>;

    /// Fetch a tab's message history.
    async fn fetch_messages(&self, session_id: &str, chat_id: &str) -> Result<Vec<Message>>;

    /// Dispatch a chat message; the response body is the event stream.
    async fn send_chat(&self, request: ChatRequest) -> Result<EventStream>;
}

#[derive(Debug, Deserialize)]
struct SessionsResponse {
    #[serde(default)]
    sessions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedSessionResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct CreateSessionBody<'a> {
    session_id: &'a str,
}

/// reqwest-backed chat backend.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        info!(%base_url, "chat backend configured");
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait::async_trait]
impl ChatBackend for HttpBackend {
    async fn list_chat_sessions(&self, session_id: &str) -> Result<Vec<String>> {
        let url = format!("{}/chat-sessions", self.base_url);
        let resp: SessionsResponse = self
            .client
            .get(url)
            .query(&[("session_id", session_id)])
            .send()
            .await
            .context("failed to list chat sessions")?
            .error_for_status()
            .context("chat session listing rejected")?
            .json()
            .await
            .context("invalid chat session listing")?;
        Ok(resp.sessions)
    }

    async fn create_chat_session(&self, session_id: &str) -> Result<String> {
        let url = format!("{}/chat-sessions", self.base_url);
        let resp: CreatedSessionResponse = self
            .client
            .post(url)
            .json(&CreateSessionBody { session_id })
            .send()
            .await
            .context("failed to create chat session")?
            .error_for_status()
            .context("chat session creation rejected")?
            .json()
            .await
            .context("invalid chat session creation response")?;
        Ok(resp.id)
    }

    async fn delete_chat_session(&self, session_id: &str, chat_id: &str) -> Result<()> {
        let url = format!("{}/chat-sessions/{}", self.base_url, chat_id);
        self.client
            .delete(url)
            .query(&[("session_id", session_id)])
            .send()
            .await
            .context("failed to delete chat session")?
            .error_for_status()
            .context("chat session deletion rejected")?;
        Ok(())
    }

    async fn fetch_messages(&self, session_id: &str, chat_id: &str) -> Result<Vec<Message>> {
        let url = format!("{}/chat-sessions/{}/messages", self.base_url, chat_id);
        let resp: MessagesResponse = self
            .client
            .get(url)
            .query(&[("session_id", session_id)])
            .send()
            .await
            .context("failed to fetch tab history")?
            .error_for_status()
            .context("tab history request rejected")?
            .json()
            .await
            .context("invalid tab history response")?;
        Ok(resp.messages)
    }

    async fn send_chat(&self, request: ChatRequest) -> Result<EventStream> {
        let url = format!("{}/chat", self.base_url);
        let resp = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .context("failed to dispatch chat message")?
            .error_for_status()
            .context("chat dispatch rejected")?;

        let body = resp.bytes_stream().boxed();
        Ok(SseDecoder::new(body).into_stream().boxed())
    }
}
