//! REST collaborators.
//!
//! The backend is consumed for two things only: the initial chat history
//! load, and the support chat polling fallback. Responses are lists of the
//! same message shape the socket pushes; bare arrays, `{"results": [...]}`
//! (paginated) and `{"messages": [...]}` are all accepted.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::channel::Envelope;
use crate::feeds::{check_room_id, CHAT_MESSAGE};

/// Request timeout for REST calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of a room's recent messages.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// The last `limit` messages of `room`, oldest first.
    async fn recent_messages(&self, room: &str, limit: usize) -> Result<Vec<Envelope>>;
}

/// Message store polled by the support chat fallback.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// The full ordered message list.
    async fn fetch(&self) -> Result<Vec<Envelope>>;

    /// Append a user-authored message.
    async fn post(&self, text: &str) -> Result<()>;
}

/// HTTP client for the REST backend.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("api_url", &self.api_url)
            .field("authenticated", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

impl RestClient {
    /// Client for the API rooted at `api_url`, authenticating with `token`.
    pub fn new(api_url: &str, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    /// API root this client talks to.
    #[must_use]
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Polling source for one support thread.
    #[must_use]
    pub fn support_thread(&self, thread_id: &str) -> SupportThread {
        SupportThread {
            client: self.clone(),
            thread_id: thread_id.to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.api_url, path);
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_messages(&self, path: &str, query: &[(&str, String)]) -> Result<Vec<Envelope>> {
        let response = self
            .request(reqwest::Method::GET, path)
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?
            .error_for_status()
            .with_context(|| format!("GET {path} returned an error status"))?;

        let body: Value = response
            .json()
            .await
            .with_context(|| format!("GET {path} returned invalid JSON"))?;

        parse_message_list(body)
    }
}

#[async_trait]
impl HistorySource for RestClient {
    async fn recent_messages(&self, room: &str, limit: usize) -> Result<Vec<Envelope>> {
        let room = check_room_id(room)?;
        let path = format!("/chat/rooms/{room}/messages/");
        let mut messages = self
            .get_messages(&path, &[("limit", limit.to_string())])
            .await?;
        for message in &mut messages {
            message.room.get_or_insert_with(|| room.to_string());
        }
        // Servers may ignore `limit`; keep the newest `limit` entries.
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
        Ok(messages)
    }
}

/// One support chat thread, polled over REST.
#[derive(Debug, Clone)]
pub struct SupportThread {
    client: RestClient,
    thread_id: String,
}

impl SupportThread {
    fn path(&self) -> String {
        format!("/support/threads/{}/messages/", self.thread_id)
    }

    /// Thread id.
    #[must_use]
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }
}

#[async_trait]
impl MessageSource for SupportThread {
    async fn fetch(&self) -> Result<Vec<Envelope>> {
        self.client.get_messages(&self.path(), &[]).await
    }

    async fn post(&self, text: &str) -> Result<()> {
        let path = self.path();
        self.client
            .request(reqwest::Method::POST, &path)
            .json(&serde_json::json!({ "message": text }))
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?
            .error_for_status()
            .with_context(|| format!("POST {path} returned an error status"))?;
        Ok(())
    }
}

/// Normalize a REST message list body into envelopes.
fn parse_message_list(body: Value) -> Result<Vec<Envelope>> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("results").or_else(|| map.remove("messages")) {
            Some(Value::Array(items)) => items,
            _ => anyhow::bail!("response object has no 'results' or 'messages' list"),
        },
        other => anyhow::bail!("expected a message list, got {other}"),
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            Envelope::from_value(item, CHAT_MESSAGE)
                .with_context(|| format!("message #{index} is not a valid envelope"))
        })
        .collect()
}
