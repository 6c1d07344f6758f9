//! Remote language-model capability
//!
//! The analysis core only ever talks to a [`ModelClient`]. Concrete clients
//! live in submodules:
//!
//! - [`AnthropicClient`]: Messages API over HTTPS, with prompt caching and SSE streaming
//! - [`RetryingClient`]: wraps any client, retrying transient failures with backoff

pub mod anthropic;
pub mod retry;

pub use anthropic::AnthropicClient;
pub use retry::RetryingClient;

use crate::doc::types::TokenUsage;
use crate::error::ClientError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One role/content pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Marks the system prefix as reusable across calls of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBoundary {
    /// Short-lived provider-side cache entry
    Ephemeral,
}

/// Per-call options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    pub model: String,
    pub max_output: u32,
    pub temperature: f32,
    pub stream: bool,
}

/// A complete request: stable prefix, optional cache boundary, variable messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Stable instructions shared by every call of a run
    pub system: Arc<str>,

    /// When set, `system` is marked for provider-side reuse
    pub cache_boundary: Option<CacheBoundary>,

    /// Variable, per-call content
    pub messages: Vec<Message>,

    pub options: RequestOptions,
}

impl ModelRequest {
    /// Concatenated content of all messages
    pub fn user_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Model output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub stop_reason: Option<String>,
}

impl ModelResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// Whether the model stopped because it ran out of output budget
    pub fn is_truncated(&self) -> bool {
        self.stop_reason.as_deref() == Some("max_tokens")
    }
}

/// Receives streamed text deltas; each delta is only borrowed for the call
///
/// The callback itself may borrow for `'a`. Shared sinks use `DeltaFn<'static>`.
pub type DeltaFn<'a> = dyn for<'d> Fn(&'d str) + Send + Sync + 'a;

/// Capability to call a remote language model
///
/// Implementations own transport concerns (auth, retries, transport
/// timeouts). The analysis core never retries on its own.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Send a request and wait for the full response
    async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, ClientError>;

    /// Send a request, reporting text deltas as they arrive
    async fn send_streaming(
        &self,
        request: &ModelRequest,
        on_delta: &DeltaFn<'_>,
    ) -> Result<ModelResponse, ClientError> {
        let response = self.send(request).await?;
        on_delta(&response.text);
        Ok(response)
    }
}

#[async_trait]
impl<T: ModelClient + ?Sized> ModelClient for Arc<T> {
    async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, ClientError> {
        (**self).send(request).await
    }

    async fn send_streaming(
        &self,
        request: &ModelRequest,
        on_delta: &DeltaFn<'_>,
    ) -> Result<ModelResponse, ClientError> {
        (**self).send_streaming(request, on_delta).await
    }
}
