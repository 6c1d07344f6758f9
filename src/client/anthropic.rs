//! Anthropic Messages API client
//!
//! See: https://docs.anthropic.com/en/api/messages

use super::{CacheBoundary, DeltaFn, ModelClient, ModelRequest, ModelResponse, Role};
use crate::doc::types::TokenUsage;
use crate::error::ClientError;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Cache control marker for prompt caching
#[derive(Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    control_type: &'static str,
}

#[derive(Serialize)]
struct SystemBlock<'a> {
    #[serde(rename = "type")]
    block_type: &'static str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    system: Vec<SystemBlock<'a>>,
    messages: Vec<ApiMessage<'a>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[derive(Deserialize, Default)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Anthropic API client
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl AnthropicClient {
    /// Create a client with a transport timeout
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ClientError::Fatal(
                "No API key configured. Set ANTHROPIC_API_KEY or run 'chunkwise config set api_key <key>'."
                    .to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Fatal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            endpoint: ANTHROPIC_API_URL.to_string(),
        })
    }

    /// Point the client at a different Messages endpoint (proxies, gateways)
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn body<'a>(request: &'a ModelRequest, stream: bool) -> ApiRequest<'a> {
        let system = if request.system.is_empty() {
            Vec::new()
        } else {
            vec![SystemBlock {
                block_type: "text",
                text: &request.system,
                cache_control: request.cache_boundary.map(|boundary| match boundary {
                    CacheBoundary::Ephemeral => CacheControl {
                        control_type: "ephemeral",
                    },
                }),
            }]
        };

        ApiRequest {
            model: &request.options.model,
            max_tokens: request.options.max_output,
            temperature: request.options.temperature,
            system,
            messages: request
                .messages
                .iter()
                .map(|m| ApiMessage {
                    role: m.role,
                    content: &m.content,
                })
                .collect(),
            stream,
        }
    }

    async fn post(&self, body: &ApiRequest<'_>) -> Result<reqwest::Response, ClientError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::Transient(format!("Request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiError>(&error_text)
            .map(|e| e.error.message)
            .unwrap_or(error_text);

        warn!("Anthropic API returned {}: {}", status, message);
        Err(classify_status(status, message))
    }
}

/// Rate limits, overload and server errors are worth retrying; the rest are not
fn classify_status(status: StatusCode, message: String) -> ClientError {
    let detail = format!("API error ({}): {}", status.as_u16(), message);
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
        || status.as_u16() == 529
    {
        ClientError::Transient(detail)
    } else {
        ClientError::Fatal(detail)
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, ClientError> {
        debug!(
            "Calling {} (max_tokens {}, cached prefix: {})",
            request.options.model,
            request.options.max_output,
            request.cache_boundary.is_some()
        );

        let response = self.post(&Self::body(request, false)).await?;
        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Fatal(format!("Failed to parse response: {}", e)))?;

        let text = api_response
            .content
            .iter()
            .filter(|block| block.content_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<String>();

        Ok(ModelResponse {
            text,
            usage: TokenUsage::new(api_response.usage.input_tokens, api_response.usage.output_tokens),
            stop_reason: api_response.stop_reason,
        })
    }

    async fn send_streaming(
        &self,
        request: &ModelRequest,
        on_delta: &DeltaFn<'_>,
    ) -> Result<ModelResponse, ClientError> {
        let response = self.post(&Self::body(request, true)).await?;
        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();

        while let Some(bytes) = stream.next().await {
            let bytes =
                bytes.map_err(|e| ClientError::Transient(format!("Stream interrupted: {}", e)))?;
            decoder.feed(&bytes, on_delta)?;
        }
        decoder.finish(on_delta)?;

        Ok(decoder.into_response())
    }
}

/// Incremental decoder for the Messages API server-sent events
///
/// Bytes are buffered until a full line arrives, so multi-byte characters
/// split across network reads decode intact.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    text: String,
    usage: TokenUsage,
    stop_reason: Option<String>,
}

impl SseDecoder {
    fn feed(&mut self, chunk: &[u8], on_delta: &DeltaFn<'_>) -> Result<(), ClientError> {
        self.buffer.extend_from_slice(chunk);
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            self.handle_line(String::from_utf8_lossy(&line).trim_end(), on_delta)?;
        }
        Ok(())
    }

    fn finish(&mut self, on_delta: &DeltaFn<'_>) -> Result<(), ClientError> {
        let rest = std::mem::take(&mut self.buffer);
        self.handle_line(String::from_utf8_lossy(&rest).trim_end(), on_delta)
    }

    fn handle_line(&mut self, line: &str, on_delta: &DeltaFn<'_>) -> Result<(), ClientError> {
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(());
        };
        let event: serde_json::Value = match serde_json::from_str(data.trim()) {
            Ok(event) => event,
            Err(_) => return Ok(()),
        };

        match event["type"].as_str() {
            Some("message_start") => {
                if let Some(tokens) = event["message"]["usage"]["input_tokens"].as_u64() {
                    self.usage.input_tokens = tokens;
                }
            }
            Some("content_block_delta") => {
                if let Some(delta) = event["delta"]["text"].as_str() {
                    self.text.push_str(delta);
                    on_delta(delta);
                }
            }
            Some("message_delta") => {
                if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(tokens) = event["usage"]["output_tokens"].as_u64() {
                    self.usage.output_tokens = tokens;
                }
            }
            Some("error") => {
                let message = event["error"]["message"].as_str().unwrap_or("unknown stream error");
                let kind = event["error"]["type"].as_str().unwrap_or_default();
                return Err(if kind == "overloaded_error" || kind == "rate_limit_error" {
                    ClientError::Transient(message.to_string())
                } else {
                    ClientError::Fatal(message.to_string())
                });
            }
            _ => {}
        }

        Ok(())
    }

    fn into_response(self) -> ModelResponse {
        ModelResponse {
            text: self.text,
            usage: self.usage,
            stop_reason: self.stop_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Message, RequestOptions};
    use std::sync::{Arc, Mutex};

    fn request(cache: bool) -> ModelRequest {
        ModelRequest {
            system: Arc::from("Shared instructions"),
            cache_boundary: cache.then_some(CacheBoundary::Ephemeral),
            messages: vec![Message::user("Excerpt text")],
            options: RequestOptions {
                model: "claude-sonnet-4-20250514".to_string(),
                max_output: 2048,
                temperature: 0.0,
                stream: false,
            },
        }
    }

    #[test]
    fn test_body_marks_cached_prefix() {
        let req = request(true);
        let json = serde_json::to_value(AnthropicClient::body(&req, false)).unwrap();
        assert_eq!(json["system"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "Excerpt text");
        assert!(json.get("stream").is_none());
    }

    #[test]
    fn test_body_without_cache_boundary() {
        let req = request(false);
        let json = serde_json::to_value(AnthropicClient::body(&req, true)).unwrap();
        assert!(json["system"][0].get("cache_control").is_none());
        assert_eq!(json["stream"], true);
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down".into()).is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "oops".into()).is_transient());
        assert!(classify_status(StatusCode::from_u16(529).unwrap(), "overloaded".into()).is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "bad key".into()).is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "bad body".into()).is_transient());
    }

    #[test]
    fn test_missing_api_key_is_fatal() {
        let err = AnthropicClient::new("  ", Duration::from_secs(5)).err().unwrap();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_sse_decoder_accumulates_deltas() {
        let deltas = Mutex::new(Vec::new());
        let on_delta = |d: &str| deltas.lock().unwrap().push(d.to_string());
        let mut decoder = SseDecoder::default();

        let events = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":12}}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n",
            "data: {\"type\":\"content_block_del",
        );
        decoder.feed(events.as_bytes(), &on_delta).unwrap();
        decoder
            .feed(
                "ta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\
                 data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":3}}\n"
                    .as_bytes(),
                &on_delta,
            )
            .unwrap();
        decoder.finish(&on_delta).unwrap();

        let response = decoder.into_response();
        assert_eq!(response.text, "Hello");
        assert_eq!(response.usage, TokenUsage::new(12, 3));
        assert_eq!(response.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(*deltas.lock().unwrap(), vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[test]
    fn test_sse_decoder_multibyte_split_across_reads() {
        let line = "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"café\"}}\n";
        let bytes = line.as_bytes();
        let split = line.find('é').unwrap() + 1;
        let mut decoder = SseDecoder::default();

        decoder.feed(&bytes[..split], &|_| {}).unwrap();
        decoder.feed(&bytes[split..], &|_| {}).unwrap();
        assert_eq!(decoder.into_response().text, "café");
    }

    #[test]
    fn test_sse_decoder_error_event() {
        let mut decoder = SseDecoder::default();
        let err = decoder
            .feed(
                b"data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n",
                &|_| {},
            )
            .unwrap_err();
        assert!(err.is_transient());
    }
}
