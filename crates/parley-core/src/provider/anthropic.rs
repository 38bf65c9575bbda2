//! Anthropic Messages API adapter.
//!
//! Implements [`ProviderAdapter`] for the Anthropic `/v1/messages`
//! endpoint. Normalized system messages are extracted into the dedicated
//! `system` field, and the `input_tokens`/`output_tokens` usage fields are
//! mapped onto the normalized [`TokenUsage`].
//!
//! Streaming is Anthropic's SSE encoding: `event: <name>` lines (noise for
//! our purposes) interleaved with `data: {json}` payloads, terminated by a
//! `message_stop` event payload.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use parley_config::ProviderKind;

use crate::BoxFuture;
use crate::message::{
    DeltaEvent, NormalizedRequest, NormalizedResponse, Role, TokenUsage,
};
use crate::stream::{LineEvent, StreamNormalizer};

use super::adapter::{DeltaReceiver, ProviderAdapter, ProviderError};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_API_VERSION: &str = "2023-06-01";
const STREAM_DATA_PREFIX: &str = "data:";

/// Anthropic Claude provider adapter.
pub struct AnthropicAdapter {
    client: Client,
    base_url: String,
    default_model: String,
}

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: ANTHROPIC_API_URL.to_string(),
            default_model: "claude-sonnet-4-20250514".to_string(),
        }
    }

    /// Set the model used when a request does not name one.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Override the API endpoint (proxies, test servers).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Convert a normalized request into Anthropic's API format.
    ///
    /// System-role messages move into the top-level `system` field; the
    /// Messages API rejects them in the `messages` array.
    fn build_request_body(&self, request: &NormalizedRequest) -> AnthropicRequest {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let system = request
            .messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone());

        let messages = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| AnthropicMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect();

        AnthropicRequest {
            model,
            max_tokens: request.max_tokens,
            system,
            messages,
            temperature: Some(request.temperature),
            stream: None,
        }
    }

    async fn post(
        &self,
        body: &AnthropicRequest,
        request: &NormalizedRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut builder = self
            .client
            .post(&self.base_url)
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .header("content-type", "application/json");
        if let Some(ref credential) = request.credential {
            builder = builder.header("x-api-key", credential.expose());
        }
        let resp = builder
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream {
                provider: ProviderKind::Anthropic,
                status,
                message,
            });
        }
        Ok(resp)
    }

    /// Parse Anthropic's response into the normalized contract.
    fn parse_response(&self, resp: AnthropicResponse) -> NormalizedResponse {
        let content = resp
            .content
            .iter()
            .filter_map(|block| match block {
                AnthropicBlock::Text { text } => Some(text.as_str()),
            })
            .collect::<Vec<_>>()
            .join("");

        NormalizedResponse {
            content,
            usage: TokenUsage {
                input_tokens: resp.usage.input_tokens,
                output_tokens: resp.usage.output_tokens,
                total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
            },
            model: resp.model,
            provider: ProviderKind::Anthropic,
        }
    }
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn name(&self) -> &str {
        "Anthropic"
    }

    fn send(
        &self,
        request: &NormalizedRequest,
    ) -> BoxFuture<'_, Result<NormalizedResponse, ProviderError>> {
        let body = self.build_request_body(request);
        let request = request.clone();
        Box::pin(async move {
            debug!(model = %body.model, "Anthropic chat request");
            let resp = self.post(&body, &request).await?;
            let api_resp: AnthropicResponse = resp
                .json()
                .await
                .map_err(|e| ProviderError::Parse(e.to_string()))?;
            Ok(self.parse_response(api_resp))
        })
    }

    fn send_streaming(
        &self,
        request: &NormalizedRequest,
    ) -> BoxFuture<'_, Result<DeltaReceiver, ProviderError>> {
        let mut body = self.build_request_body(request);
        body.stream = Some(true);
        let request = request.clone();
        Box::pin(async move {
            debug!(model = %body.model, "Anthropic streaming chat request");
            let mut resp = self.post(&body, &request).await?;

            let (tx, rx) = tokio::sync::mpsc::channel(64);
            tokio::spawn(async move {
                let mut decoder = AnthropicStreamDecoder::default();
                let mut normalizer = StreamNormalizer::new(move |line: &str| decoder.decode(line));
                loop {
                    match resp.chunk().await {
                        Ok(Some(bytes)) => {
                            for event in normalizer.feed(&bytes) {
                                let done = matches!(event, DeltaEvent::Done { .. });
                                if tx.send(Ok(event)).await.is_err() {
                                    // Consumer cancelled; stop reading so the
                                    // upstream connection is dropped.
                                    return;
                                }
                                if done {
                                    return;
                                }
                            }
                        }
                        Ok(None) => {
                            if let Err(err) = normalizer.finish() {
                                let _ = tx.send(Err(err)).await;
                            }
                            return;
                        }
                        Err(e) => {
                            let _ = tx.send(Err(ProviderError::Network(e.to_string()))).await;
                            return;
                        }
                    }
                }
            });
            Ok(rx)
        })
    }
}

/// Line decoder for Anthropic's SSE stream.
///
/// Relevant payloads: `content_block_delta` carries text deltas,
/// `message_delta` carries running usage, `message_stop` is the terminal.
/// `event:` lines and every other payload type are noise.
#[derive(Default)]
struct AnthropicStreamDecoder {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicStreamDecoder {
    fn decode(&mut self, line: &str) -> LineEvent {
        let Some(payload) = line.strip_prefix(STREAM_DATA_PREFIX) else {
            return LineEvent::Noise;
        };
        let Ok(event) = serde_json::from_str::<AnthropicStreamEvent>(payload.trim()) else {
            return LineEvent::Noise;
        };
        match event {
            AnthropicStreamEvent::ContentBlockDelta { delta } => match delta {
                AnthropicDelta::TextDelta { text } if !text.is_empty() => {
                    LineEvent::Fragment(text)
                }
                _ => LineEvent::Noise,
            },
            AnthropicStreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.input_tokens = usage.input_tokens;
                    self.output_tokens = usage.output_tokens;
                }
                LineEvent::Noise
            }
            AnthropicStreamEvent::MessageDelta { usage } => {
                if let Some(usage) = usage {
                    self.output_tokens = usage.output_tokens;
                }
                LineEvent::Noise
            }
            AnthropicStreamEvent::MessageStop => LineEvent::Terminal {
                usage: Some(TokenUsage {
                    input_tokens: self.input_tokens,
                    output_tokens: self.output_tokens,
                    total_tokens: self.input_tokens + self.output_tokens,
                }),
            },
            AnthropicStreamEvent::Other => LineEvent::Noise,
        }
    }
}

// ── Anthropic API types (private) ───────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<AnthropicBlock>,
    usage: AnthropicUsage,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicStreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: AnthropicStreamMessage },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: AnthropicDelta },
    #[serde(rename = "message_delta")]
    MessageDelta {
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamMessage {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ChatMessage;

    #[test]
    fn test_system_message_extracted() {
        let adapter = AnthropicAdapter::new();
        let request = NormalizedRequest::new(
            ProviderKind::Anthropic,
            vec![
                ChatMessage::system("You are a helpful assistant."),
                ChatMessage::user("Hello!"),
            ],
        );

        let body = adapter.build_request_body(&request);
        assert_eq!(body.system.as_deref(), Some("You are a helpful assistant."));
        assert_eq!(body.messages.len(), 1);
        assert_eq!(body.messages[0].role, "user");
    }

    #[test]
    fn test_default_model() {
        let adapter = AnthropicAdapter::new();
        let request =
            NormalizedRequest::new(ProviderKind::Anthropic, vec![ChatMessage::user("hi")]);
        let body = adapter.build_request_body(&request);
        assert_eq!(body.model, "claude-sonnet-4-20250514");
    }

    #[test]
    fn test_parse_response_maps_usage() {
        let adapter = AnthropicAdapter::new();
        let api_resp = AnthropicResponse {
            model: "claude-sonnet-4-20250514".to_string(),
            content: vec![AnthropicBlock::Text {
                text: "Hello! How can I help?".to_string(),
            }],
            usage: AnthropicUsage {
                input_tokens: 10,
                output_tokens: 8,
            },
        };

        let resp = adapter.parse_response(api_resp);
        assert_eq!(resp.content, "Hello! How can I help?");
        assert_eq!(resp.usage.input_tokens, 10);
        assert_eq!(resp.usage.output_tokens, 8);
        assert_eq!(resp.usage.total_tokens, 18);
        assert_eq!(resp.provider, ProviderKind::Anthropic);
    }

    #[test]
    fn test_decode_text_delta() {
        let mut decoder = AnthropicStreamDecoder::default();
        let event = decoder.decode(
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
        );
        assert_eq!(event, LineEvent::Fragment("Hel".to_string()));
    }

    #[test]
    fn test_decode_message_stop_with_usage() {
        let mut decoder = AnthropicStreamDecoder::default();
        assert_eq!(
            decoder.decode(
                r#"data: {"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":1}}}"#
            ),
            LineEvent::Noise
        );
        assert_eq!(
            decoder.decode(
                r#"data: {"type":"message_delta","usage":{"output_tokens":9}}"#
            ),
            LineEvent::Noise
        );
        match decoder.decode(r#"data: {"type":"message_stop"}"#) {
            LineEvent::Terminal { usage: Some(usage) } => {
                assert_eq!(usage.input_tokens, 12);
                assert_eq!(usage.output_tokens, 9);
                assert_eq!(usage.total_tokens, 21);
            }
            other => panic!("expected terminal with usage, got {other:?}"),
        }
    }

    #[test]
    fn test_event_lines_and_pings_are_noise() {
        let mut decoder = AnthropicStreamDecoder::default();
        assert_eq!(
            decoder.decode("event: content_block_delta"),
            LineEvent::Noise
        );
        assert_eq!(
            decoder.decode(r#"data: {"type":"ping"}"#),
            LineEvent::Noise
        );
        assert_eq!(decoder.decode("not sse at all"), LineEvent::Noise);
    }
}
