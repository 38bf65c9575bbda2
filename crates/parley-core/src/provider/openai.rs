//! OpenAI-compatible chat-completion adapter.
//!
//! Implements [`ProviderAdapter`] for OpenAI's Chat Completions API. Also
//! compatible with any endpoint that follows the OpenAI API format
//! (e.g. Ollama, vLLM, Together AI) via [`OpenAiAdapter::with_base_url`].
//!
//! Streaming uses the `data: {json}` event-per-line encoding terminated by
//! the literal `data: [DONE]`.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use parley_config::ProviderKind;

use crate::BoxFuture;
use crate::message::{DeltaEvent, NormalizedRequest, NormalizedResponse, TokenUsage};
use crate::stream::{LineEvent, StreamNormalizer};

use super::adapter::{DeltaReceiver, ProviderAdapter, ProviderError};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const STREAM_DATA_PREFIX: &str = "data:";
const STREAM_DONE_MARKER: &str = "[DONE]";

/// OpenAI-compatible provider adapter.
pub struct OpenAiAdapter {
    client: Client,
    base_url: String,
    default_model: String,
}

impl OpenAiAdapter {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: OPENAI_API_URL.to_string(),
            default_model: "gpt-4o".to_string(),
        }
    }

    /// Set the model used when a request does not name one.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Point the adapter at an OpenAI-compatible endpoint.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Convert a normalized request into OpenAI's API format.
    fn build_request_body(&self, request: &NormalizedRequest) -> OpenAiRequest {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        // OpenAI takes system messages inline, no extraction needed.
        let messages = request
            .messages
            .iter()
            .map(|m| OpenAiMessage {
                role: m.role.as_str().to_string(),
                content: Some(m.content.clone()),
            })
            .collect();

        OpenAiRequest {
            model,
            messages,
            max_tokens: Some(request.max_tokens),
            temperature: Some(request.temperature),
            stream: None,
            stream_options: None,
        }
    }

    async fn post(
        &self,
        body: &OpenAiRequest,
        request: &NormalizedRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut builder = self
            .client
            .post(&self.base_url)
            .header("content-type", "application/json");
        if let Some(ref credential) = request.credential {
            builder = builder.header("authorization", format!("Bearer {}", credential.expose()));
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
                provider: ProviderKind::OpenAi,
                status,
                message,
            });
        }
        Ok(resp)
    }

    /// Parse OpenAI's response into the normalized contract.
    fn parse_response(&self, resp: OpenAiResponse) -> Result<NormalizedResponse, ProviderError> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Parse("no choices in response".to_string()))?;

        Ok(NormalizedResponse {
            content: choice.message.content.unwrap_or_default(),
            usage: resp.usage.map(TokenUsage::from).unwrap_or_default(),
            model: resp.model,
            provider: ProviderKind::OpenAi,
        })
    }
}

impl Default for OpenAiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn name(&self) -> &str {
        "OpenAI"
    }

    fn send(
        &self,
        request: &NormalizedRequest,
    ) -> BoxFuture<'_, Result<NormalizedResponse, ProviderError>> {
        let body = self.build_request_body(request);
        let request = request.clone();
        Box::pin(async move {
            debug!(model = %body.model, "OpenAI chat request");
            let resp = self.post(&body, &request).await?;
            let api_resp: OpenAiResponse = resp
                .json()
                .await
                .map_err(|e| ProviderError::Parse(e.to_string()))?;
            self.parse_response(api_resp)
        })
    }

    fn send_streaming(
        &self,
        request: &NormalizedRequest,
    ) -> BoxFuture<'_, Result<DeltaReceiver, ProviderError>> {
        let mut body = self.build_request_body(request);
        body.stream = Some(true);
        body.stream_options = Some(OpenAiStreamOptions {
            include_usage: true,
        });
        let request = request.clone();
        Box::pin(async move {
            debug!(model = %body.model, "OpenAI streaming chat request");
            let mut resp = self.post(&body, &request).await?;

            let (tx, rx) = tokio::sync::mpsc::channel(64);
            tokio::spawn(async move {
                let mut decoder = OpenAiStreamDecoder::default();
                let mut normalizer = StreamNormalizer::new(move |line: &str| decoder.decode(line));
                loop {
                    match resp.chunk().await {
                        Ok(Some(bytes)) => {
                            for event in normalizer.feed(&bytes) {
                                let done = matches!(event, DeltaEvent::Done { .. });
                                if tx.send(Ok(event)).await.is_err() {
                                    // Consumer dropped the receiver (cancel);
                                    // stop reading to abort the upstream call.
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

/// Line decoder for OpenAI's streaming encoding.
///
/// Usage arrives on the final data chunk (with `stream_options.include_usage`)
/// before the `[DONE]` marker, so the decoder holds it until the terminal.
#[derive(Default)]
struct OpenAiStreamDecoder {
    pending_usage: Option<TokenUsage>,
}

impl OpenAiStreamDecoder {
    fn decode(&mut self, line: &str) -> LineEvent {
        let Some(payload) = line.strip_prefix(STREAM_DATA_PREFIX) else {
            return LineEvent::Noise;
        };
        let payload = payload.trim();
        if payload == STREAM_DONE_MARKER {
            return LineEvent::Terminal {
                usage: self.pending_usage.take(),
            };
        }
        let Ok(chunk) = serde_json::from_str::<OpenAiStreamChunk>(payload) else {
            return LineEvent::Noise;
        };
        if let Some(usage) = chunk.usage {
            self.pending_usage = Some(usage.into());
        }
        match chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
        {
            Some(text) if !text.is_empty() => LineEvent::Fragment(text),
            _ => LineEvent::Noise,
        }
    }
}

// ── OpenAI API types (private) ──────────────────────────────────────────

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<OpenAiStreamOptions>,
}

#[derive(Debug, Serialize)]
struct OpenAiStreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<OpenAiUsage> for TokenUsage {
    fn from(u: OpenAiUsage) -> Self {
        TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiStreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
}
