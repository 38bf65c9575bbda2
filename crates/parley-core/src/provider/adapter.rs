//! Provider adapter trait — the core abstraction for chat completions.
//!
//! Every upstream backend implements this trait; the gateway dispatches
//! through it and never sees a provider-specific request or error shape.

use parley_config::ProviderKind;

use crate::BoxFuture;
use crate::message::{DeltaEvent, NormalizedRequest, NormalizedResponse};

/// Errors from provider adapter calls.
///
/// Adapters never retry internally — retry is a delivery-queue and
/// user-action concern, and silent adapter retries would duplicate
/// upstream billing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Non-success upstream status, with the raw upstream message.
    #[error("{provider} returned {status}: {message}")]
    Upstream {
        provider: ProviderKind,
        status: u16,
        message: String,
    },

    /// Connection-level failure before or during a call.
    #[error("network error: {0}")]
    Network(String),

    /// Upstream body did not match the provider's documented schema.
    #[error("response parse error: {0}")]
    Parse(String),

    /// Streaming transport closed without ever emitting its terminal
    /// marker. The generation is failed, not empty-successful.
    #[error("stream closed without terminal marker")]
    MissingTerminal,
}

impl ProviderError {
    /// Whether a retry of the same request could plausibly succeed.
    ///
    /// Server-side and transport failures are retryable; client errors
    /// (bad request, auth, not found) are not.
    pub fn retryable(&self) -> bool {
        match self {
            ProviderError::Upstream { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Network(_) => true,
            ProviderError::MissingTerminal => true,
            ProviderError::Parse(_) => false,
        }
    }
}

/// Result stream handed to streaming consumers: fragments in upstream
/// order, then exactly one `Done`, or an error event ending the stream.
pub type DeltaReceiver = tokio::sync::mpsc::Receiver<Result<DeltaEvent, ProviderError>>;

/// One upstream chat-completion backend.
///
/// Implementations own the full mapping between the normalized contract
/// and their provider's wire format: request body shape, authentication
/// headers, streaming line encoding, and usage-field names. They must be
/// `Send + Sync` for shared use behind `Arc`, and use [`BoxFuture`] for
/// object safety.
pub trait ProviderAdapter: Send + Sync {
    /// Provider this adapter serves.
    fn kind(&self) -> ProviderKind;

    /// Provider display name (e.g. "OpenAI", "Anthropic").
    fn name(&self) -> &str;

    /// Perform a complete (non-streaming) chat completion.
    fn send(
        &self,
        request: &NormalizedRequest,
    ) -> BoxFuture<'_, Result<NormalizedResponse, ProviderError>>;

    /// Perform a streaming chat completion.
    ///
    /// Pre-stream failures (connection refused, non-success status) are
    /// returned as `Err`; failures after streaming has begun arrive as an
    /// error event on the receiver.
    fn send_streaming(
        &self,
        request: &NormalizedRequest,
    ) -> BoxFuture<'_, Result<DeltaReceiver, ProviderError>>;
}
