//! Normalized chat data model shared by every pipeline component.
//!
//! These types define the provider-agnostic vocabulary: requests going out
//! through the gateway, responses and delta events coming back, and the
//! [`Message`] record the lifecycle machine and delivery queue operate on.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use parley_config::ProviderKind;

use crate::gateway::Credential;

/// Opaque message identifier.
///
/// Client-generated for new assistant messages and stable across retries,
/// which is what makes at-least-once delivery through the queue safe: the
/// conversation store deduplicates on this id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a fresh id, unique within this process and effectively
    /// unique across restarts (wall-clock nanos + process counter).
    pub fn generate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let seq = NEXT.fetch_add(1, Ordering::Relaxed);
        Self(format!("msg-{nanos:x}-{seq:x}"))
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Author role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Wire-format role name used by both upstream APIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn of upstream context in a normalized request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Token accounting reported by the upstream provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

/// A provider-agnostic chat-completion request.
///
/// Immutable once submitted to the gateway; the gateway fills in the
/// credential and default model before dispatch.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    /// Which upstream provider to dispatch to.
    pub provider: ProviderKind,
    /// Model identifier; `None` resolves to the provider's default model.
    pub model: Option<String>,
    /// Ordered conversation context.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Credential used for this call. Filled in by the gateway; adapters
    /// read it to build their authentication headers.
    pub credential: Option<Credential>,
    /// Whether the caller wants an incremental delta stream.
    pub stream: bool,
}

impl NormalizedRequest {
    pub fn new(provider: ProviderKind, messages: Vec<ChatMessage>) -> Self {
        Self {
            provider,
            model: None,
            messages,
            temperature: 0.7,
            max_tokens: 4096,
            credential: None,
            stream: false,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// A complete (non-streaming) chat-completion result.
#[derive(Debug, Clone)]
pub struct NormalizedResponse {
    /// Full generated text.
    pub content: String,
    /// Token accounting for this call.
    pub usage: TokenUsage,
    /// The model the provider actually ran.
    pub model: String,
    /// Provider that produced the response.
    pub provider: ProviderKind,
}

/// One unit of a streaming response.
///
/// A well-formed stream is zero or more `Fragment`s followed by exactly one
/// `Done`. Consumers must treat stream end without `Done` as an error, not
/// as a successful empty completion.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaEvent {
    /// An incremental text fragment, to be appended in delivery order.
    Fragment(String),
    /// Terminal marker; usage is included when the provider reports it
    /// on its final stream event.
    Done { usage: Option<TokenUsage> },
}

/// Lifecycle state of a [`Message`].
///
/// Legal transitions:
///
/// ```text
/// idle ──▶ streaming ──▶ completed ──▶ error   (persistence write failed)
///              │  ▲ ╲──▶ error ────┐
///              │  │ ╲──▶ cancelled │
///              │  └────────────────┘  (retry)
///              └──▶ streaming         (progress update)
/// ```
///
/// Everything else is rejected by [`crate::lifecycle::MessageLifecycle`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessageState {
    /// Created by a UI action; not yet accepted by the gateway.
    Idle,
    /// Generation in flight; `received` counts applied fragments.
    Streaming { received: usize },
    /// Terminal success.
    Completed { usage: TokenUsage },
    /// Terminal failure. `retryable` distinguishes transient transport
    /// failures from configuration errors.
    Error { message: String, retryable: bool },
    /// Explicitly cancelled; `partial` snapshots the content accumulated
    /// before the abort.
    Cancelled { partial: String },
}

impl MessageState {
    /// Short state name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            MessageState::Idle => "idle",
            MessageState::Streaming { .. } => "streaming",
            MessageState::Completed { .. } => "completed",
            MessageState::Error { .. } => "error",
            MessageState::Cancelled { .. } => "cancelled",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: &MessageState) -> bool {
        use MessageState::*;
        match (self, next) {
            (Idle, Streaming { .. }) => true,
            // Progress updates stay within streaming.
            (Streaming { .. }, Streaming { .. }) => true,
            (Streaming { .. }, Completed { .. }) => true,
            (Streaming { .. }, Error { .. }) => true,
            (Streaming { .. }, Cancelled { .. }) => true,
            // Retry from a failed or cancelled generation.
            (Error { .. }, Streaming { .. }) => true,
            (Cancelled { .. }, Streaming { .. }) => true,
            // A persistence write that fails after completion.
            (Completed { .. }, Error { .. }) => true,
            _ => false,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, MessageState::Streaming { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageState::Completed { .. } | MessageState::Error { .. } | MessageState::Cancelled { .. }
        )
    }
}

/// A chat message as tracked by the lifecycle machine and persisted by the
/// delivery queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: String,
    pub role: Role,
    /// Append-only while `state` is streaming; immutable once terminal.
    pub content: String,
    pub created_at: SystemTime,
    pub provider: ProviderKind,
    pub model: String,
    pub usage: Option<TokenUsage>,
    pub state: MessageState,
}

impl Message {
    /// A new, empty assistant message awaiting generation.
    pub fn pending_assistant(
        conversation_id: impl Into<String>,
        provider: ProviderKind,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            conversation_id: conversation_id.into(),
            role: Role::Assistant,
            content: String::new(),
            created_at: SystemTime::now(),
            provider,
            model: model.into(),
            usage: None,
            state: MessageState::Idle,
        }
    }

    /// A user-authored message, terminal from the start (user text is never
    /// generated, so it skips the streaming lifecycle entirely).
    pub fn from_user(
        conversation_id: impl Into<String>,
        content: impl Into<String>,
        provider: ProviderKind,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            conversation_id: conversation_id.into(),
            role: Role::User,
            content: content.into(),
            created_at: SystemTime::now(),
            provider,
            model: model.into(),
            usage: None,
            state: MessageState::Completed {
                usage: TokenUsage::default(),
            },
        }
    }
}
