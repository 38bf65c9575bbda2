#![deny(unsafe_code)]

//! Parley core — the multi-provider chat delivery pipeline.
//!
//! Normalizes heterogeneous chat-completion APIs behind one adapter
//! contract, drives each message through a validated lifecycle state
//! machine, and guarantees durable delivery of finished messages through
//! a retrying queue. The UI and the long-term conversation store are
//! external collaborators reached through the traits in [`gateway`] and
//! [`storage`].
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐    ┌─────────────┐    ┌──────────────┐
//! │ ChatSession│───▶│ ChatGateway │───▶│AdapterRegistry│
//! └─────┬──────┘    └─────────────┘    └──────┬───────┘
//!       │                                     │
//!       ▼                            ┌────────┼────────┐
//! ┌──────────────┐                   ▼        ▼        ▼
//! │MessageLifecycle│            ┌────────┐┌─────────┐┌────────┐
//! └─────┬──────────┘            │ OpenAI ││Anthropic││ Custom │
//!       ▼                       └────────┘└─────────┘└────────┘
//! ┌──────────────┐
//! │ DeliveryQueue │───▶ ConversationStore (external)
//! └──────────────┘
//! ```

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future — the standard return type for
/// async trait methods that require dynamic dispatch (`dyn Trait`).
///
/// Native `async fn` in traits produces opaque return types that are not
/// object-safe. Traits consumed via `Box<dyn Trait>` or `Arc<dyn Trait>`
/// must return a concrete `Pin<Box<dyn Future>>` instead. This alias keeps
/// those signatures readable.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Credential resolution and normalized dispatch to provider adapters.
pub mod gateway;
/// Validated per-message state machine and single-writer content map.
pub mod lifecycle;
/// Tracing subscriber initialisation from config.
pub mod logging;
/// Normalized chat data model: messages, states, delta events.
pub mod message;
/// Provider adapters and the adapter registry.
pub mod provider;
/// Durable, retrying delivery queue for finished messages.
pub mod queue;
/// Regeneration of an existing assistant message against its context.
pub mod rewrite;
/// UI-facing facade: submit, cancel, and the generation event stream.
pub mod session;
/// External conversation-store collaborator interface.
pub mod storage;
/// Provider-agnostic streaming line normalizer.
pub mod stream;

pub use gateway::{CallerContext, ChatGateway, Credential, CredentialStore, GatewayError};
pub use lifecycle::{LifecycleError, MessageLifecycle};
pub use message::{
    ChatMessage, DeltaEvent, Message, MessageId, MessageState, NormalizedRequest,
    NormalizedResponse, Role, TokenUsage,
};
pub use provider::{AdapterRegistry, ProviderAdapter, ProviderError};
pub use queue::{DeliveryQueue, QueuedDelivery};
pub use rewrite::RewriteCoordinator;
pub use session::{ChatSession, GenerationEvent, SessionError, persistence_failure_hook};
pub use storage::{ConversationStore, StoreError};
