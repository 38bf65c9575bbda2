//! Provider integration — normalized chat completions over heterogeneous
//! upstream APIs.
//!
//! Each upstream provider gets one [`ProviderAdapter`] implementation that
//! owns the full translation between the normalized contract and that
//! provider's wire format. The [`AdapterRegistry`] maps a [`ProviderKind`]
//! to its adapter and default model and is the single extension point for
//! adding providers.
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐
//! │ ChatGateway │────▶│ ProviderAdapter │  (trait)
//! └─────────────┘     └───────┬─────────┘
//!                             │
//!               ┌─────────────┼─────────────┐
//!               ▼             ▼             ▼
//!      ┌──────────────┐ ┌───────────┐ ┌──────────┐
//!      │    OpenAI    │ │ Anthropic │ │  Custom  │
//!      │ (Chat Compl.)│ │ (Messages)│ │ (future) │
//!      └──────────────┘ └───────────┘ └──────────┘
//! ```
//!
//! [`ProviderKind`]: parley_config::ProviderKind

pub mod adapter;
pub mod anthropic;
pub mod openai;
pub mod registry;

pub use adapter::{DeltaReceiver, ProviderAdapter, ProviderError};
pub use anthropic::AnthropicAdapter;
pub use openai::OpenAiAdapter;
pub use registry::AdapterRegistry;
