//! Conversation-store collaborator interface.
//!
//! The pipeline requires exactly four operations from the long-term store
//! and assumes nothing about its query language or schema. Create is
//! idempotent on message id — that, plus client-generated stable ids, is
//! what makes the delivery queue's at-least-once retries safe.

use crate::BoxFuture;
use crate::message::{Message, MessageId, MessageState};

/// Errors from the external conversation store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store is unreachable or the write failed; worth retrying.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the operation; retrying will not help.
    #[error("store rejected operation: {0}")]
    Rejected(String),

    #[error("unknown message: {0}")]
    UnknownMessage(MessageId),
}

impl StoreError {
    pub fn retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// External append-only record store with per-conversation ordering.
pub trait ConversationStore: Send + Sync {
    /// Persist a message. Idempotent on `message.id`: re-creating an
    /// existing id updates it in place rather than duplicating it.
    fn create_message(&self, message: &Message) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Update content and state of an existing message. Delivery and
    /// retry go through the idempotent `create_message`; the pipeline
    /// calls this to push a post-completion persistence failure onto a
    /// record an earlier delivery already created.
    fn update_message(
        &self,
        id: &MessageId,
        content: &str,
        state: &MessageState,
    ) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Messages of a conversation in creation order.
    fn list_messages(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'_, Result<Vec<Message>, StoreError>>;

    /// Record an alternate generated body for an existing message. Which
    /// variation is "active" is the store's state, not ours.
    fn create_variation(
        &self,
        parent: &MessageId,
        content: &str,
    ) -> BoxFuture<'_, Result<(), StoreError>>;
}
