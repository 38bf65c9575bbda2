//! Rewrite coordinator — regenerate an assistant message in place.
//!
//! A rewrite reissues a generation for an existing message id against the
//! same upstream context: the conversation history up to and including the
//! most recent user message *chronologically* preceding the target (not
//! positionally — reordering and deduplication can change position).
//!
//! Successful rewrites record a content variation against the original
//! message id rather than overwriting history; which variation is "active"
//! is conversation-store state, not ours. Concurrency, the slow-generation
//! deadline, and cancellation all ride on the session's generation pump,
//! so a rewrite is rejected while any generation is active in the same
//! conversation.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::message::{ChatMessage, Message, MessageId, MessageState, Role};
use crate::session::{ChatSession, GenerationEvent, GenerationTarget, SessionError};

/// Coordinates regeneration of existing assistant messages.
pub struct RewriteCoordinator {
    session: Arc<ChatSession>,
}

impl RewriteCoordinator {
    pub fn new(session: Arc<ChatSession>) -> Self {
        Self { session }
    }

    /// Regenerate the content of `message_id`.
    ///
    /// Rejected synchronously when the target is unknown, when no user
    /// message precedes it, or when its conversation already has an
    /// outstanding generation (a second rewrite is rejected, not queued).
    pub async fn rewrite(
        &self,
        message_id: &MessageId,
    ) -> Result<mpsc::Receiver<GenerationEvent>, SessionError> {
        let target = self
            .session
            .lifecycle()
            .get(message_id)
            .ok_or_else(|| SessionError::UnknownMessage(message_id.clone()))?;

        if target.state.is_streaming() {
            return Err(SessionError::GenerationInProgress(
                target.conversation_id.clone(),
            ));
        }

        let context = self.rebuild_context(&target).await?;
        debug!(
            message_id = %message_id,
            context_len = context.len(),
            "starting rewrite"
        );

        self.session
            .start_generation(Self::prepare_target(target), context, true)
            .await
    }

    /// Abort the rewrite (or any generation) driving `message_id`; the
    /// message lands in `cancelled` with its partial content.
    pub fn cancel(&self, message_id: &MessageId) -> Result<(), SessionError> {
        self.session.cancel(message_id)
    }

    /// Context up to and including the most recent user message that was
    /// created before the target.
    async fn rebuild_context(&self, target: &Message) -> Result<Vec<ChatMessage>, SessionError> {
        let history = self
            .session
            .store()
            .list_messages(&target.conversation_id)
            .await?;

        let anchor = history
            .iter()
            .filter(|m| m.role == Role::User && m.created_at < target.created_at)
            .max_by_key(|m| m.created_at)
            .ok_or_else(|| SessionError::NoPrecedingUser(target.id.clone()))?;
        let anchor_at = anchor.created_at;

        Ok(history
            .iter()
            .filter(|m| m.created_at <= anchor_at && m.id != target.id)
            .filter(|m| m.state.is_terminal() && !m.content.is_empty())
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect())
    }

    /// Choose how the pump acquires the target record.
    ///
    /// Failed and cancelled targets retry in place via the lifecycle's
    /// restart edge. A completed target may not legally return to
    /// streaming, so it is replaced by a fresh idle record under the same
    /// id; its previous content is already history in the store. The
    /// lifecycle map is not touched here — the session applies the target
    /// only once the generation slot is held, so a rejected rewrite leaves
    /// the record intact.
    fn prepare_target(target: Message) -> GenerationTarget {
        match target.state {
            MessageState::Error { .. } | MessageState::Cancelled { .. } => {
                GenerationTarget::Existing(target.id)
            }
            _ => {
                let mut fresh = target;
                fresh.content = String::new();
                fresh.usage = None;
                fresh.state = MessageState::Idle;
                GenerationTarget::Replace(Box::new(fresh))
            }
        }
    }
}
