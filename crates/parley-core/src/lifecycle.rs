//! Message lifecycle state machine.
//!
//! One lock-protected map keyed by message id, holding the live [`Message`]
//! records and acting as the single writer of message content. Every state
//! change goes through [`MessageLifecycle::set_state`], which validates the
//! transition table and rejects (logs, does not apply) anything illegal —
//! a rewrite racing a delete surfaces here as a rejected transition, never
//! as an inconsistent record.
//!
//! Pure in-memory bookkeeping: persistence is the delivery queue's job.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::warn;

use crate::message::{Message, MessageId, MessageState};

/// Errors from lifecycle operations. None of them mutate state.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LifecycleError {
    #[error("unknown message: {0}")]
    UnknownMessage(MessageId),

    #[error("message already tracked: {0}")]
    DuplicateMessage(MessageId),

    #[error("illegal transition {from} -> {to} for message {id}")]
    IllegalTransition {
        id: MessageId,
        from: &'static str,
        to: &'static str,
    },

    #[error("content append on non-streaming message {0}")]
    NotStreaming(MessageId),
}

/// The per-message state map. All components read generation state from
/// here; only the generation pump writes to it.
#[derive(Default)]
pub struct MessageLifecycle {
    messages: Mutex<HashMap<MessageId, Message>>,
}

impl MessageLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a message. Rejects duplicate ids.
    pub fn insert(&self, message: Message) -> Result<(), LifecycleError> {
        let mut map = self.messages.lock().expect("lifecycle lock poisoned");
        if map.contains_key(&message.id) {
            return Err(LifecycleError::DuplicateMessage(message.id.clone()));
        }
        map.insert(message.id.clone(), message);
        Ok(())
    }

    /// Apply a validated state transition.
    ///
    /// Illegal transitions are logged at `warn` and rejected without
    /// touching the record. Completing a message also records its usage.
    pub fn set_state(
        &self,
        id: &MessageId,
        next: MessageState,
    ) -> Result<(), LifecycleError> {
        let mut map = self.messages.lock().expect("lifecycle lock poisoned");
        let message = map
            .get_mut(id)
            .ok_or_else(|| LifecycleError::UnknownMessage(id.clone()))?;

        if !message.state.can_transition_to(&next) {
            let err = LifecycleError::IllegalTransition {
                id: id.clone(),
                from: message.state.name(),
                to: next.name(),
            };
            warn!(message_id = %id, from = message.state.name(), to = next.name(),
                "rejected illegal state transition");
            return Err(err);
        }

        if let MessageState::Completed { usage } = &next {
            message.usage = Some(*usage);
        }
        message.state = next;
        Ok(())
    }

    /// Append a streamed fragment to the message content.
    ///
    /// Only legal while the message is streaming; content is append-only
    /// and never truncated. Bumps the streaming progress counter.
    pub fn append_content(&self, id: &MessageId, fragment: &str) -> Result<(), LifecycleError> {
        let mut map = self.messages.lock().expect("lifecycle lock poisoned");
        let message = map
            .get_mut(id)
            .ok_or_else(|| LifecycleError::UnknownMessage(id.clone()))?;

        match message.state {
            MessageState::Streaming { received } => {
                message.content.push_str(fragment);
                message.state = MessageState::Streaming {
                    received: received + 1,
                };
                Ok(())
            }
            _ => Err(LifecycleError::NotStreaming(id.clone())),
        }
    }

    /// Prepare a tracked message for regeneration.
    ///
    /// Legal only from `error` or `cancelled` (the retry edges of the
    /// transition table): clears the working content and usage and returns
    /// the message to streaming. Cancelled partials survive in the prior
    /// state snapshot and in whatever the store already holds.
    pub fn restart(&self, id: &MessageId) -> Result<(), LifecycleError> {
        let mut map = self.messages.lock().expect("lifecycle lock poisoned");
        let message = map
            .get_mut(id)
            .ok_or_else(|| LifecycleError::UnknownMessage(id.clone()))?;

        let next = MessageState::Streaming { received: 0 };
        match message.state {
            MessageState::Error { .. } | MessageState::Cancelled { .. } => {
                message.content.clear();
                message.usage = None;
                message.state = next;
                Ok(())
            }
            _ => {
                warn!(message_id = %id, from = message.state.name(),
                    "rejected restart from non-retryable state");
                Err(LifecycleError::IllegalTransition {
                    id: id.clone(),
                    from: message.state.name(),
                    to: next.name(),
                })
            }
        }
    }

    /// Snapshot of a tracked message.
    pub fn get(&self, id: &MessageId) -> Option<Message> {
        self.messages
            .lock()
            .expect("lifecycle lock poisoned")
            .get(id)
            .cloned()
    }

    /// Current state of a tracked message.
    pub fn get_state(&self, id: &MessageId) -> Option<MessageState> {
        self.messages
            .lock()
            .expect("lifecycle lock poisoned")
            .get(id)
            .map(|m| m.state.clone())
    }

    /// All messages currently streaming — used to enforce the
    /// one-active-generation-per-conversation invariant and to detect
    /// orphaned generations after a reload.
    pub fn list_active_streaming(&self) -> Vec<MessageId> {
        self.messages
            .lock()
            .expect("lifecycle lock poisoned")
            .values()
            .filter(|m| m.state.is_streaming())
            .map(|m| m.id.clone())
            .collect()
    }

    /// The streaming message in a conversation, if any.
    pub fn streaming_in_conversation(&self, conversation_id: &str) -> Option<MessageId> {
        self.messages
            .lock()
            .expect("lifecycle lock poisoned")
            .values()
            .find(|m| m.conversation_id == conversation_id && m.state.is_streaming())
            .map(|m| m.id.clone())
    }

    /// Stop tracking a message (e.g. the gateway rejected it before it
    /// ever started streaming).
    pub fn remove(&self, id: &MessageId) -> Option<Message> {
        self.messages
            .lock()
            .expect("lifecycle lock poisoned")
            .remove(id)
    }
}
