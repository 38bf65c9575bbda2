//! Recording conversation store and static credential fixtures.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use parley_config::ProviderKind;
use parley_core::gateway::{Credential, CredentialStore};
use parley_core::storage::{ConversationStore, StoreError};
use parley_core::{BoxFuture, Message, MessageId, MessageState};

/// In-memory [`ConversationStore`] that records every call and can inject
/// a burst of create failures (for delivery-queue retry tests).
///
/// Honors the real store contract: `create_message` is idempotent on id,
/// and `list_messages` returns creation order.
#[derive(Default)]
pub struct RecordingStore {
    messages: Mutex<Vec<Message>>,
    variations: Mutex<Vec<(MessageId, String)>>,
    fail_creates: AtomicU32,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` `create_message` calls fail as unavailable.
    pub fn fail_next_creates(&self, n: u32) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    /// Preload a message as existing history.
    pub fn seed(&self, message: Message) {
        let mut messages = self.messages.lock().expect("store lock poisoned");
        messages.push(message);
        messages.sort_by_key(|m| m.created_at);
    }

    /// All persisted messages, in insertion order.
    pub fn persisted(&self) -> Vec<Message> {
        self.messages.lock().expect("store lock poisoned").clone()
    }

    /// Recorded variations as (parent id, content).
    pub fn variations(&self) -> Vec<(MessageId, String)> {
        self.variations.lock().expect("store lock poisoned").clone()
    }
}

impl ConversationStore for RecordingStore {
    fn create_message(&self, message: &Message) -> BoxFuture<'_, Result<(), StoreError>> {
        let message = message.clone();
        Box::pin(async move {
            let remaining = self.fail_creates.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_creates.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("injected failure".to_string()));
            }
            let mut messages = self.messages.lock().expect("store lock poisoned");
            if let Some(existing) = messages.iter_mut().find(|m| m.id == message.id) {
                *existing = message;
            } else {
                messages.push(message);
            }
            Ok(())
        })
    }

    fn update_message(
        &self,
        id: &MessageId,
        content: &str,
        state: &MessageState,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let id = id.clone();
        let content = content.to_string();
        let state = state.clone();
        Box::pin(async move {
            let mut messages = self.messages.lock().expect("store lock poisoned");
            let message = messages
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or(StoreError::UnknownMessage(id))?;
            message.content = content;
            message.state = state;
            Ok(())
        })
    }

    fn list_messages(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'_, Result<Vec<Message>, StoreError>> {
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            let mut messages: Vec<Message> = self
                .messages
                .lock()
                .expect("store lock poisoned")
                .iter()
                .filter(|m| m.conversation_id == conversation_id)
                .cloned()
                .collect();
            messages.sort_by_key(|m| m.created_at);
            Ok(messages)
        })
    }

    fn create_variation(
        &self,
        parent: &MessageId,
        content: &str,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let parent = parent.clone();
        let content = content.to_string();
        Box::pin(async move {
            self.variations
                .lock()
                .expect("store lock poisoned")
                .push((parent, content));
            Ok(())
        })
    }
}

/// Credential store resolving the same secret for every identity.
pub struct StaticCredentials {
    secret: String,
}

impl StaticCredentials {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl CredentialStore for StaticCredentials {
    fn resolve(&self, _identity: &str, _provider: ProviderKind) -> Option<Credential> {
        Some(Credential::new(&self.secret))
    }
}
