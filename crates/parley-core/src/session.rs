//! UI-facing chat session facade.
//!
//! [`ChatSession`] wires the gateway, lifecycle machine, and delivery
//! queue into the surface the UI consumes: `submit`, `cancel`, and one
//! event channel per generation yielding tagged [`GenerationEvent`]s.
//! A single channel replaces separate delta/completion/error callback
//! paths, which also gives the pump exactly one cancellation point.
//!
//! The session owns the generation pump shared with the rewrite
//! coordinator: deltas are applied to the lifecycle map in upstream order,
//! the terminal outcome is decided exactly once, and the finished record
//! is handed to the delivery queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use parley_config::ProviderKind;

use crate::gateway::{CallerContext, ChatGateway, GatewayError};
use crate::lifecycle::{LifecycleError, MessageLifecycle};
use crate::message::{
    ChatMessage, DeltaEvent, Message, MessageId, MessageState, NormalizedRequest,
};
use crate::queue::{DeadLetterHook, DeliveryQueue, QueueError};
use crate::storage::{ConversationStore, StoreError};

/// Events emitted on a generation's channel, in order of occurrence.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// A text fragment was appended to the message.
    Delta { message_id: MessageId, text: String },
    /// The message changed lifecycle state.
    StateChanged {
        message_id: MessageId,
        state: MessageState,
    },
    /// No terminal outcome within the deadline; the generation keeps
    /// running, this is advisory only.
    SlowGeneration { message_id: MessageId },
}

/// Errors surfaced synchronously by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Only one generation may stream per conversation at a time.
    #[error("a generation is already active in conversation {0}")]
    GenerationInProgress(String),

    #[error("unknown message: {0}")]
    UnknownMessage(MessageId),

    /// Rewrite target has no chronologically preceding user message to
    /// rebuild context from.
    #[error("no user message precedes {0}")]
    NoPrecedingUser(MessageId),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Dead-letter hook flipping a message whose persistence retries were
/// exhausted into the documented `completed -> error` state, so the
/// failure becomes visible instead of vanishing with the entry.
///
/// Besides the in-memory flip, the error state is pushed to the store via
/// [`ConversationStore::update_message`] on a best-effort basis, covering
/// the case where the record was created by an earlier delivery and a
/// later re-delivery of the same id exhausted its retries.
pub fn persistence_failure_hook(
    lifecycle: Arc<MessageLifecycle>,
    store: Arc<dyn ConversationStore>,
) -> DeadLetterHook {
    Box::new(move |letter| {
        let id = letter.entry.message.id.clone();
        let state = MessageState::Error {
            message: format!("persistence failed: {}", letter.error),
            retryable: false,
        };
        if let Err(err) = lifecycle.set_state(&id, state.clone()) {
            warn!(message_id = %id, %err, "could not surface persistence failure");
            return;
        }
        let store = Arc::clone(&store);
        let content = letter.entry.message.content.clone();
        tokio::spawn(async move {
            if let Err(err) = store.update_message(&id, &content, &state).await {
                debug!(message_id = %id, %err, "store still unavailable for error-state update");
            }
        });
    })
}

struct ActiveGeneration {
    message_id: MessageId,
    cancel: Arc<Notify>,
}

/// How a generation acquires its lifecycle record.
///
/// All variants are applied only after the conversation's generation slot
/// is held and the upstream call was accepted, so a rejected generation
/// never mutates tracked state.
pub(crate) enum GenerationTarget {
    /// Insert a fresh record (initial send).
    Fresh(Box<Message>),
    /// Replace an already-tracked record with a fresh idle clone under the
    /// same id (rewrite of a completed message).
    Replace(Box<Message>),
    /// Drive an already-tracked record in place (retry of a failed or
    /// cancelled generation).
    Existing(MessageId),
}

/// One user's chat surface over the delivery pipeline.
pub struct ChatSession {
    gateway: Arc<ChatGateway>,
    lifecycle: Arc<MessageLifecycle>,
    queue: Arc<DeliveryQueue>,
    store: Arc<dyn ConversationStore>,
    caller: CallerContext,
    provider: ProviderKind,
    deadline: Duration,
    active: Arc<Mutex<HashMap<String, ActiveGeneration>>>,
}

impl ChatSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<ChatGateway>,
        lifecycle: Arc<MessageLifecycle>,
        queue: Arc<DeliveryQueue>,
        store: Arc<dyn ConversationStore>,
        caller: CallerContext,
        provider: ProviderKind,
        deadline: Duration,
    ) -> Self {
        Self {
            gateway,
            lifecycle,
            queue,
            store,
            caller,
            provider,
            deadline,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn lifecycle(&self) -> &Arc<MessageLifecycle> {
        &self.lifecycle
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Seed the lifecycle map with a message loaded from the store, so it
    /// can be targeted by rewrite/cancel after a reload.
    pub fn track(&self, message: Message) -> Result<(), LifecycleError> {
        self.lifecycle.insert(message)
    }

    /// Send a user message and start generating the assistant reply.
    ///
    /// Returns the new assistant message id and the generation's event
    /// channel. Rejected synchronously if the conversation already has an
    /// active generation.
    pub async fn submit(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<(MessageId, mpsc::Receiver<GenerationEvent>), SessionError> {
        // Early slot check so a rejected submit does not enqueue its user
        // message; start_generation re-checks authoritatively.
        if self
            .active
            .lock()
            .expect("session lock poisoned")
            .contains_key(conversation_id)
        {
            return Err(SessionError::GenerationInProgress(
                conversation_id.to_string(),
            ));
        }

        let model = self
            .gateway
            .default_model(self.provider)
            .unwrap_or_default()
            .to_string();

        let mut context = self.context_for(conversation_id).await?;
        context.push(ChatMessage::user(text));

        // The user message is durably delivered through the queue like any
        // other finished record.
        let user_message = Message::from_user(conversation_id, text, self.provider, &model);
        self.queue.enqueue(user_message)?;

        let message = Message::pending_assistant(conversation_id, self.provider, &model);
        let id = message.id.clone();
        let rx = self
            .start_generation(GenerationTarget::Fresh(Box::new(message)), context, false)
            .await?;
        Ok((id, rx))
    }

    /// Cancel the generation driving `message_id`.
    ///
    /// The upstream network call is aborted and the message lands in
    /// `cancelled` with its partial content; no further delta is applied
    /// afterward.
    pub fn cancel(&self, message_id: &MessageId) -> Result<(), SessionError> {
        let active = self.active.lock().expect("session lock poisoned");
        let generation = active
            .values()
            .find(|g| &g.message_id == message_id)
            .ok_or_else(|| SessionError::UnknownMessage(message_id.clone()))?;
        generation.cancel.notify_one();
        Ok(())
    }

    /// Cancel every outstanding generation of this session.
    pub fn cancel_all(&self) {
        let active = self.active.lock().expect("session lock poisoned");
        for generation in active.values() {
            generation.cancel.notify_one();
        }
    }

    /// Conversation history as normalized context, in creation order.
    /// Only terminal messages with content participate; an in-flight or
    /// empty record is not upstream context.
    pub(crate) async fn context_for(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ChatMessage>, SessionError> {
        let history = self.store.list_messages(conversation_id).await?;
        Ok(history
            .iter()
            .filter(|m| m.state.is_terminal() && !m.content.is_empty())
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect())
    }

    /// Start one generation: acquire the per-conversation slot, dispatch
    /// through the gateway, and spawn the pump task.
    ///
    /// `record_variation` makes a successful outcome also record a content
    /// variation against the message id (the rewrite path).
    pub(crate) async fn start_generation(
        &self,
        target: GenerationTarget,
        context: Vec<ChatMessage>,
        record_variation: bool,
    ) -> Result<mpsc::Receiver<GenerationEvent>, SessionError> {
        let (id, conversation_id) = match &target {
            GenerationTarget::Fresh(message) | GenerationTarget::Replace(message) => {
                (message.id.clone(), message.conversation_id.clone())
            }
            GenerationTarget::Existing(id) => {
                let message = self
                    .lifecycle
                    .get(id)
                    .ok_or_else(|| SessionError::UnknownMessage(id.clone()))?;
                (id.clone(), message.conversation_id)
            }
        };

        let cancel = Arc::new(Notify::new());
        {
            let mut active = self.active.lock().expect("session lock poisoned");
            if active.contains_key(&conversation_id)
                || self
                    .lifecycle
                    .streaming_in_conversation(&conversation_id)
                    .is_some()
            {
                // Nothing was touched yet: a rejected generation leaves the
                // lifecycle map exactly as it was.
                return Err(SessionError::GenerationInProgress(conversation_id));
            }
            active.insert(
                conversation_id.clone(),
                ActiveGeneration {
                    message_id: id.clone(),
                    cancel: Arc::clone(&cancel),
                },
            );
        }

        let request = NormalizedRequest::new(self.provider, context).streaming();
        let dispatched = self.gateway.send_streaming(&self.caller, request).await;
        let delta_rx = match dispatched {
            Ok(rx) => rx,
            Err(err) => {
                // Never accepted: only the slot needs releasing.
                self.release(&conversation_id);
                return Err(err.into());
            }
        };

        // Slot held and upstream accepted: now apply the target to the
        // lifecycle map.
        let activated = match target {
            GenerationTarget::Fresh(message) => self
                .lifecycle
                .insert(*message)
                .and_then(|()| self.mark_streaming(&id)),
            GenerationTarget::Replace(message) => {
                self.lifecycle.remove(&id);
                self.lifecycle
                    .insert(*message)
                    .and_then(|()| self.mark_streaming(&id))
            }
            GenerationTarget::Existing(_) => self.mark_streaming(&id),
        };
        if let Err(err) = activated {
            self.release(&conversation_id);
            return Err(err.into());
        }
        let (event_tx, event_rx) = mpsc::channel(64);
        let _ = event_tx
            .send(GenerationEvent::StateChanged {
                message_id: id.clone(),
                state: MessageState::Streaming { received: 0 },
            })
            .await;

        let pump = GenerationPump {
            lifecycle: Arc::clone(&self.lifecycle),
            queue: Arc::clone(&self.queue),
            store: Arc::clone(&self.store),
            active: Arc::clone(&self.active),
            conversation_id,
            id,
            cancel,
            deadline: self.deadline,
            record_variation,
        };
        tokio::spawn(pump.run(delta_rx, event_tx));
        Ok(event_rx)
    }

    /// Transition a record into streaming, clearing stale content when
    /// retrying a failed or cancelled generation.
    fn mark_streaming(&self, id: &MessageId) -> Result<(), LifecycleError> {
        match self.lifecycle.get_state(id) {
            Some(MessageState::Error { .. }) | Some(MessageState::Cancelled { .. }) => {
                self.lifecycle.restart(id)
            }
            _ => self
                .lifecycle
                .set_state(id, MessageState::Streaming { received: 0 }),
        }
    }

    fn release(&self, conversation_id: &str) {
        self.active
            .lock()
            .expect("session lock poisoned")
            .remove(conversation_id);
    }
}

/// State carried by the spawned per-generation task.
struct GenerationPump {
    lifecycle: Arc<MessageLifecycle>,
    queue: Arc<DeliveryQueue>,
    store: Arc<dyn ConversationStore>,
    active: Arc<Mutex<HashMap<String, ActiveGeneration>>>,
    conversation_id: String,
    id: MessageId,
    cancel: Arc<Notify>,
    deadline: Duration,
    record_variation: bool,
}

impl GenerationPump {
    async fn run(
        self,
        mut delta_rx: crate::provider::DeltaReceiver,
        events: mpsc::Sender<GenerationEvent>,
    ) {
        let slow_timer = tokio::time::sleep(self.deadline);
        tokio::pin!(slow_timer);
        let mut warned = false;

        let outcome: MessageState = loop {
            tokio::select! {
                _ = self.cancel.notified() => {
                    let partial = self
                        .lifecycle
                        .get(&self.id)
                        .map(|m| m.content)
                        .unwrap_or_default();
                    debug!(message_id = %self.id, "generation cancelled");
                    // Dropping delta_rx below aborts the upstream call.
                    break MessageState::Cancelled { partial };
                }
                _ = &mut slow_timer, if !warned => {
                    warned = true;
                    warn!(message_id = %self.id, "generation exceeded deadline, still running");
                    let _ = events
                        .send(GenerationEvent::SlowGeneration {
                            message_id: self.id.clone(),
                        })
                        .await;
                }
                received = delta_rx.recv() => match received {
                    Some(Ok(DeltaEvent::Fragment(text))) => {
                        if let Err(err) = self.lifecycle.append_content(&self.id, &text) {
                            // Terminal state raced the stream; stop applying.
                            warn!(message_id = %self.id, %err, "dropping late delta");
                            return self.finish(events).await;
                        }
                        let _ = events
                            .send(GenerationEvent::Delta {
                                message_id: self.id.clone(),
                                text,
                            })
                            .await;
                    }
                    Some(Ok(DeltaEvent::Done { usage })) => {
                        break MessageState::Completed {
                            usage: usage.unwrap_or_default(),
                        };
                    }
                    Some(Err(err)) => {
                        break MessageState::Error {
                            message: err.to_string(),
                            retryable: err.retryable(),
                        };
                    }
                    // Adapter task died without a terminal event; partial
                    // content is preserved and offered for persistence.
                    None => {
                        break MessageState::Error {
                            message: "stream ended unexpectedly".to_string(),
                            retryable: true,
                        };
                    }
                }
            }
        };
        drop(delta_rx);

        if let Err(err) = self.lifecycle.set_state(&self.id, outcome.clone()) {
            warn!(message_id = %self.id, %err, "failed to finalize generation state");
            return self.finish(events).await;
        }

        if self.record_variation
            && let MessageState::Completed { .. } = &outcome
            && let Some(message) = self.lifecycle.get(&self.id)
            && let Err(err) = self.store.create_variation(&self.id, &message.content).await
        {
            warn!(message_id = %self.id, %err, "failed to record rewrite variation");
        }

        if let Some(message) = self.lifecycle.get(&self.id) {
            if let Err(err) = self.queue.enqueue(message) {
                warn!(message_id = %self.id, %err, "failed to enqueue finished message");
            }
        }

        let _ = events
            .send(GenerationEvent::StateChanged {
                message_id: self.id.clone(),
                state: outcome,
            })
            .await;
        self.finish(events).await;
    }

    async fn finish(&self, _events: mpsc::Sender<GenerationEvent>) {
        self.active
            .lock()
            .expect("session lock poisoned")
            .remove(&self.conversation_id);
    }
}
