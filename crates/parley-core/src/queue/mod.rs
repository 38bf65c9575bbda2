//! Durable, retrying delivery queue.
//!
//! Finished messages are handed here for persistence into the external
//! conversation store. Entries survive process restarts (reloaded from the
//! [`QueueStore`] on startup), are drained head-first in enqueue order, and
//! retry with capped exponential backoff. An entry that exhausts its
//! retries is dropped to the dead-letter list and surfaced, never retried
//! forever.
//!
//! Drain triggers: immediate attempt on enqueue when connected, a periodic
//! tick, and the connectivity-restored edge.

pub mod store;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use parley_config::QueueConfig;

use crate::message::Message;
use crate::storage::ConversationStore;

pub use store::{FileQueueStore, MemoryQueueStore, QueueStore, QueueStoreError};

use std::sync::Arc;

/// Shutdown signal for the background drain task.
#[derive(Debug, Clone)]
pub struct ShutdownSignal;

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] QueueStoreError),
}

/// One undelivered message awaiting persistence.
///
/// Owned exclusively by the queue: created on enqueue, destroyed on
/// successful delivery or on exceeding `max_retries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedDelivery {
    /// Queue-entry id; equals the message id, which is what makes enqueue
    /// idempotent.
    pub id: String,
    pub message: Message,
    pub enqueued_at: SystemTime,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Bumped each time the payload is replaced in place, so a delivery
    /// that was in flight during the replacement cannot complete or drop
    /// the newer payload.
    #[serde(default)]
    pub revision: u64,
}

impl QueuedDelivery {
    pub fn new(message: Message, max_retries: u32) -> Self {
        Self {
            id: message.id.as_str().to_string(),
            message,
            enqueued_at: SystemTime::now(),
            retry_count: 0,
            max_retries,
            revision: 0,
        }
    }
}

/// An entry dropped after exhausting its retries.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub entry: QueuedDelivery,
    pub error: String,
}

/// Called when an entry is dropped, so the owner can surface the failure
/// (e.g. flip the message's lifecycle state to a persistence error).
pub type DeadLetterHook = Box<dyn Fn(&DeadLetter) + Send + Sync>;

/// The durable delivery queue.
pub struct DeliveryQueue {
    config: QueueConfig,
    store: Box<dyn QueueStore>,
    sink: Arc<dyn ConversationStore>,
    entries: Mutex<VecDeque<QueuedDelivery>>,
    dead: Mutex<Vec<DeadLetter>>,
    dead_hook: Option<DeadLetterHook>,
    connected: watch::Sender<bool>,
    wake: Notify,
}

impl DeliveryQueue {
    /// Create a queue, reloading any entries the store still holds from a
    /// previous run.
    pub fn new(
        config: QueueConfig,
        store: Box<dyn QueueStore>,
        sink: Arc<dyn ConversationStore>,
    ) -> Result<Self, QueueError> {
        let persisted = store.load()?;
        if !persisted.is_empty() {
            info!(count = persisted.len(), "reloaded undelivered queue entries");
        }
        let (connected, _) = watch::channel(true);
        Ok(Self {
            config,
            store,
            sink,
            entries: Mutex::new(persisted.into()),
            dead: Mutex::new(Vec::new()),
            dead_hook: None,
            connected,
            wake: Notify::new(),
        })
    }

    /// Install a hook invoked whenever an entry is dropped to the
    /// dead-letter list.
    pub fn with_dead_letter_hook(mut self, hook: DeadLetterHook) -> Self {
        self.dead_hook = Some(hook);
        self
    }

    /// Add a message for durable delivery. Idempotent on message id: a
    /// second enqueue before the first is drained replaces the payload in
    /// place, yielding exactly one persisted record.
    ///
    /// When the queue is at capacity the oldest entry is evicted to admit
    /// the new one — older undelivered messages are more likely stale.
    pub fn enqueue(&self, message: Message) -> Result<String, QueueError> {
        let id = message.id.as_str().to_string();
        {
            let mut entries = self.entries.lock().expect("queue lock poisoned");

            if let Some(existing) = entries.iter_mut().find(|e| e.id == id) {
                existing.message = message;
                existing.revision += 1;
                // A new payload gets its own retry allowance.
                existing.retry_count = 0;
                self.store.update(existing)?;
                debug!(entry_id = %id, "replaced payload of queued entry");
                self.wake.notify_one();
                return Ok(id);
            }

            if entries.len() >= self.config.capacity
                && let Some(evicted) = entries.pop_front()
            {
                warn!(entry_id = %evicted.id, "queue full, evicting oldest entry");
                self.store.remove(&evicted.id)?;
            }

            let entry = QueuedDelivery::new(message, self.config.max_retries);
            self.store.append(&entry)?;
            entries.push_back(entry);
        }
        self.wake.notify_one();
        Ok(id)
    }

    /// Number of entries awaiting delivery.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries dropped after exhausting their retries.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead.lock().expect("queue lock poisoned").clone()
    }

    /// Report connectivity. The restored edge triggers a drain.
    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Delay before retry number `retry_count`:
    /// `base_delay * 2^(retry_count - 1)`, capped at the configured max.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(31);
        self.config
            .base_delay()
            .saturating_mul(1u32 << exp)
            .min(self.config.max_delay())
    }

    /// Drain the queue head-first until it is empty, connectivity is lost,
    /// or a head entry is waiting out its backoff. Returns the number of
    /// entries delivered.
    ///
    /// Entries are attempted strictly in enqueue order; a stuck head is
    /// never silently reordered past, only evicted by capacity pressure or
    /// dropped after `max_retries`.
    pub async fn drain(&self) -> usize {
        let mut delivered = 0;
        loop {
            if !self.is_connected() {
                break;
            }
            let front = {
                let entries = self.entries.lock().expect("queue lock poisoned");
                entries.front().cloned()
            };
            let Some(entry) = front else { break };

            match self.sink.create_message(&entry.message).await {
                Ok(()) => {
                    if self.complete(&entry.id, entry.revision) {
                        delivered += 1;
                        debug!(entry_id = %entry.id, "queue entry delivered");
                    }
                }
                Err(err) => {
                    let retry_count = entry.retry_count + 1;
                    if retry_count > entry.max_retries {
                        self.drop_entry(entry, &err.to_string());
                    } else {
                        self.record_retry(&entry.id, entry.revision, retry_count);
                        let delay = self.backoff_delay(retry_count);
                        debug!(
                            entry_id = %entry.id,
                            retry = retry_count,
                            delay_ms = delay.as_millis() as u64,
                            "delivery failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        delivered
    }

    /// Background drain task. Runs until the shutdown signal.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<ShutdownSignal>) {
        let mut tick = tokio::time::interval(self.config.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut connectivity = self.connected.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("delivery queue stopping");
                    break;
                }
                _ = self.wake.notified() => {}
                _ = tick.tick() => {}
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if self.is_connected() {
                self.drain().await;
            }
        }
    }

    /// Remove a delivered entry, but only if its payload was not replaced
    /// while the delivery was in flight. A replaced entry stays queued so
    /// the newer payload gets its own delivery attempt.
    fn complete(&self, id: &str, revision: u64) -> bool {
        {
            let mut entries = self.entries.lock().expect("queue lock poisoned");
            match entries.iter().position(|e| e.id == id) {
                Some(pos) if entries[pos].revision == revision => {
                    entries.remove(pos);
                }
                Some(_) => {
                    debug!(entry_id = %id, "payload replaced during delivery, keeping entry");
                    return false;
                }
                None => return false,
            }
        }
        if let Err(err) = self.store.remove(id) {
            warn!(entry_id = %id, %err, "failed to remove delivered entry from store");
        }
        true
    }

    fn record_retry(&self, id: &str, revision: u64, retry_count: u32) {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.id == id && e.revision == revision)
        {
            entry.retry_count = retry_count;
            if let Err(err) = self.store.update(entry) {
                warn!(entry_id = %id, %err, "failed to persist retry count");
            }
        }
    }

    fn drop_entry(&self, entry: QueuedDelivery, error: &str) {
        {
            let mut entries = self.entries.lock().expect("queue lock poisoned");
            let Some(pos) = entries
                .iter()
                .position(|e| e.id == entry.id && e.revision == entry.revision)
            else {
                // Replaced while the failing delivery was in flight; the new
                // payload keeps its slot and retry allowance.
                return;
            };
            entries.remove(pos);
        }
        warn!(
            entry_id = %entry.id,
            retries = entry.retry_count,
            error,
            "dropping queue entry after exhausting retries"
        );
        if let Err(err) = self.store.remove(&entry.id) {
            warn!(entry_id = %entry.id, %err, "failed to remove dropped entry from store");
        }
        let letter = DeadLetter {
            entry,
            error: error.to_string(),
        };
        if let Some(ref hook) = self.dead_hook {
            hook(&letter);
        }
        self.dead.lock().expect("queue lock poisoned").push(letter);
    }
}
