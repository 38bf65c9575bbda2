//! Scripted provider adapters.
//!
//! [`ScriptedAdapter`] implements [`ProviderAdapter`] against an in-memory
//! script instead of the network, so pipeline tests can play out exact
//! delta sequences, mid-stream failures, hung streams, and slow
//! generations deterministically.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use parley_config::ProviderKind;
use parley_core::provider::{DeltaReceiver, ProviderAdapter, ProviderError};
use parley_core::{BoxFuture, DeltaEvent, NormalizedRequest, NormalizedResponse, TokenUsage};

/// One scripted streaming call.
pub struct StreamScript {
    /// Events emitted in order; a `Done` ends the stream.
    pub events: Vec<Result<DeltaEvent, ProviderError>>,
    /// Delay before each event (drives slow-generation tests).
    pub event_delay: Option<Duration>,
    /// Keep the stream open after the scripted events until notified;
    /// the stream then closes *without* a terminal event.
    pub hold_open: Option<Arc<Notify>>,
}

impl StreamScript {
    /// Fragments followed by a clean terminal.
    pub fn completing(fragments: &[&str], usage: Option<TokenUsage>) -> Self {
        let mut events: Vec<Result<DeltaEvent, ProviderError>> = fragments
            .iter()
            .map(|f| Ok(DeltaEvent::Fragment(f.to_string())))
            .collect();
        events.push(Ok(DeltaEvent::Done { usage }));
        Self {
            events,
            event_delay: None,
            hold_open: None,
        }
    }

    /// Fragments, then the transport drops without a terminal marker.
    pub fn dropping(fragments: &[&str]) -> Self {
        let mut events: Vec<Result<DeltaEvent, ProviderError>> = fragments
            .iter()
            .map(|f| Ok(DeltaEvent::Fragment(f.to_string())))
            .collect();
        events.push(Err(ProviderError::MissingTerminal));
        Self {
            events,
            event_delay: None,
            hold_open: None,
        }
    }

    /// Fragments, then the stream stays open until `release` is notified.
    pub fn hanging(fragments: &[&str], release: Arc<Notify>) -> Self {
        Self {
            events: fragments
                .iter()
                .map(|f| Ok(DeltaEvent::Fragment(f.to_string())))
                .collect(),
            event_delay: None,
            hold_open: Some(release),
        }
    }

    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = Some(delay);
        self
    }
}

/// A [`ProviderAdapter`] that replays queued [`StreamScript`]s.
///
/// Each streaming call consumes the next script; calls beyond the queue
/// complete immediately with an empty terminal. The call counter and
/// recorded requests let tests assert exactly what reached upstream.
pub struct ScriptedAdapter {
    kind: ProviderKind,
    scripts: Mutex<VecDeque<StreamScript>>,
    requests: Mutex<Vec<NormalizedRequest>>,
    calls: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_script(&self, script: StreamScript) {
        self.scripts
            .lock()
            .expect("script lock poisoned")
            .push_back(script);
    }

    /// Number of upstream calls issued (streaming and non-streaming).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The most recent request handed to this adapter.
    pub fn last_request(&self) -> Option<NormalizedRequest> {
        self.requests
            .lock()
            .expect("request lock poisoned")
            .last()
            .cloned()
    }

    fn record(&self, request: &NormalizedRequest) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .expect("request lock poisoned")
            .push(request.clone());
    }
}

impl ProviderAdapter for ScriptedAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn send(
        &self,
        request: &NormalizedRequest,
    ) -> BoxFuture<'_, Result<NormalizedResponse, ProviderError>> {
        self.record(request);
        let model = request.model.clone().unwrap_or_default();
        let kind = self.kind;
        Box::pin(async move {
            Ok(NormalizedResponse {
                content: "scripted response".to_string(),
                usage: TokenUsage::default(),
                model,
                provider: kind,
            })
        })
    }

    fn send_streaming(
        &self,
        request: &NormalizedRequest,
    ) -> BoxFuture<'_, Result<DeltaReceiver, ProviderError>> {
        self.record(request);
        let script = self
            .scripts
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .unwrap_or_else(|| StreamScript::completing(&[], None));

        Box::pin(async move {
            let (tx, rx) = tokio::sync::mpsc::channel(16);
            tokio::spawn(async move {
                for event in script.events {
                    if let Some(delay) = script.event_delay {
                        tokio::time::sleep(delay).await;
                    }
                    let done = matches!(event, Ok(DeltaEvent::Done { .. }) | Err(_));
                    if tx.send(event).await.is_err() {
                        // Consumer cancelled.
                        return;
                    }
                    if done {
                        return;
                    }
                }
                if let Some(release) = script.hold_open {
                    tokio::select! {
                        _ = release.notified() => {}
                        _ = tx.closed() => {}
                    }
                }
                // Channel drops here without a terminal event.
            });
            Ok(rx)
        })
    }
}
