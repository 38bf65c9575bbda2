//! End-to-end pipeline tests: session, gateway, lifecycle, queue, and
//! rewrite wired together against scripted adapters and a recording store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use parley_config::{AppConfig, ProviderKind};
use parley_core::queue::MemoryQueueStore;
use parley_core::{
    AdapterRegistry, CallerContext, ChatGateway, ChatSession, ConversationStore, DeliveryQueue,
    GenerationEvent, Message, MessageLifecycle, MessageState, ProviderAdapter, RewriteCoordinator,
    Role, SessionError, TokenUsage, persistence_failure_hook,
};
use parley_test_utils::{
    RecordingStore, ScriptedAdapter, StaticCredentials, StreamScript, TestConfigBuilder,
};

struct Pipeline {
    session: Arc<ChatSession>,
    rewriter: RewriteCoordinator,
    queue: Arc<DeliveryQueue>,
    store: Arc<RecordingStore>,
    lifecycle: Arc<MessageLifecycle>,
    adapter: Arc<ScriptedAdapter>,
}

fn pipeline() -> Pipeline {
    pipeline_with(TestConfigBuilder::new().build())
}

fn pipeline_with(config: AppConfig) -> Pipeline {
    let adapter = Arc::new(ScriptedAdapter::new(ProviderKind::OpenAi));
    let mut registry = AdapterRegistry::new();
    registry.register(
        ProviderKind::OpenAi,
        Arc::clone(&adapter) as Arc<dyn ProviderAdapter>,
        "gpt-4o",
    );
    let gateway = Arc::new(ChatGateway::new(
        registry,
        Arc::new(StaticCredentials::new("sk-test")),
    ));

    let lifecycle = Arc::new(MessageLifecycle::new());
    let store = Arc::new(RecordingStore::new());
    let store_dyn: Arc<dyn ConversationStore> = Arc::clone(&store) as Arc<dyn ConversationStore>;
    let queue = Arc::new(
        DeliveryQueue::new(
            config.queue.clone(),
            Box::new(MemoryQueueStore::new()),
            Arc::clone(&store_dyn),
        )
        .unwrap(),
    );

    let session = Arc::new(ChatSession::new(
        gateway,
        Arc::clone(&lifecycle),
        Arc::clone(&queue),
        store_dyn,
        CallerContext::authenticated("tester"),
        ProviderKind::OpenAi,
        config.rewrite.deadline(),
    ));
    let rewriter = RewriteCoordinator::new(Arc::clone(&session));

    Pipeline {
        session,
        rewriter,
        queue,
        store,
        lifecycle,
        adapter,
    }
}

/// Collect events until the generation reaches a terminal state.
async fn drive_to_terminal(rx: &mut mpsc::Receiver<GenerationEvent>) -> Vec<GenerationEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("generation never reached a terminal state")
            .expect("event channel closed before a terminal state");
        let terminal =
            matches!(&event, GenerationEvent::StateChanged { state, .. } if state.is_terminal());
        events.push(event);
        if terminal {
            return events;
        }
    }
}

/// Wait for the event channel to close, which happens only after the
/// pump has released the conversation's generation slot.
async fn drain_to_close(rx: &mut mpsc::Receiver<GenerationEvent>) {
    while rx.recv().await.is_some() {}
}

fn completed_assistant(conversation: &str, content: &str) -> Message {
    let mut msg = Message::pending_assistant(conversation, ProviderKind::OpenAi, "gpt-4o");
    msg.content = content.to_string();
    msg.state = MessageState::Completed {
        usage: TokenUsage::default(),
    };
    msg
}

#[test_log::test(tokio::test)]
async fn test_submit_streams_deltas_in_order_and_persists() {
    let p = pipeline();
    let usage = TokenUsage {
        input_tokens: 5,
        output_tokens: 2,
        total_tokens: 7,
    };
    p.adapter
        .push_script(StreamScript::completing(&["Hel", "lo"], Some(usage)));

    let (id, mut rx) = p.session.submit("c1", "Say hello").await.unwrap();
    let events = drive_to_terminal(&mut rx).await;

    assert!(matches!(
        &events[0],
        GenerationEvent::StateChanged {
            state: MessageState::Streaming { received: 0 },
            ..
        }
    ));
    assert!(matches!(&events[1], GenerationEvent::Delta { text, .. } if text == "Hel"));
    assert!(matches!(&events[2], GenerationEvent::Delta { text, .. } if text == "lo"));
    assert!(matches!(
        &events[3],
        GenerationEvent::StateChanged {
            state: MessageState::Completed { usage: got },
            ..
        } if *got == usage
    ));
    assert_eq!(events.len(), 4);

    let message = p.lifecycle.get(&id).unwrap();
    assert_eq!(message.content, "Hello");
    assert_eq!(message.usage, Some(usage));

    // The user message and the finished assistant message both flow
    // through the delivery queue into the store.
    let delivered = p.queue.drain().await;
    assert_eq!(delivered, 2);
    let persisted = p.store.persisted();
    assert_eq!(persisted.len(), 2);
    assert_eq!(persisted[0].role, Role::User);
    assert_eq!(persisted[0].content, "Say hello");
    assert_eq!(persisted[1].role, Role::Assistant);
    assert_eq!(persisted[1].content, "Hello");
    assert!(persisted[1].state.is_terminal());
}

#[test_log::test(tokio::test)]
async fn test_second_submit_rejected_until_slot_released() {
    let p = pipeline();
    let release = Arc::new(tokio::sync::Notify::new());
    p.adapter
        .push_script(StreamScript::hanging(&["thinking"], Arc::clone(&release)));

    let (id, mut rx) = p.session.submit("c1", "first").await.unwrap();
    assert_eq!(p.adapter.calls(), 1);

    let err = p.session.submit("c1", "second").await.unwrap_err();
    assert!(matches!(err, SessionError::GenerationInProgress(conv) if conv == "c1"));
    assert_eq!(p.adapter.calls(), 1, "rejected submit must not reach upstream");

    p.session.cancel(&id).unwrap();
    let events = drive_to_terminal(&mut rx).await;
    assert!(matches!(
        events.last(),
        Some(GenerationEvent::StateChanged {
            state: MessageState::Cancelled { .. },
            ..
        })
    ));
    drain_to_close(&mut rx).await;

    // Slot released: the next submit goes through.
    p.adapter
        .push_script(StreamScript::completing(&["ok"], None));
    let (_, mut rx) = p.session.submit("c1", "third").await.unwrap();
    let events = drive_to_terminal(&mut rx).await;
    assert!(matches!(
        events.last(),
        Some(GenerationEvent::StateChanged {
            state: MessageState::Completed { .. },
            ..
        })
    ));
    assert_eq!(p.adapter.calls(), 2);
}

#[test_log::test(tokio::test)]
async fn test_cancel_lands_cancelled_with_partial() {
    let p = pipeline();
    let release = Arc::new(tokio::sync::Notify::new());
    p.adapter
        .push_script(StreamScript::hanging(&["par"], Arc::clone(&release)));

    let (id, mut rx) = p.session.submit("c1", "go").await.unwrap();
    // Wait for the fragment so the partial is in the record.
    loop {
        match rx.recv().await.unwrap() {
            GenerationEvent::Delta { text, .. } => {
                assert_eq!(text, "par");
                break;
            }
            GenerationEvent::StateChanged { .. } => continue,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    p.session.cancel(&id).unwrap();
    let events = drive_to_terminal(&mut rx).await;
    assert!(matches!(
        events.last(),
        Some(GenerationEvent::StateChanged {
            state: MessageState::Cancelled { partial },
            ..
        }) if partial == "par"
    ));

    let message = p.lifecycle.get(&id).unwrap();
    assert_eq!(message.content, "par");
    assert!(matches!(message.state, MessageState::Cancelled { .. }));

    // No deltas arrive after cancellation; the channel just closes.
    drain_to_close(&mut rx).await;
    assert_eq!(p.lifecycle.get(&id).unwrap().content, "par");
}

#[test_log::test(tokio::test)]
async fn test_stream_without_terminal_is_retryable_error() {
    let p = pipeline();
    p.adapter
        .push_script(StreamScript::dropping(&["pa", "rt"]));

    let (id, mut rx) = p.session.submit("c1", "go").await.unwrap();
    let events = drive_to_terminal(&mut rx).await;
    assert!(matches!(
        events.last(),
        Some(GenerationEvent::StateChanged {
            state: MessageState::Error { retryable: true, .. },
            ..
        })
    ));

    // Partial content survives the failure and is offered for persistence.
    assert_eq!(p.lifecycle.get(&id).unwrap().content, "part");
    p.queue.drain().await;
    let persisted = p.store.persisted();
    let assistant = persisted.iter().find(|m| m.id == id).unwrap();
    assert_eq!(assistant.content, "part");
    assert!(matches!(assistant.state, MessageState::Error { .. }));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_slow_generation_warns_but_completes() {
    let config = TestConfigBuilder::new().deadline_secs(5).build();
    let p = pipeline_with(config);
    p.adapter.push_script(
        StreamScript::completing(&["a", "b", "c"], None)
            .with_event_delay(Duration::from_secs(2)),
    );

    let (id, mut rx) = p.session.submit("c1", "go").await.unwrap();
    let events = drive_to_terminal(&mut rx).await;

    let slow_at = events
        .iter()
        .position(|e| matches!(e, GenerationEvent::SlowGeneration { .. }))
        .expect("expected a slow-generation warning");
    // Advisory only: fired mid-stream, and the generation still completed.
    assert!(slow_at < events.len() - 1);
    assert!(matches!(
        events.last(),
        Some(GenerationEvent::StateChanged {
            state: MessageState::Completed { .. },
            ..
        })
    ));
    assert_eq!(p.lifecycle.get(&id).unwrap().content, "abc");
}

#[test_log::test(tokio::test)]
async fn test_rewrite_records_variation_with_same_id() {
    let p = pipeline();
    p.adapter
        .push_script(StreamScript::completing(&["First answer"], None));

    let (id, mut rx) = p.session.submit("c1", "Tell me a joke").await.unwrap();
    drive_to_terminal(&mut rx).await;
    drain_to_close(&mut rx).await;
    p.queue.drain().await;

    p.adapter
        .push_script(StreamScript::completing(&["Second answer"], None));
    let mut rx = p.rewriter.rewrite(&id).await.unwrap();
    let events = drive_to_terminal(&mut rx).await;
    assert!(matches!(
        events.last(),
        Some(GenerationEvent::StateChanged {
            state: MessageState::Completed { .. },
            ..
        })
    ));

    // Same id, new content, and the outcome recorded as a variation.
    assert_eq!(p.lifecycle.get(&id).unwrap().content, "Second answer");
    assert_eq!(
        p.store.variations(),
        vec![(id.clone(), "Second answer".to_string())]
    );
    assert_eq!(p.adapter.calls(), 2);
}

#[test_log::test(tokio::test)]
async fn test_duplicate_rewrite_rejected_without_upstream_call() {
    let p = pipeline();
    p.adapter
        .push_script(StreamScript::completing(&["First"], None));
    let (id, mut rx) = p.session.submit("c1", "hi").await.unwrap();
    drive_to_terminal(&mut rx).await;
    drain_to_close(&mut rx).await;
    p.queue.drain().await;

    let release = Arc::new(tokio::sync::Notify::new());
    p.adapter
        .push_script(StreamScript::hanging(&["re"], Arc::clone(&release)));
    let mut rewrite_rx = p.rewriter.rewrite(&id).await.unwrap();
    assert_eq!(p.adapter.calls(), 2);

    let err = p.rewriter.rewrite(&id).await.unwrap_err();
    assert!(matches!(err, SessionError::GenerationInProgress(_)));
    assert_eq!(p.adapter.calls(), 2, "duplicate rewrite must not reach upstream");

    p.rewriter.cancel(&id).unwrap();
    let events = drive_to_terminal(&mut rewrite_rx).await;
    assert!(matches!(
        events.last(),
        Some(GenerationEvent::StateChanged {
            state: MessageState::Cancelled { .. },
            ..
        })
    ));
}

#[test_log::test(tokio::test)]
async fn test_rejected_rewrite_leaves_completed_target_intact() {
    let p = pipeline();
    p.adapter
        .push_script(StreamScript::completing(&["First answer"], None));
    let (first_id, mut rx) = p.session.submit("c1", "question one").await.unwrap();
    drive_to_terminal(&mut rx).await;
    drain_to_close(&mut rx).await;
    p.queue.drain().await;

    // A second generation holds the conversation's slot.
    let release = Arc::new(tokio::sync::Notify::new());
    p.adapter
        .push_script(StreamScript::hanging(&["busy"], Arc::clone(&release)));
    let (second_id, mut second_rx) = p.session.submit("c1", "question two").await.unwrap();

    let err = p.rewriter.rewrite(&first_id).await.unwrap_err();
    assert!(matches!(err, SessionError::GenerationInProgress(_)));
    assert_eq!(p.adapter.calls(), 2, "rejected rewrite must not reach upstream");

    // The rejection touched nothing: the completed record keeps its
    // content and state.
    let target = p.lifecycle.get(&first_id).unwrap();
    assert_eq!(target.content, "First answer");
    assert!(matches!(target.state, MessageState::Completed { .. }));

    p.session.cancel(&second_id).unwrap();
    drive_to_terminal(&mut second_rx).await;
}

#[test_log::test(tokio::test)]
async fn test_rewrite_without_preceding_user_rejected() {
    let p = pipeline();
    let assistant = completed_assistant("c1", "orphan");
    let id = assistant.id.clone();
    p.store.seed(assistant.clone());
    p.session.track(assistant).unwrap();

    let err = p.rewriter.rewrite(&id).await.unwrap_err();
    assert!(matches!(err, SessionError::NoPrecedingUser(_)));
    assert_eq!(p.adapter.calls(), 0);
}

#[test_log::test(tokio::test)]
async fn test_rewrite_of_tracked_history_uses_chronological_anchor() {
    let p = pipeline();

    // History as a reloaded session would see it: user, assistant answer,
    // then a later exchange that must stay out of the rebuilt context.
    let user = Message::from_user("c1", "What is Rust?", ProviderKind::OpenAi, "gpt-4o");
    std::thread::sleep(Duration::from_millis(2));
    let target = completed_assistant("c1", "old answer");
    let target_id = target.id.clone();
    std::thread::sleep(Duration::from_millis(2));
    let later_user = Message::from_user("c1", "And Go?", ProviderKind::OpenAi, "gpt-4o");

    p.store.seed(user);
    p.store.seed(target.clone());
    p.store.seed(later_user);
    p.session.track(target).unwrap();

    p.adapter
        .push_script(StreamScript::completing(&["new answer"], None));
    let mut rx = p.rewriter.rewrite(&target_id).await.unwrap();
    drive_to_terminal(&mut rx).await;

    // Context stops at the user message chronologically preceding the
    // target: the later exchange and the old answer stay out.
    let sent = p.adapter.last_request().unwrap();
    assert_eq!(sent.messages.len(), 1);
    assert_eq!(sent.messages[0].role, Role::User);
    assert_eq!(sent.messages[0].content, "What is Rust?");

    assert_eq!(p.lifecycle.get(&target_id).unwrap().content, "new answer");
    assert_eq!(
        p.store.variations(),
        vec![(target_id, "new answer".to_string())]
    );
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_exhausted_persistence_retries_surface_on_message() {
    let config = TestConfigBuilder::new().max_retries(1).build();
    let lifecycle = Arc::new(MessageLifecycle::new());
    let store = Arc::new(RecordingStore::new());
    store.fail_next_creates(u32::MAX);

    let queue = DeliveryQueue::new(
        config.queue.clone(),
        Box::new(MemoryQueueStore::new()),
        Arc::clone(&store) as Arc<dyn ConversationStore>,
    )
    .unwrap()
    .with_dead_letter_hook(persistence_failure_hook(
        Arc::clone(&lifecycle),
        Arc::clone(&store) as Arc<dyn ConversationStore>,
    ));

    let message = completed_assistant("c1", "done but undeliverable");
    let id = message.id.clone();
    lifecycle.insert(message.clone()).unwrap();
    // An earlier delivery already created the record; this re-delivery of
    // the same id is the one that exhausts its retries.
    store.seed(message.clone());
    queue.enqueue(message).unwrap();

    queue.drain().await;
    assert_eq!(queue.dead_letters().len(), 1);

    // The documented completed -> error edge: the failure is visible on
    // the message instead of vanishing with the dropped entry.
    match lifecycle.get_state(&id).unwrap() {
        MessageState::Error { message, retryable } => {
            assert!(message.contains("persistence failed"));
            assert!(!retryable);
        }
        other => panic!("expected error state, got {other:?}"),
    }

    // The error state also reaches the previously created store record.
    tokio::time::sleep(Duration::from_millis(1)).await;
    let persisted = store
        .persisted()
        .into_iter()
        .find(|m| m.id == id)
        .expect("record missing from store");
    assert!(matches!(persisted.state, MessageState::Error { .. }));
}
