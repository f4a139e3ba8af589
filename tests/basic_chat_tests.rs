mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::{agent_of, Fixture, ScriptedClient, RESPONSE_MODEL};
use trio::config::BASIC_MESSAGES_COLLECTION;
use trio::error::EngineError;
use trio::event::{EventHandler, TurnEvent};
use trio::models::AgentIdentity;
use trio::stream::{BasicBody, UpdateChannel};
use trio::TurnOrchestrator;

fn roster() -> Vec<AgentIdentity> {
    vec![
        AgentIdentity::new("Ada", vec!["curious".into(), "precise".into()]),
        AgentIdentity::new("Bo", vec!["laconic".into()]),
    ]
}

#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<TurnEvent>>,
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn on_turn_event(&self, event: &TurnEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[tokio::test]
async fn every_agent_answers_once_and_is_persisted() {
    let fixture = Fixture::new(ScriptedClient::new(|request| {
        Ok(format!("hello from {}", agent_of(request)))
    }));
    let chat = fixture
        .store
        .create_basic_chat(fixture.user.id, "lounge", &roster())
        .unwrap();
    let handler = Arc::new(RecordingHandler::default());
    let orchestrator =
        TurnOrchestrator::new(fixture.services.clone().with_event_handler(handler.clone()));
    let (channel, _rx) = UpdateChannel::<BasicBody>::new();

    let outcome = orchestrator
        .run_turn(
            Some(&fixture.user),
            chat.external_id,
            "hi all",
            &channel,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut responded = outcome.responded.clone();
    responded.sort();
    assert_eq!(responded, vec!["Ada", "Bo"]);
    assert!(outcome.skipped.is_empty());

    let messages = fixture.store.basic_messages(chat.id).unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].sender_name, "ada");
    assert_eq!(messages[0].content, "hi all");
    for message in &messages[1..] {
        assert_eq!(message.content, format!("hello from {}", message.sender_name));
    }
    // Answers are stored in the order agents were asked.
    assert_eq!(
        messages[1..]
            .iter()
            .map(|m| m.sender_name.clone())
            .collect::<Vec<_>>(),
        outcome.responded
    );

    let snapshot = channel.snapshot();
    assert_eq!(snapshot.body.agent_responses.len(), 2);
    assert!(snapshot.error.is_none());
    assert!(snapshot
        .status
        .iter()
        .any(|s| s.ends_with("is trying to understand the context")));
    assert!(snapshot.status.iter().any(|s| s == "Ada is thinking"));

    assert_eq!(fixture.vectors.len(BASIC_MESSAGES_COLLECTION).await, 2);
    assert_eq!(fixture.store.usage_totals(fixture.user.id).unwrap().total_tokens, 30);

    let events = handler.events.lock().unwrap();
    assert!(matches!(events.first(), Some(TurnEvent::TurnStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(TurnEvent::TurnCompleted { responded: 2, skipped: 0, .. })
    ));
}

#[tokio::test]
async fn acting_agent_is_not_listed_among_the_others() {
    let fixture = Fixture::new(ScriptedClient::new(|_| Ok("ok".into())));
    let chat = fixture
        .store
        .create_basic_chat(fixture.user.id, "lounge", &roster())
        .unwrap();
    let (channel, _rx) = UpdateChannel::<BasicBody>::new();

    TurnOrchestrator::new(fixture.services.clone())
        .run_turn(
            Some(&fixture.user),
            chat.external_id,
            "hello",
            &channel,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    for call in fixture.client.calls_for(RESPONSE_MODEL) {
        let me = agent_of(&call);
        let others = call
            .system_prompt
            .split("The other personas in this chat are:")
            .nth(1)
            .unwrap_or_default()
            .to_string();
        assert!(!others.contains(&format!("- {}", me)));
        assert_eq!(call.user_id, Some(fixture.user.id));
    }
}

#[tokio::test]
async fn empty_answer_is_skipped_without_persisting() {
    let fixture = Fixture::new(ScriptedClient::new(|request| {
        if agent_of(request) == "Bo" {
            Ok("   ".into())
        } else {
            Ok("Ada here".into())
        }
    }));
    let chat = fixture
        .store
        .create_basic_chat(fixture.user.id, "lounge", &roster())
        .unwrap();
    let (channel, _rx) = UpdateChannel::<BasicBody>::new();

    let outcome = TurnOrchestrator::new(fixture.services.clone())
        .run_turn(
            Some(&fixture.user),
            chat.external_id,
            "Ada, what do you think?",
            &channel,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.responded, vec!["Ada"]);
    assert_eq!(outcome.skipped, vec!["Bo"]);
    let messages = fixture.store.basic_messages(chat.id).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(channel.snapshot().body.agent_responses.len(), 1);
}

#[tokio::test]
async fn backend_failure_aborts_remaining_agents() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let fixture = Fixture::new(ScriptedClient::new(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(EngineError::Gateway("rate limited".into()))
        } else {
            Ok("should never be asked".into())
        }
    }));
    let chat = fixture
        .store
        .create_basic_chat(fixture.user.id, "lounge", &roster())
        .unwrap();
    let (channel, _rx) = UpdateChannel::<BasicBody>::new();

    let err = TurnOrchestrator::new(fixture.services.clone())
        .run_turn(
            Some(&fixture.user),
            chat.external_id,
            "hi",
            &channel,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err, EngineError::Gateway("rate limited".into()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // Only the user's own message survives.
    assert_eq!(fixture.store.basic_messages(chat.id).unwrap().len(), 1);
}

#[tokio::test]
async fn failed_embedding_rolls_back_the_agent_message() {
    let fixture = Fixture::new(ScriptedClient::new(|request| {
        if request.user_prompt.contains("second") {
            Ok("unlucky answer".into())
        } else {
            Ok("an answer".into())
        }
    }));
    let chat = fixture
        .store
        .create_basic_chat(fixture.user.id, "lounge", &roster()[..1])
        .unwrap();
    let orchestrator = TurnOrchestrator::new(fixture.services.clone());
    let cancel = CancellationToken::new();

    let (channel, _rx) = UpdateChannel::<BasicBody>::new();
    orchestrator
        .run_turn(Some(&fixture.user), chat.external_id, "first", &channel, &cancel)
        .await
        .unwrap();
    assert_eq!(fixture.vectors.len(BASIC_MESSAGES_COLLECTION).await, 1);

    fixture.client.fail_embeddings_of(Some("unlucky answer"));
    let (channel, _rx) = UpdateChannel::<BasicBody>::new();
    let err = orchestrator
        .run_turn(Some(&fixture.user), chat.external_id, "second", &channel, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Persistence(_)));
    assert_eq!(err.client_message(), "An error occurred while saving your message");
    let messages = fixture.store.basic_messages(chat.id).unwrap();
    let senders: Vec<_> = messages.iter().map(|m| m.sender_name.as_str()).collect();
    assert_eq!(senders, vec!["ada", "Ada", "ada"]);
    assert!(messages.iter().all(|m| m.content != "unlucky answer"));
    assert_eq!(fixture.vectors.len(BASIC_MESSAGES_COLLECTION).await, 1);
    assert!(channel.snapshot().body.agent_responses.is_empty());
}

#[tokio::test]
async fn failed_row_write_removes_the_indexed_answer() {
    let fixture = Fixture::new(ScriptedClient::new(|_| Ok("an answer".into())));
    let gate = fixture.client.hold(RESPONSE_MODEL);
    let chat = fixture
        .store
        .create_basic_chat(fixture.user.id, "lounge", &roster()[..1])
        .unwrap();

    let orchestrator = TurnOrchestrator::new(fixture.services.clone());
    let user = fixture.user.clone();
    let chat_id = chat.external_id;
    let turn = tokio::spawn(async move {
        let (channel, _rx) = UpdateChannel::<BasicBody>::new();
        orchestrator
            .run_turn(Some(&user), chat_id, "hello", &channel, &CancellationToken::new())
            .await
    });

    // The chat is gone by the time the answer is stored.
    gate.entered.notified().await;
    fixture
        .store
        .delete_basic_chat(&fixture.user, chat_id)
        .unwrap();
    gate.release.notify_one();

    let err = turn.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::Persistence(_)));
    assert!(fixture.vectors.is_empty(BASIC_MESSAGES_COLLECTION).await);
}

#[tokio::test]
async fn oversized_message_is_rejected_before_anything_is_stored() {
    let fixture = Fixture::new(ScriptedClient::new(|_| Ok("hi".into())));
    let chat = fixture
        .store
        .create_basic_chat(fixture.user.id, "lounge", &roster())
        .unwrap();
    let (channel, _rx) = UpdateChannel::<BasicBody>::new();

    let err = TurnOrchestrator::new(fixture.services.clone())
        .run_turn(
            Some(&fixture.user),
            chat.external_id,
            &"x".repeat(401),
            &channel,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.client_message(), "Message too long");
    assert!(fixture.store.basic_messages(chat.id).unwrap().is_empty());
    assert!(fixture.client.calls().is_empty());
}

#[tokio::test]
async fn chat_without_agents_is_rejected() {
    let fixture = Fixture::new(ScriptedClient::new(|_| Ok("hi".into())));
    let chat = fixture
        .store
        .create_basic_chat(fixture.user.id, "empty", &[])
        .unwrap();
    let (channel, _rx) = UpdateChannel::<BasicBody>::new();

    let err = TurnOrchestrator::new(fixture.services.clone())
        .run_turn(
            Some(&fixture.user),
            chat.external_id,
            "anyone?",
            &channel,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.client_message(), "There are no agents to respond");
}

#[tokio::test]
async fn foreign_or_missing_chat_is_not_found() {
    let fixture = Fixture::new(ScriptedClient::new(|_| Ok("hi".into())));
    let stranger = fixture.store.create_user("mallory").unwrap();
    let chat = fixture
        .store
        .create_basic_chat(fixture.user.id, "lounge", &roster())
        .unwrap();
    let orchestrator = TurnOrchestrator::new(fixture.services.clone());
    let (channel, _rx) = UpdateChannel::<BasicBody>::new();
    let cancel = CancellationToken::new();

    let err = orchestrator
        .run_turn(Some(&stranger), chat.external_id, "hi", &channel, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::NotFound("Chat".into()));

    let err = orchestrator
        .run_turn(Some(&fixture.user), Uuid::new_v4(), "hi", &channel, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.client_message(), "Chat not found");

    let err = orchestrator
        .run_turn(None, chat.external_id, "hi", &channel, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Unauthenticated);
}

#[tokio::test]
async fn later_turns_see_history_and_relevant_context() {
    let fixture = Fixture::new(ScriptedClient::new(|request| {
        Ok(format!("{} remembers", agent_of(request)))
    }));
    let chat = fixture
        .store
        .create_basic_chat(fixture.user.id, "lounge", &roster()[..1])
        .unwrap();
    let orchestrator = TurnOrchestrator::new(fixture.services.clone());
    let cancel = CancellationToken::new();

    for message in ["my cat is called Miso", "what is my cat called?"] {
        let (channel, _rx) = UpdateChannel::<BasicBody>::new();
        orchestrator
            .run_turn(Some(&fixture.user), chat.external_id, message, &channel, &cancel)
            .await
            .unwrap();
    }

    let calls = fixture.client.calls_for(RESPONSE_MODEL);
    assert_eq!(calls.len(), 2);
    let second = &calls[1].user_prompt;
    assert!(second.contains("Recent conversation (newest first):"));
    assert!(second.contains("ada: my cat is called Miso"));
    assert!(second.contains("Earlier messages that may be relevant:"));
    assert!(second.contains("Ada: Ada remembers"));
}
