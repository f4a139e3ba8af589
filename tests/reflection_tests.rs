mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use common::{Fixture, ScriptedClient, ANSWERER_MODEL, EVALUATOR_MODEL};
use trio::client_wrapper::ResponseFormat;
use trio::config::REFLECTION_MESSAGES_COLLECTION;
use trio::error::EngineError;
use trio::event::{EventHandler, ReflectionEvent};
use trio::models::{AgentIdentity, ANSWERER_HISTORY_NAME, REFLECTOR_SENDER};
use trio::reflection::ReflectionState;
use trio::stream::{BasicBody, ReflectionBody, UpdateChannel};
use trio::{ReflectionLoop, TurnOrchestrator};

fn verdict(content: &str, is_optimal: bool) -> String {
    serde_json::json!({ "content": content, "isOptimal": is_optimal }).to_string()
}

/// Answers "draft N"; the evaluator accepts from the `accept_from`-th draft on (1-based).
fn drafting_client(accept_from: usize) -> ScriptedClient {
    let drafts = AtomicUsize::new(0);
    ScriptedClient::new(move |request| {
        if request.model == EVALUATOR_MODEL {
            let n = drafts.load(Ordering::SeqCst);
            Ok(verdict(&format!("critique of draft {}", n), n >= accept_from))
        } else {
            let n = drafts.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("draft {}", n))
        }
    })
}

#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<ReflectionEvent>>,
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn on_reflection_event(&self, event: &ReflectionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[tokio::test]
async fn converges_when_the_evaluator_accepts_the_second_draft() {
    let fixture = Fixture::new(drafting_client(2));
    let chat = fixture
        .store
        .create_reflection_chat(fixture.user.id, "thinking")
        .unwrap();
    let handler = Arc::new(RecordingHandler::default());
    let reflections =
        ReflectionLoop::new(fixture.services.clone().with_event_handler(handler.clone()));
    let (channel, _rx) = UpdateChannel::<ReflectionBody>::new();

    let outcome = reflections
        .run_exchange(
            Some(&fixture.user),
            chat.external_id,
            "why is the sky blue?",
            &channel,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.state, ReflectionState::Converged);
    assert_eq!(outcome.answers, 2);

    let reflection = &outcome.reflection;
    let senders: Vec<_> = reflection.messages.iter().map(|m| m.sender_name.as_str()).collect();
    assert_eq!(senders, vec!["ada", REFLECTOR_SENDER, REFLECTOR_SENDER]);
    assert_eq!(reflection.messages[0].content, "why is the sky blue?");
    assert_eq!(reflection.optimal_message().unwrap().content, "draft 2");
    assert_eq!(reflection.messages.iter().filter(|m| m.is_optimal).count(), 1);
    let flags: Vec<_> = reflection
        .evaluator_messages
        .iter()
        .map(|m| (m.is_optimal, m.evaluator_verdict))
        .collect();
    assert_eq!(flags, vec![(false, false), (true, true)]);

    // Committed.
    let stored = fixture.store.reflections(chat.id).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].messages.len(), 3);

    // The second draft is written with both earlier results in view.
    let answer_calls = fixture.client.calls_for(ANSWERER_MODEL);
    assert_eq!(answer_calls.len(), 2);
    assert!(answer_calls[1].user_prompt.contains("draft 1"));
    assert!(answer_calls[1].user_prompt.contains("critique of draft 1"));
    assert!(answer_calls[1].user_prompt.contains("Write draft 2."));

    for call in fixture.client.calls_for(EVALUATOR_MODEL) {
        assert_eq!(call.response_format, ResponseFormat::Json);
    }

    let status = channel.snapshot().status;
    assert_eq!(
        status,
        vec![
            "Reading chat history...",
            "Getting relevant context...",
            "Generating response 1",
            "Evaluating response 1",
            "Improving on response 1",
            "Evaluating response 2",
        ]
    );
    assert_eq!(
        channel.snapshot().body.reflection.unwrap().messages.len(),
        3
    );

    // User message and accepted answer are recalled later.
    assert_eq!(fixture.vectors.len(REFLECTION_MESSAGES_COLLECTION).await, 2);
    // Four calls recorded even though they ran inside the exchange.
    assert_eq!(fixture.store.usage_totals(fixture.user.id).unwrap().total_tokens, 60);

    let events = handler.events.lock().unwrap();
    assert!(matches!(
        events.last(),
        Some(ReflectionEvent::ExchangeFinished {
            state: ReflectionState::Converged,
            answers: 2,
            ..
        })
    ));
}

#[tokio::test]
async fn forces_acceptance_on_the_capped_iteration() {
    let fixture = Fixture::new(drafting_client(usize::MAX));
    let chat = fixture
        .store
        .create_reflection_chat(fixture.user.id, "stubborn")
        .unwrap();
    let (channel, _rx) = UpdateChannel::<ReflectionBody>::new();

    let outcome = ReflectionLoop::new(fixture.services.clone())
        .run_exchange(
            Some(&fixture.user),
            chat.external_id,
            "prove the Riemann hypothesis",
            &channel,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.state, ReflectionState::ForcedAccept);
    assert_eq!(outcome.answers, 6);
    assert_eq!(fixture.client.calls_for(ANSWERER_MODEL).len(), 6);

    let reflection = &outcome.reflection;
    assert_eq!(reflection.messages.len(), 7);
    assert_eq!(reflection.optimal_message().unwrap().content, "draft 6");
    assert_eq!(reflection.messages.iter().filter(|m| m.is_optimal).count(), 1);

    let last = reflection.evaluator_messages.last().unwrap();
    assert!(last.is_optimal);
    assert!(!last.evaluator_verdict);
    assert!(reflection.evaluator_messages[..5]
        .iter()
        .all(|m| !m.is_optimal && !m.evaluator_verdict));
}

#[tokio::test]
async fn unparseable_evaluation_rolls_back_the_whole_exchange() {
    let fixture = Fixture::new(ScriptedClient::new(|request| {
        if request.model == EVALUATOR_MODEL {
            Ok("looks fine to me".into())
        } else {
            Ok("an answer".into())
        }
    }));
    let chat = fixture
        .store
        .create_reflection_chat(fixture.user.id, "broken")
        .unwrap();
    let (channel, _rx) = UpdateChannel::<ReflectionBody>::new();

    let err = ReflectionLoop::new(fixture.services.clone())
        .run_exchange(
            Some(&fixture.user),
            chat.external_id,
            "hello?",
            &channel,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::StructuredOutputParse(_)));
    assert!(fixture.store.reflections(chat.id).unwrap().is_empty());
    assert!(fixture.vectors.is_empty(REFLECTION_MESSAGES_COLLECTION).await);
    // The draft was streamed before the failure.
    let streamed = channel.snapshot().body.reflection.unwrap();
    assert_eq!(streamed.messages.len(), 2);
    // Usage spent on the rolled-back exchange is still recorded.
    assert_eq!(fixture.store.usage_totals(fixture.user.id).unwrap().total_tokens, 30);
}

#[tokio::test]
async fn later_exchanges_only_see_accepted_answers() {
    let fixture = Fixture::new(drafting_client(2));
    let chat = fixture
        .store
        .create_reflection_chat(fixture.user.id, "history")
        .unwrap();
    let reflections = ReflectionLoop::new(fixture.services.clone());
    let cancel = CancellationToken::new();

    let (channel, _rx) = UpdateChannel::<ReflectionBody>::new();
    reflections
        .run_exchange(Some(&fixture.user), chat.external_id, "first question", &channel, &cancel)
        .await
        .unwrap();

    let history = fixture.store.reflection_history(chat.id, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].sender_name, ANSWERER_HISTORY_NAME);
    assert_eq!(history[0].content, "draft 2");

    let (channel, _rx) = UpdateChannel::<ReflectionBody>::new();
    reflections
        .run_exchange(Some(&fixture.user), chat.external_id, "second question", &channel, &cancel)
        .await
        .unwrap();

    let answer_calls = fixture.client.calls_for(ANSWERER_MODEL);
    let prompt = &answer_calls[2].user_prompt;
    assert!(prompt.contains("Answerer: draft 2"));
    assert!(!prompt.contains("Answerer: draft 1"));
    assert!(!prompt.contains("Reflector"));
    assert!(prompt.contains("Related earlier exchanges:"));
    assert!(prompt.contains("ada: first question"));
}

#[tokio::test]
async fn oversized_and_unauthenticated_requests_are_rejected() {
    let fixture = Fixture::new(drafting_client(1));
    let chat = fixture
        .store
        .create_reflection_chat(fixture.user.id, "guarded")
        .unwrap();
    let reflections = ReflectionLoop::new(fixture.services.clone());
    let (channel, _rx) = UpdateChannel::<ReflectionBody>::new();
    let cancel = CancellationToken::new();

    let err = reflections
        .run_exchange(Some(&fixture.user), chat.external_id, &"y".repeat(401), &channel, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.client_message(), "Message too long");

    let err = reflections
        .run_exchange(None, chat.external_id, "hi", &channel, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Unauthenticated);

    assert!(fixture.client.calls().is_empty());
    assert!(fixture.store.reflections(chat.id).unwrap().is_empty());
}

#[tokio::test]
async fn cancellation_rolls_back() {
    let fixture = Fixture::new(drafting_client(1));
    let chat = fixture
        .store
        .create_reflection_chat(fixture.user.id, "cancelled")
        .unwrap();
    let (channel, _rx) = UpdateChannel::<ReflectionBody>::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = ReflectionLoop::new(fixture.services.clone())
        .run_exchange(Some(&fixture.user), chat.external_id, "hi", &channel, &cancel)
        .await
        .unwrap_err();

    assert_eq!(err, EngineError::Cancelled);
    assert!(fixture.store.reflections(chat.id).unwrap().is_empty());
}

#[tokio::test]
async fn failed_answer_embedding_leaves_nothing_to_recall() {
    let fixture = Fixture::new(ScriptedClient::new(|request| {
        if request.model == EVALUATOR_MODEL {
            Ok(verdict("good", true))
        } else {
            Ok("the accepted answer".into())
        }
    }));
    fixture.client.fail_embeddings_of(Some("the accepted answer"));
    let chat = fixture
        .store
        .create_reflection_chat(fixture.user.id, "private")
        .unwrap();
    let (channel, _rx) = UpdateChannel::<ReflectionBody>::new();
    let cancel = CancellationToken::new();

    let err = ReflectionLoop::new(fixture.services.clone())
        .run_exchange(
            Some(&fixture.user),
            chat.external_id,
            "secret rolled back question",
            &channel,
            &cancel,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Persistence(_)));
    assert!(fixture.store.reflections(chat.id).unwrap().is_empty());
    assert!(fixture.vectors.is_empty(REFLECTION_MESSAGES_COLLECTION).await);
    let recalled = fixture
        .services
        .retriever
        .relevant_context(
            REFLECTION_MESSAGES_COLLECTION,
            chat.external_id,
            "secret rolled back question",
            10,
            &cancel,
        )
        .await
        .unwrap();
    assert!(recalled.is_empty());
}

#[tokio::test]
async fn failed_save_removes_the_indexed_messages() {
    let fixture = Fixture::new(drafting_client(1));
    let gate = fixture.client.hold(EVALUATOR_MODEL);
    let chat = fixture
        .store
        .create_reflection_chat(fixture.user.id, "doomed")
        .unwrap();

    let reflections = ReflectionLoop::new(fixture.services.clone());
    let user = fixture.user.clone();
    let chat_id = chat.external_id;
    let exchange = tokio::spawn(async move {
        let (channel, _rx) = UpdateChannel::<ReflectionBody>::new();
        reflections
            .run_exchange(Some(&user), chat_id, "hi", &channel, &CancellationToken::new())
            .await
    });

    // The chat disappears while the evaluator is thinking, so the save fails.
    gate.entered.notified().await;
    fixture
        .store
        .delete_reflection_chat(&fixture.user, chat.external_id)
        .unwrap();
    gate.release.notify_one();

    let err = exchange.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::Persistence(_)));
    assert!(fixture.vectors.is_empty(REFLECTION_MESSAGES_COLLECTION).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pending_exchange_does_not_block_other_users() {
    let fixture = Fixture::new(drafting_client(1));
    let gate = fixture.client.hold(EVALUATOR_MODEL);
    let chat = fixture
        .store
        .create_reflection_chat(fixture.user.id, "slow")
        .unwrap();
    let bob = fixture.store.create_user("bob").unwrap();
    let lounge = fixture
        .store
        .create_basic_chat(bob.id, "lounge", &[AgentIdentity::new("Ada", vec![])])
        .unwrap();

    let reflections = ReflectionLoop::new(fixture.services.clone());
    let user = fixture.user.clone();
    let chat_id = chat.external_id;
    let exchange = tokio::spawn(async move {
        let (channel, _rx) = UpdateChannel::<ReflectionBody>::new();
        reflections
            .run_exchange(Some(&user), chat_id, "why?", &channel, &CancellationToken::new())
            .await
    });
    gate.entered.notified().await;

    // Nothing of the unfinished exchange is visible yet.
    assert!(fixture.store.reflections(chat.id).unwrap().is_empty());

    let (channel, _rx) = UpdateChannel::<BasicBody>::new();
    let turn = tokio::time::timeout(
        Duration::from_secs(5),
        TurnOrchestrator::new(fixture.services.clone()).run_turn(
            Some(&bob),
            lounge.external_id,
            "hello",
            &channel,
            &CancellationToken::new(),
        ),
    )
    .await
    .expect("basic turn waited on the reflection exchange")
    .unwrap();
    assert_eq!(turn.responded, vec!["Ada"]);
    assert_eq!(fixture.store.basic_messages(lounge.id).unwrap().len(), 2);

    gate.release.notify_one();
    let outcome = exchange.await.unwrap().unwrap();
    assert_eq!(outcome.state, ReflectionState::Converged);
    assert_eq!(fixture.store.reflections(chat.id).unwrap().len(), 1);
}
