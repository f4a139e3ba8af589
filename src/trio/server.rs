//! HTTP surface: one streaming endpoint per chat flavour.
//!
//! Each `POST` answers immediately with a server-sent event stream. Every
//! snapshot is sent as a `message` event holding the full JSON snapshot; the
//! stream ends with a single `done` event. Authentication, chat id and body
//! problems are reported inside the stream like any other failure.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde::Deserialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::trio::auth::{bearer_token, require_principal, Principal};
use crate::trio::error::EngineError;
use crate::trio::orchestration::TurnOrchestrator;
use crate::trio::reflection::ReflectionLoop;
use crate::trio::services::Services;
use crate::trio::storage::SqliteStore;
use crate::trio::stream::{BasicBody, ReflectionBody, StreamEvent, UpdateChannel};
use crate::trio::supervisor::supervise;

#[derive(Clone)]
pub struct AppState {
    store: Arc<SqliteStore>,
    turns: TurnOrchestrator,
    reflections: ReflectionLoop,
    deadline: Duration,
}

impl AppState {
    pub fn new(services: Services) -> Self {
        Self {
            store: services.store.clone(),
            deadline: services.config.request_timeout,
            turns: TurnOrchestrator::new(services.clone()),
            reflections: ReflectionLoop::new(services),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/basic-chats/{id}/messages", post(post_basic_message))
        .route("/reflection-chats/{id}/messages", post(post_reflection_message))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    message: String,
}

/// A parsed inbound request, produced inside the worker.
struct Inbound {
    principal: Principal,
    chat_id: Uuid,
    message: String,
}

impl Inbound {
    async fn parse(
        store: &Arc<SqliteStore>,
        token: Option<String>,
        chat_id: &str,
        body: &[u8],
    ) -> Result<Self, EngineError> {
        let principal = match token {
            Some(token) => store.run(move |store| store.resolve_session(&token)).await?,
            None => None,
        };
        let principal = require_principal(principal.as_ref())?.clone();
        let chat_id = Uuid::parse_str(chat_id)
            .map_err(|_| EngineError::Validation("Invalid chat id".into()))?;
        let body: MessageBody = serde_json::from_slice(body)
            .map_err(|_| EngineError::Validation("Invalid request body".into()))?;
        Ok(Self {
            principal,
            chat_id,
            message: body.message,
        })
    }
}

fn session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string)
}

fn event_stream(
    receiver: UnboundedReceiver<StreamEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = UnboundedReceiverStream::new(receiver).map(|event| {
        Ok(match event {
            StreamEvent::Snapshot(json) => Event::default().event("message").data(json),
            StreamEvent::Done => Event::default().event("done").data("done"),
        })
    });
    Sse::new(events)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn post_basic_message(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (channel, receiver) = UpdateChannel::<BasicBody>::new();
    let token = session_token(&headers);
    let worker_channel = channel.clone();
    let deadline = state.deadline;

    tokio::spawn(supervise(channel, deadline, move |cancel| async move {
        let inbound = Inbound::parse(&state.store, token, &chat_id, &body).await?;
        state
            .turns
            .run_turn(
                Some(&inbound.principal),
                inbound.chat_id,
                &inbound.message,
                &worker_channel,
                &cancel,
            )
            .await
    }));

    event_stream(receiver)
}

async fn post_reflection_message(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (channel, receiver) = UpdateChannel::<ReflectionBody>::new();
    let token = session_token(&headers);
    let worker_channel = channel.clone();
    let deadline = state.deadline;

    tokio::spawn(supervise(channel, deadline, move |cancel| async move {
        let inbound = Inbound::parse(&state.store, token, &chat_id, &body).await?;
        state
            .reflections
            .run_exchange(
                Some(&inbound.principal),
                inbound.chat_id,
                &inbound.message,
                &worker_channel,
                &cancel,
            )
            .await
    }));

    event_stream(receiver)
}
