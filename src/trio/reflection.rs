//! Answer → evaluate → revise loop for reflection chats.
//!
//! Each user message starts one exchange, modelled as a small state machine:
//!
//! ```text
//! Answering ──draft──▶ Evaluating ──isOptimal──────────▶ Converged
//!     ▲                    │
//!     │                    ├──iteration == cap──────────▶ ForcedAccept
//!     └────critique────────┘
//! ```
//!
//! Iterations are counted from zero and the cap is
//! [`EngineConfig::max_reflection_iterations`](crate::EngineConfig::max_reflection_iterations),
//! so an exchange produces at most `cap + 1` drafts and always ends with exactly
//! one draft flagged optimal. The exchange record is built in memory and streamed
//! from there; nothing is stored until it reaches a terminal state. Then the user
//! message and the accepted answer are embedded, and the whole record is saved in
//! one short transaction with [`SqliteStore::save_reflection`]. Any failure
//! leaves neither rows nor vectors behind. Provider usage is recorded as it is
//! reported, so it survives an abandoned exchange.
//!
//! [`SqliteStore::save_reflection`]: crate::trio::storage::SqliteStore::save_reflection

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::trio::auth::{require_principal, Principal};
use crate::trio::client_wrapper::{CompletionRequest, ResponseFormat};
use crate::trio::context::{ChatScope, MemoryRecord};
use crate::trio::error::EngineError;
use crate::trio::event::ReflectionEvent;
use crate::trio::gateway::parse_structured;
use crate::trio::models::{
    EvaluatorMessage, HistoryEntry, Reflection, ReflectionChat, ReflectionMessage,
    ANSWERER_HISTORY_NAME, REFLECTOR_SENDER,
};
use crate::trio::orchestration::validate_message;
use crate::trio::prompt::{InformationBank, PriorResponse, PromptKind};
use crate::trio::services::Services;
use crate::trio::stream::{ReflectionBody, UpdateChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReflectionState {
    Answering,
    Evaluating,
    Converged,
    ForcedAccept,
}

impl ReflectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReflectionState::Converged | ReflectionState::ForcedAccept)
    }
}

/// State after evaluating the draft of `iteration`.
///
/// A positive verdict always converges, even on the capped iteration.
pub fn next_state(iteration: usize, cap: usize, is_optimal: bool) -> ReflectionState {
    if is_optimal {
        ReflectionState::Converged
    } else if iteration >= cap {
        ReflectionState::ForcedAccept
    } else {
        ReflectionState::Answering
    }
}

/// Structured output the evaluator model must produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorVerdict {
    pub content: String,
    #[serde(rename = "isOptimal")]
    pub is_optimal: bool,
}

#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    pub state: ReflectionState,
    /// The reflection record as stored.
    pub reflection: Reflection,
    /// Number of drafts produced.
    pub answers: usize,
}

/// Read-only inputs of one exchange.
struct Exchange<'a> {
    principal: &'a Principal,
    chat: &'a ReflectionChat,
    message: &'a str,
    history: Vec<HistoryEntry>,
    relevant: Vec<HistoryEntry>,
}

#[derive(Clone)]
pub struct ReflectionLoop {
    services: Services,
}

impl ReflectionLoop {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Run one reflection exchange for `message`, streaming into `channel`.
    pub async fn run_exchange(
        &self,
        principal: Option<&Principal>,
        chat_external_id: Uuid,
        message: &str,
        channel: &UpdateChannel<ReflectionBody>,
        cancel: &CancellationToken,
    ) -> Result<ExchangeOutcome, EngineError> {
        let started = Instant::now();
        let principal = require_principal(principal)?;
        let config = &self.services.config;
        validate_message(message, config.max_message_length)?;

        let owner = principal.clone();
        let chat = self
            .services
            .store
            .run(move |store| store.find_reflection_chat(&owner, chat_external_id))
            .await?;

        channel.report_status("Reading chat history...");
        let history = self
            .services
            .retriever
            .chat_history(ChatScope::Reflection(chat.id), config.history_limit)
            .await?;

        channel.report_status("Getting relevant context...");
        let relevant = self
            .services
            .retriever
            .relevant_context(
                &config.reflection_collection,
                chat.external_id,
                message,
                config.context_limit,
                cancel,
            )
            .await?;

        let exchange = Exchange {
            principal,
            chat: &chat,
            message,
            history,
            relevant,
        };

        let outcome = match self.deliberate(&exchange, channel, cancel).await {
            Ok(outcome) => outcome,
            Err(err) => {
                log::error!(
                    "trio::reflection: exchange in chat {} abandoned, nothing stored: {}",
                    chat.external_id,
                    err
                );
                return Err(err);
            }
        };
        let elapsed = started.elapsed();
        log::info!(
            "trio::reflection: exchange in chat {} ended {:?} after {} answers in {:.2}s",
            chat.external_id,
            outcome.state,
            outcome.answers,
            elapsed.as_secs_f64()
        );
        self.services
            .emit_reflection(ReflectionEvent::ExchangeFinished {
                chat_id: chat.external_id.to_string(),
                state: outcome.state,
                answers: outcome.answers,
                elapsed_ms: elapsed.as_millis(),
            })
            .await;
        Ok(outcome)
    }

    async fn deliberate(
        &self,
        exchange: &Exchange<'_>,
        channel: &UpdateChannel<ReflectionBody>,
        cancel: &CancellationToken,
    ) -> Result<ExchangeOutcome, EngineError> {
        let config = &self.services.config;
        let principal = exchange.principal;
        let chat_id = exchange.chat.external_id.to_string();

        let mut record = Reflection::new(exchange.chat.id);
        record
            .messages
            .push(ReflectionMessage::new(&principal.username, exchange.message));
        channel.report_reflection(record.clone());

        let mut prior_responses: Vec<PriorResponse> = Vec::new();
        let mut iteration = 0;

        let state = loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            log::info!("trio::reflection: chat {} iteration {}", chat_id, iteration);
            self.services
                .emit_reflection(ReflectionEvent::IterationStarted {
                    chat_id: chat_id.clone(),
                    iteration,
                })
                .await;

            // Answering
            if iteration > 0 {
                channel.report_status(format!("Improving on response {}", iteration));
            } else {
                channel.report_status(format!("Generating response {}", iteration + 1));
            }
            let bank = InformationBank::for_reflection(
                principal.id,
                &principal.username,
                exchange.history.clone(),
                exchange.relevant.clone(),
                exchange.message,
                prior_responses.clone(),
                iteration + 1,
            );
            let prompts = self.services.prompts.render(PromptKind::Answerer, &bank)?;
            let request = CompletionRequest::new(&config.answerer_model, prompts.system, prompts.user)
                .for_user(principal.id);
            let completion = self.services.gateway.complete(&request, cancel).await?;
            self.services
                .record_usage(principal.id, &config.answerer_model, completion.usage.as_ref())
                .await;
            let answer = completion.text.trim().to_string();
            record
                .messages
                .push(ReflectionMessage::new(REFLECTOR_SENDER, &answer));
            let draft = record.messages.len() - 1;
            channel.report_reflection(record.clone());

            // Evaluating
            channel.report_status(format!("Evaluating response {}", iteration + 1));
            let bank = bank.with_draft(answer.clone());
            let prompts = self.services.prompts.render(PromptKind::Evaluator, &bank)?;
            let request =
                CompletionRequest::new(&config.evaluator_model, prompts.system, prompts.user)
                    .for_user(principal.id)
                    .with_response_format(ResponseFormat::Json);
            let completion = self.services.gateway.complete(&request, cancel).await?;
            self.services
                .record_usage(principal.id, &config.evaluator_model, completion.usage.as_ref())
                .await;
            let verdict: EvaluatorVerdict = parse_structured(&completion.text)?;
            self.services
                .emit_reflection(ReflectionEvent::EvaluationCompleted {
                    chat_id: chat_id.clone(),
                    iteration,
                    verdict: verdict.is_optimal,
                })
                .await;

            let next = next_state(iteration, config.max_reflection_iterations, verdict.is_optimal);
            let accepted = next.is_terminal();
            if next == ReflectionState::ForcedAccept {
                log::info!(
                    "trio::reflection: chat {} reached the iteration cap, accepting draft {}",
                    chat_id,
                    iteration + 1
                );
            }
            record.evaluator_messages.push(EvaluatorMessage::new(
                &verdict.content,
                accepted,
                verdict.is_optimal,
            ));
            if accepted {
                record.messages[draft].is_optimal = true;
            }
            channel.report_reflection(record.clone());

            if accepted {
                break next;
            }
            prior_responses.push(PriorResponse {
                answer,
                evaluation: verdict.content,
                is_optimal: verdict.is_optimal,
            });
            iteration += 1;
        };

        let reflection = self.persist(exchange, record, cancel).await?;
        Ok(ExchangeOutcome {
            state,
            reflection,
            answers: iteration + 1,
        })
    }

    /// Embed the question and the accepted answer, then save the record.
    async fn persist(
        &self,
        exchange: &Exchange<'_>,
        record: Reflection,
        cancel: &CancellationToken,
    ) -> Result<Reflection, EngineError> {
        let (Some(question), Some(answer)) = (record.messages.first(), record.optimal_message())
        else {
            return Err(EngineError::Persistence(
                "reflection has no accepted answer".into(),
            ));
        };
        let memories = [
            MemoryRecord {
                chat_external_id: exchange.chat.external_id,
                message_external_id: question.external_id,
                sender_name: &question.sender_name,
                content: &question.content,
                created_at: question.created_at,
            },
            MemoryRecord {
                chat_external_id: exchange.chat.external_id,
                message_external_id: answer.external_id,
                sender_name: ANSWERER_HISTORY_NAME,
                content: &answer.content,
                created_at: answer.created_at,
            },
        ];

        let sqlite = self.services.store.clone();
        let finished = record.clone();
        self.services
            .retriever
            .remember(&self.services.config.reflection_collection, &memories, cancel, || async move {
                sqlite.run(move |store| store.save_reflection(&finished)).await
            })
            .await
    }
}
