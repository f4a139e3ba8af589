//! Multi-agent turn orchestration for basic chats.
//!
//! One inbound user message produces one turn: the message is stored, history and
//! relevant context are fetched once, and every agent of the chat is asked in a
//! freshly shuffled order. All agents see the same context snapshot. Each answer
//! is stored together with its embedding as one unit (the vector is removed
//! again if the row fails to persist) and streamed as soon as it is stored.
//!
//! Calls are strictly sequential. The first gateway or persistence failure aborts
//! the rest of the roster; answers already committed in this turn stay.
//!
//! ```rust
//! use trio::orchestration::shuffle_roster;
//!
//! let roster = vec!["Ada", "Bo", "Cy"];
//! let mut order = shuffle_roster(&roster);
//! order.sort();
//! assert_eq!(order, roster);
//! ```

use std::time::Instant;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::trio::auth::{require_principal, Principal};
use crate::trio::client_wrapper::CompletionRequest;
use crate::trio::context::{ChatScope, MemoryRecord};
use crate::trio::error::EngineError;
use crate::trio::event::TurnEvent;
use crate::trio::models::{AgentIdentity, AgentResponse, BasicChat, BasicMessage, HistoryEntry};
use crate::trio::prompt::{InformationBank, PromptKind};
use crate::trio::services::Services;
use crate::trio::stream::{BasicBody, UpdateChannel};

/// Uniformly random permutation of `roster` (Fisher–Yates).
pub fn shuffle_roster<T: Clone>(roster: &[T]) -> Vec<T> {
    let mut shuffled = roster.to_vec();
    let mut rng = rand::thread_rng();
    for i in (1..shuffled.len()).rev() {
        let j = rng.gen_range(0..=i);
        shuffled.swap(i, j);
    }
    shuffled
}

/// Reject empty or oversized input before anything is stored.
pub fn validate_message(message: &str, max_length: usize) -> Result<(), EngineError> {
    if message.trim().is_empty() {
        return Err(EngineError::Validation("Message is empty".into()));
    }
    if message.chars().count() > max_length {
        return Err(EngineError::Validation("Message too long".into()));
    }
    Ok(())
}

/// What happened during one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Agents whose answer was committed, in answering order.
    pub responded: Vec<String>,
    /// Agents that stayed silent, including those whose prompt failed to render.
    pub skipped: Vec<String>,
}

/// Shared state of one turn, fetched once before the first agent is asked.
struct TurnContext<'a> {
    principal: &'a Principal,
    chat: &'a BasicChat,
    message: &'a str,
    history: Vec<HistoryEntry>,
    relevant: Vec<HistoryEntry>,
}

enum AgentResult {
    Responded,
    Skipped,
}

#[derive(Clone)]
pub struct TurnOrchestrator {
    services: Services,
}

impl TurnOrchestrator {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Run one basic chat turn for `message`, streaming into `channel`.
    pub async fn run_turn(
        &self,
        principal: Option<&Principal>,
        chat_external_id: Uuid,
        message: &str,
        channel: &UpdateChannel<BasicBody>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, EngineError> {
        let started = Instant::now();
        let principal = require_principal(principal)?;
        let config = &self.services.config;
        validate_message(message, config.max_message_length)?;

        let owner = principal.clone();
        let chat = self
            .services
            .store
            .run(move |store| store.find_basic_chat(&owner, chat_external_id))
            .await?;
        if chat.chat_agents.is_empty() {
            return Err(EngineError::Validation(
                "There are no agents to respond".into(),
            ));
        }

        let user_message = BasicMessage::new(chat.id, &principal.username, message);
        self.services
            .store
            .run(move |store| store.store_basic_message(user_message))
            .await?;

        channel.report_status(format!(
            "{} is trying to understand the context",
            chat.chat_agents[0].name
        ));
        let history = self
            .services
            .retriever
            .chat_history(ChatScope::Basic(chat.id), config.history_limit)
            .await?;
        let relevant = self
            .services
            .retriever
            .relevant_context(
                &config.basic_collection,
                chat.external_id,
                message,
                config.context_limit,
                cancel,
            )
            .await?;

        let order = shuffle_roster(&chat.chat_agents);
        let chat_id = chat.external_id.to_string();
        self.services
            .emit_turn(TurnEvent::TurnStarted {
                chat_id: chat_id.clone(),
                order: order.iter().map(|a| a.name.clone()).collect(),
            })
            .await;

        let turn = TurnContext {
            principal,
            chat: &chat,
            message,
            history,
            relevant,
        };

        let mut outcome = TurnOutcome::default();
        for agent in &order {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self.run_agent(&turn, agent, &order, channel, cancel).await {
                Ok(AgentResult::Responded) => outcome.responded.push(agent.name.clone()),
                Ok(AgentResult::Skipped) => outcome.skipped.push(agent.name.clone()),
                Err(err) => {
                    log::error!(
                        "trio::orchestration::TurnOrchestrator::run_turn(...): agent {} failed, aborting turn: {}",
                        agent.name,
                        err
                    );
                    self.services
                        .emit_turn(TurnEvent::AgentFailed {
                            chat_id: chat_id.clone(),
                            agent_name: agent.name.clone(),
                            error: err.to_string(),
                        })
                        .await;
                    return Err(err);
                }
            }
        }

        let elapsed = started.elapsed();
        log::info!(
            "trio::orchestration: turn in chat {} finished in {:.2}s ({} responded, {} skipped)",
            chat_id,
            elapsed.as_secs_f64(),
            outcome.responded.len(),
            outcome.skipped.len()
        );
        self.services
            .emit_turn(TurnEvent::TurnCompleted {
                chat_id,
                responded: outcome.responded.len(),
                skipped: outcome.skipped.len(),
                elapsed_ms: elapsed.as_millis(),
            })
            .await;
        Ok(outcome)
    }

    async fn run_agent(
        &self,
        turn: &TurnContext<'_>,
        agent: &AgentIdentity,
        roster: &[AgentIdentity],
        channel: &UpdateChannel<BasicBody>,
        cancel: &CancellationToken,
    ) -> Result<AgentResult, EngineError> {
        let started = Instant::now();
        let chat_id = turn.chat.external_id.to_string();
        channel.report_status(format!("{} is thinking", agent.name));

        let bank = InformationBank::for_agent(
            turn.principal.id,
            &turn.principal.username,
            agent,
            roster,
            turn.history.clone(),
            turn.relevant.clone(),
            turn.message,
        );
        let prompts = match self.services.prompts.render(PromptKind::Basic, &bank) {
            Ok(prompts) => prompts,
            Err(err) => {
                log::error!(
                    "trio::orchestration: prompt for {} failed to render, skipping: {}",
                    agent.name,
                    err
                );
                self.services
                    .emit_turn(TurnEvent::AgentSkipped {
                        chat_id,
                        agent_name: agent.name.clone(),
                    })
                    .await;
                return Ok(AgentResult::Skipped);
            }
        };

        let model = &self.services.config.response_model;
        let request =
            CompletionRequest::new(model, prompts.system, prompts.user).for_user(turn.principal.id);
        let completion = self.services.gateway.complete(&request, cancel).await?;
        self.services
            .record_usage(turn.principal.id, model, completion.usage.as_ref())
            .await;

        let content = completion.text.trim();
        if content.is_empty() {
            log::info!(
                "trio::orchestration: {} skipped, the message was directed at another agent",
                agent.name
            );
            self.services
                .emit_turn(TurnEvent::AgentSkipped {
                    chat_id,
                    agent_name: agent.name.clone(),
                })
                .await;
            return Ok(AgentResult::Skipped);
        }

        let pending = BasicMessage::new(turn.chat.id, &agent.name, content);
        let record = MemoryRecord {
            chat_external_id: turn.chat.external_id,
            message_external_id: pending.external_id,
            sender_name: &agent.name,
            content,
            created_at: pending.created_at,
        };
        let sqlite = self.services.store.clone();
        let stored = self
            .services
            .retriever
            .remember(&self.services.config.basic_collection, &[record], cancel, || async move {
                sqlite.run(move |store| store.store_basic_message(pending)).await
            })
            .await?;

        channel.report_agent_result(AgentResponse {
            agent_name: agent.name.clone(),
            content: stored.content.clone(),
            created_at: stored.created_at,
        });

        let elapsed = started.elapsed();
        log::info!(
            "trio::orchestration: {} responded in {:.2}s",
            agent.name,
            elapsed.as_secs_f64()
        );
        self.services
            .emit_turn(TurnEvent::AgentResponded {
                chat_id,
                agent_name: agent.name.clone(),
                tokens_used: completion.usage.clone(),
                elapsed_ms: elapsed.as_millis(),
            })
            .await;
        Ok(AgentResult::Responded)
    }
}
