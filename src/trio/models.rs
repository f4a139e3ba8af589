//! Persisted record shapes.
//!
//! Rows are keyed by a surrogate integer id internally; only the uuid
//! `external_id` is ever serialized to clients (as `id`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sender name stored on every reflection draft.
pub const REFLECTOR_SENDER: &str = "Reflector";
/// Name accepted reflection answers carry in prompt history.
pub const ANSWERER_HISTORY_NAME: &str = "Answerer";

/// A named persona participating in a basic chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    #[serde(rename = "agentName")]
    pub name: String,
    #[serde(rename = "agentTraits")]
    pub traits: Vec<String>,
}

impl AgentIdentity {
    pub fn new(name: impl Into<String>, traits: Vec<String>) -> Self {
        Self {
            name: name.into(),
            traits,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicChat {
    #[serde(skip)]
    pub id: i64,
    #[serde(rename = "id")]
    pub external_id: Uuid,
    #[serde(skip)]
    pub user_id: i64,
    pub chat_name: String,
    pub chat_agents: Vec<AgentIdentity>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicMessage {
    #[serde(skip)]
    pub id: i64,
    #[serde(rename = "id")]
    pub external_id: Uuid,
    #[serde(skip)]
    pub chat_id: i64,
    pub sender_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl BasicMessage {
    /// A message that has not been stored yet; `id` stays 0 until it is.
    pub fn new(chat_id: i64, sender_name: &str, content: &str) -> Self {
        Self {
            id: 0,
            external_id: Uuid::new_v4(),
            chat_id,
            sender_name: sender_name.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectionChat {
    #[serde(skip)]
    pub id: i64,
    #[serde(rename = "id")]
    pub external_id: Uuid,
    #[serde(skip)]
    pub user_id: i64,
    pub chat_name: String,
    pub created_at: DateTime<Utc>,
}

/// One user exchange in a reflection chat with its full deliberation trail.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reflection {
    #[serde(skip)]
    pub id: i64,
    #[serde(rename = "id")]
    pub external_id: Uuid,
    #[serde(skip)]
    pub chat_id: i64,
    /// The user's message first, then one draft per iteration.
    pub messages: Vec<ReflectionMessage>,
    pub evaluator_messages: Vec<EvaluatorMessage>,
    pub created_at: DateTime<Utc>,
}

impl Reflection {
    /// An empty exchange record held in memory until it is saved whole.
    pub fn new(chat_id: i64) -> Self {
        Self {
            id: 0,
            external_id: Uuid::new_v4(),
            chat_id,
            messages: Vec::new(),
            evaluator_messages: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// The accepted answer, if the exchange has converged.
    pub fn optimal_message(&self) -> Option<&ReflectionMessage> {
        self.messages.iter().rev().find(|m| m.is_optimal)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectionMessage {
    #[serde(skip)]
    pub id: i64,
    #[serde(rename = "id")]
    pub external_id: Uuid,
    pub sender_name: String,
    pub is_optimal: bool,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ReflectionMessage {
    pub fn new(sender_name: &str, content: &str) -> Self {
        Self {
            id: 0,
            external_id: Uuid::new_v4(),
            sender_name: sender_name.to_string(),
            is_optimal: false,
            title: String::new(),
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatorMessage {
    #[serde(skip)]
    pub id: i64,
    #[serde(rename = "id")]
    pub external_id: Uuid,
    pub content: String,
    /// Acceptance flag; forced to true when the iteration cap is reached.
    pub is_optimal: bool,
    /// What the evaluator actually answered.
    pub evaluator_verdict: bool,
    pub created_at: DateTime<Utc>,
}

impl EvaluatorMessage {
    pub fn new(content: &str, is_optimal: bool, evaluator_verdict: bool) -> Self {
        Self {
            id: 0,
            external_id: Uuid::new_v4(),
            content: content.to_string(),
            is_optimal,
            evaluator_verdict,
            created_at: Utc::now(),
        }
    }
}

/// A message as handed to prompt templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub sender_name: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

/// Per-agent entry of a basic chat stream snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub agent_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
