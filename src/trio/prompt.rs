//! Prompt rendering.
//!
//! Each model call is described by an [`InformationBank`] assembled fresh for that
//! call and rendered through a system/user template pair. Templates are compiled
//! once when the [`PromptRenderer`] is built, either from the built-in defaults or
//! from a directory of overrides, and never read from disk per request.
//!
//! ```rust
//! use trio::prompt::{InformationBank, PromptKind, PromptRenderer};
//! use trio::models::AgentIdentity;
//!
//! let renderer = PromptRenderer::builtin().unwrap();
//! let roster = vec![
//!     AgentIdentity::new("Socrates", vec!["asks questions".into()]),
//!     AgentIdentity::new("Hypatia", vec!["precise".into()]),
//! ];
//! let bank = InformationBank::for_agent(1, "ada", &roster[0], &roster, vec![], vec![], "hello");
//! assert_eq!(bank.other_agents.len(), 1);
//!
//! let prompts = renderer.render(PromptKind::Basic, &bank).unwrap();
//! assert!(prompts.system.contains("Socrates"));
//! assert!(prompts.user.contains("hello"));
//! ```

use std::fs;
use std::path::Path;

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use crate::trio::error::EngineError;
use crate::trio::models::{AgentIdentity, HistoryEntry};

/// Which template pair to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Basic,
    Answerer,
    Evaluator,
}

impl PromptKind {
    pub const ALL: [PromptKind; 3] = [PromptKind::Basic, PromptKind::Answerer, PromptKind::Evaluator];

    fn stem(self) -> &'static str {
        match self {
            PromptKind::Basic => "basic",
            PromptKind::Answerer => "answerer",
            PromptKind::Evaluator => "evaluator",
        }
    }

    fn system_name(self) -> String {
        format!("{}_system", self.stem())
    }

    fn user_name(self) -> String {
        format!("{}_user", self.stem())
    }
}

fn builtin_source(name: &str) -> Option<&'static str> {
    match name {
        "basic_system" => Some(include_str!("../../templates/basic_system.j2")),
        "basic_user" => Some(include_str!("../../templates/basic_user.j2")),
        "answerer_system" => Some(include_str!("../../templates/answerer_system.j2")),
        "answerer_user" => Some(include_str!("../../templates/answerer_user.j2")),
        "evaluator_system" => Some(include_str!("../../templates/evaluator_system.j2")),
        "evaluator_user" => Some(include_str!("../../templates/evaluator_user.j2")),
        _ => None,
    }
}

/// One draft and the critique it received.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriorResponse {
    pub answer: String,
    pub evaluation: String,
    pub is_optimal: bool,
}

/// Everything a template can see for one model call. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct InformationBank {
    pub user_id: i64,
    pub username: String,
    /// The acting agent; `None` for reflection calls.
    pub agent: Option<AgentIdentity>,
    /// Every other agent present in the chat. Never contains `agent`.
    pub other_agents: Vec<AgentIdentity>,
    /// Newest first.
    pub chat_history: Vec<HistoryEntry>,
    /// Best match first.
    pub relevant_context: Vec<HistoryEntry>,
    pub new_message: String,
    pub prior_responses: Vec<PriorResponse>,
    /// 1-based number of the draft being produced or judged.
    pub iteration: usize,
    /// The draft under evaluation.
    pub draft: Option<String>,
}

impl InformationBank {
    /// Bank for `agent` answering in a basic chat with `roster`.
    pub fn for_agent(
        user_id: i64,
        username: &str,
        agent: &AgentIdentity,
        roster: &[AgentIdentity],
        chat_history: Vec<HistoryEntry>,
        relevant_context: Vec<HistoryEntry>,
        new_message: &str,
    ) -> Self {
        let other_agents = roster
            .iter()
            .filter(|candidate| candidate.name != agent.name)
            .cloned()
            .collect();
        Self {
            user_id,
            username: username.to_string(),
            agent: Some(agent.clone()),
            other_agents,
            chat_history,
            relevant_context,
            new_message: new_message.to_string(),
            prior_responses: Vec::new(),
            iteration: 1,
            draft: None,
        }
    }

    /// Bank for one reflection step.
    pub fn for_reflection(
        user_id: i64,
        username: &str,
        chat_history: Vec<HistoryEntry>,
        relevant_context: Vec<HistoryEntry>,
        new_message: &str,
        prior_responses: Vec<PriorResponse>,
        iteration: usize,
    ) -> Self {
        Self {
            user_id,
            username: username.to_string(),
            agent: None,
            other_agents: Vec::new(),
            chat_history,
            relevant_context,
            new_message: new_message.to_string(),
            prior_responses,
            iteration,
            draft: None,
        }
    }

    pub fn with_draft(mut self, draft: impl Into<String>) -> Self {
        self.draft = Some(draft.into());
        self
    }
}

/// Rendered prompt pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPair {
    pub system: String,
    pub user: String,
}

pub struct PromptRenderer {
    env: Environment<'static>,
}

impl PromptRenderer {
    /// Renderer using only the templates shipped with the crate.
    pub fn builtin() -> Result<Self, EngineError> {
        Self::from_sources(std::iter::empty::<(String, String)>())
    }

    /// Renderer preferring `<dir>/<kind>_<system|user>.j2` files over the built-ins.
    pub fn from_dir(dir: &Path) -> Result<Self, EngineError> {
        let mut overrides = Vec::new();
        for kind in PromptKind::ALL {
            for name in [kind.system_name(), kind.user_name()] {
                let path = dir.join(format!("{}.j2", name));
                if !path.exists() {
                    continue;
                }
                let source = fs::read_to_string(&path).map_err(|e| {
                    EngineError::Configuration(format!("cannot read {}: {}", path.display(), e))
                })?;
                log::info!("trio::prompt: using template override {}", path.display());
                overrides.push((name, source));
            }
        }
        Self::from_sources(overrides)
    }

    /// Renderer with explicit template sources keyed by `<kind>_<system|user>`;
    /// anything not supplied falls back to the built-in template.
    pub fn from_sources<I>(sources: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);

        let mut supplied = std::collections::HashSet::new();
        for (name, source) in sources {
            env.add_template_owned(name.clone(), source)
                .map_err(|e| EngineError::Configuration(format!("template {}: {}", name, e)))?;
            supplied.insert(name);
        }

        for kind in PromptKind::ALL {
            for name in [kind.system_name(), kind.user_name()] {
                if supplied.contains(&name) {
                    continue;
                }
                let source = builtin_source(&name).ok_or_else(|| {
                    EngineError::Configuration(format!("no built-in template {}", name))
                })?;
                env.add_template_owned(name.clone(), source)
                    .map_err(|e| EngineError::Configuration(format!("template {}: {}", name, e)))?;
            }
        }

        Ok(Self { env })
    }

    /// Render the system/user pair for `kind`.
    ///
    /// Any failure is an [`EngineError::Render`] that only concerns this call.
    pub fn render(&self, kind: PromptKind, bank: &InformationBank) -> Result<PromptPair, EngineError> {
        let system = self.env.get_template(&kind.system_name())?.render(bank)?;
        let user = self.env.get_template(&kind.user_name())?.render(bank)?;
        Ok(PromptPair { system, user })
    }
}
