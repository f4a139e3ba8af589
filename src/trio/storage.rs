//! Relational persistence on SQLite.
//!
//! [`SqliteStore`] owns the schema and a single connection. Every method is a
//! short synchronous unit of work; nothing holds a transaction across a model
//! call. A reflection exchange is assembled in memory and written by
//! [`SqliteStore::save_reflection`] in one transaction once it has finished.
//!
//! The methods block, so async callers go through [`SqliteStore::run`], which
//! moves the work onto tokio's blocking pool.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use crate::trio::auth::{generate_token, hash_token, Principal};
use crate::trio::client_wrapper::TokenUsage;
use crate::trio::error::EngineError;
use crate::trio::models::{
    AgentIdentity, BasicChat, BasicMessage, EvaluatorMessage, HistoryEntry, Reflection,
    ReflectionChat, ReflectionMessage, ANSWERER_HISTORY_NAME, REFLECTOR_SENDER,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        external_id TEXT NOT NULL UNIQUE,
        username TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        token_hash TEXT NOT NULL UNIQUE,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS basic_chats (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        external_id TEXT NOT NULL UNIQUE,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        chat_name TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS basic_agents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        external_id TEXT NOT NULL UNIQUE,
        chat_id INTEGER NOT NULL REFERENCES basic_chats(id) ON DELETE CASCADE,
        agent_name TEXT NOT NULL,
        agent_traits TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL,
        UNIQUE(chat_id, agent_name)
    );

    CREATE TABLE IF NOT EXISTS basic_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        external_id TEXT NOT NULL UNIQUE,
        chat_id INTEGER NOT NULL REFERENCES basic_chats(id) ON DELETE CASCADE,
        sender_name TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS reflection_chats (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        external_id TEXT NOT NULL UNIQUE,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        chat_name TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS reflections (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        external_id TEXT NOT NULL UNIQUE,
        chat_id INTEGER NOT NULL REFERENCES reflection_chats(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS reflection_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        external_id TEXT NOT NULL UNIQUE,
        reflection_id INTEGER NOT NULL REFERENCES reflections(id) ON DELETE CASCADE,
        sender_name TEXT NOT NULL,
        is_optimal INTEGER NOT NULL DEFAULT 0,
        title TEXT NOT NULL DEFAULT '',
        content TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS evaluator_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        external_id TEXT NOT NULL UNIQUE,
        reflection_id INTEGER NOT NULL REFERENCES reflections(id) ON DELETE CASCADE,
        content TEXT NOT NULL,
        is_optimal INTEGER NOT NULL DEFAULT 0,
        verdict INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS usage_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
        model_name TEXT NOT NULL,
        input_tokens INTEGER NOT NULL,
        output_tokens INTEGER NOT NULL,
        total_tokens INTEGER NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_basic_messages_chat
        ON basic_messages(chat_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_reflections_chat
        ON reflections(chat_id);
    CREATE INDEX IF NOT EXISTS idx_reflection_messages_reflection
        ON reflection_messages(reflection_id, is_optimal);
    CREATE INDEX IF NOT EXISTS idx_evaluator_messages_reflection
        ON evaluator_messages(reflection_id);
";

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and applies the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        log::info!("trio::storage: database opened at {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `work` against the store on the blocking pool.
    pub async fn run<T, F>(self: &Arc<Self>, work: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStore) -> Result<T, EngineError> + Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || work(store.as_ref()))
            .await
            .map_err(|e| EngineError::Persistence(format!("store task failed: {}", e)))?
    }

    // -----------------------------------------------------------------------
    // Users and sessions
    // -----------------------------------------------------------------------

    pub fn create_user(&self, username: &str) -> Result<Principal, EngineError> {
        let external_id = Uuid::new_v4();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO users (external_id, username, created_at) VALUES (?1, ?2, ?3)",
            params![external_id.to_string(), username, Utc::now()],
        )?;
        Ok(Principal {
            id: conn.last_insert_rowid(),
            external_id,
            username: username.to_string(),
        })
    }

    /// Issue a session token for `user_id`. Only its digest is stored.
    pub fn create_session(&self, user_id: i64) -> Result<String, EngineError> {
        let token = generate_token();
        self.conn().execute(
            "INSERT INTO sessions (token_hash, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![hash_token(&token), user_id, Utc::now()],
        )?;
        Ok(token)
    }

    pub fn resolve_session(&self, token: &str) -> Result<Option<Principal>, EngineError> {
        let principal = self
            .conn()
            .query_row(
                "SELECT u.id, u.external_id, u.username
                 FROM sessions s JOIN users u ON u.id = s.user_id
                 WHERE s.token_hash = ?1",
                params![hash_token(token)],
                |row| {
                    Ok(Principal {
                        id: row.get(0)?,
                        external_id: uuid_at(row, 1)?,
                        username: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(principal)
    }

    // -----------------------------------------------------------------------
    // Chats
    // -----------------------------------------------------------------------

    /// Create a basic chat together with its agent roster.
    pub fn create_basic_chat(
        &self,
        user_id: i64,
        chat_name: &str,
        agents: &[AgentIdentity],
    ) -> Result<BasicChat, EngineError> {
        let external_id = Uuid::new_v4();
        let created_at = Utc::now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO basic_chats (external_id, user_id, chat_name, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![external_id.to_string(), user_id, chat_name, created_at],
        )?;
        let chat_id = tx.last_insert_rowid();
        for agent in agents {
            let traits = serde_json::to_string(&agent.traits)
                .map_err(|e| EngineError::Persistence(e.to_string()))?;
            tx.execute(
                "INSERT INTO basic_agents (external_id, chat_id, agent_name, agent_traits, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![Uuid::new_v4().to_string(), chat_id, agent.name, traits, created_at],
            )?;
        }
        tx.commit()?;

        Ok(BasicChat {
            id: chat_id,
            external_id,
            user_id,
            chat_name: chat_name.to_string(),
            chat_agents: agents.to_vec(),
            created_at,
        })
    }

    /// Load a basic chat and its agents, provided `principal` owns it.
    pub fn find_basic_chat(
        &self,
        principal: &Principal,
        external_id: Uuid,
    ) -> Result<BasicChat, EngineError> {
        let conn = self.conn();
        let chat = conn
            .query_row(
                "SELECT id, external_id, user_id, chat_name, created_at
                 FROM basic_chats WHERE external_id = ?1 AND user_id = ?2",
                params![external_id.to_string(), principal.id],
                |row| {
                    Ok(BasicChat {
                        id: row.get(0)?,
                        external_id: uuid_at(row, 1)?,
                        user_id: row.get(2)?,
                        chat_name: row.get(3)?,
                        chat_agents: Vec::new(),
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        let Some(mut chat) = chat else {
            return Err(EngineError::NotFound("Chat".into()));
        };

        let mut stmt = conn.prepare(
            "SELECT agent_name, agent_traits FROM basic_agents WHERE chat_id = ?1 ORDER BY id",
        )?;
        let agents = stmt
            .query_map(params![chat.id], |row| {
                let traits: String = row.get(1)?;
                let traits: Vec<String> = serde_json::from_str(&traits).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
                })?;
                Ok(AgentIdentity {
                    name: row.get(0)?,
                    traits,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        chat.chat_agents = agents;
        Ok(chat)
    }

    pub fn create_reflection_chat(
        &self,
        user_id: i64,
        chat_name: &str,
    ) -> Result<ReflectionChat, EngineError> {
        let external_id = Uuid::new_v4();
        let created_at = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO reflection_chats (external_id, user_id, chat_name, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![external_id.to_string(), user_id, chat_name, created_at],
        )?;
        Ok(ReflectionChat {
            id: conn.last_insert_rowid(),
            external_id,
            user_id,
            chat_name: chat_name.to_string(),
            created_at,
        })
    }

    pub fn find_reflection_chat(
        &self,
        principal: &Principal,
        external_id: Uuid,
    ) -> Result<ReflectionChat, EngineError> {
        self.conn()
            .query_row(
                "SELECT id, external_id, user_id, chat_name, created_at
                 FROM reflection_chats WHERE external_id = ?1 AND user_id = ?2",
                params![external_id.to_string(), principal.id],
                |row| {
                    Ok(ReflectionChat {
                        id: row.get(0)?,
                        external_id: uuid_at(row, 1)?,
                        user_id: row.get(2)?,
                        chat_name: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| EngineError::NotFound("Chat".into()))
    }

    /// Delete a basic chat with its agents and messages.
    pub fn delete_basic_chat(&self, principal: &Principal, external_id: Uuid) -> Result<(), EngineError> {
        self.delete_chat("basic_chats", principal, external_id)
    }

    /// Delete a reflection chat with every reflection in it.
    pub fn delete_reflection_chat(
        &self,
        principal: &Principal,
        external_id: Uuid,
    ) -> Result<(), EngineError> {
        self.delete_chat("reflection_chats", principal, external_id)
    }

    fn delete_chat(&self, table: &str, principal: &Principal, external_id: Uuid) -> Result<(), EngineError> {
        let deleted = self.conn().execute(
            &format!("DELETE FROM {} WHERE external_id = ?1 AND user_id = ?2", table),
            params![external_id.to_string(), principal.id],
        )?;
        if deleted == 0 {
            return Err(EngineError::NotFound("Chat".into()));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Messages and history
    // -----------------------------------------------------------------------

    pub fn insert_basic_message(
        &self,
        chat_id: i64,
        sender_name: &str,
        content: &str,
    ) -> Result<BasicMessage, EngineError> {
        self.store_basic_message(BasicMessage::new(chat_id, sender_name, content))
    }

    /// Store a message built ahead of time, keeping its public id and timestamp.
    pub fn store_basic_message(&self, mut message: BasicMessage) -> Result<BasicMessage, EngineError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO basic_messages (external_id, chat_id, sender_name, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.external_id.to_string(),
                message.chat_id,
                message.sender_name,
                message.content,
                message.created_at
            ],
        )?;
        message.id = conn.last_insert_rowid();
        Ok(message)
    }

    /// All messages of a basic chat, oldest first.
    pub fn basic_messages(&self, chat_id: i64) -> Result<Vec<BasicMessage>, EngineError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, external_id, chat_id, sender_name, content, created_at
             FROM basic_messages WHERE chat_id = ?1 ORDER BY created_at, id",
        )?;
        let messages = stmt
            .query_map(params![chat_id], |row| {
                Ok(BasicMessage {
                    id: row.get(0)?,
                    external_id: uuid_at(row, 1)?,
                    chat_id: row.get(2)?,
                    sender_name: row.get(3)?,
                    content: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    /// Most recent messages of a basic chat, newest first.
    pub fn basic_history(&self, chat_id: i64, limit: usize) -> Result<Vec<HistoryEntry>, EngineError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT sender_name, content, created_at FROM basic_messages
             WHERE chat_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let history = stmt
            .query_map(params![chat_id, limit as i64], history_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(history)
    }

    /// Accepted reflection answers of a chat, newest first.
    ///
    /// Drafts that were never judged optimal are excluded.
    pub fn reflection_history(
        &self,
        chat_id: i64,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, EngineError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT m.sender_name, m.content, m.created_at
             FROM reflection_messages m JOIN reflections r ON r.id = m.reflection_id
             WHERE r.chat_id = ?1 AND m.is_optimal = 1
             ORDER BY m.created_at DESC, m.id DESC LIMIT ?2",
        )?;
        let history = stmt
            .query_map(params![chat_id, limit as i64], history_entry)?
            .map(|entry| {
                entry.map(|mut entry| {
                    if entry.sender_name == REFLECTOR_SENDER {
                        entry.sender_name = ANSWERER_HISTORY_NAME.to_string();
                    }
                    entry
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(history)
    }

    /// Every committed reflection of a chat with its messages, oldest first.
    pub fn reflections(&self, chat_id: i64) -> Result<Vec<Reflection>, EngineError> {
        let conn = self.conn();
        let ids = {
            let mut stmt = conn.prepare("SELECT id FROM reflections WHERE chat_id = ?1 ORDER BY id")?;
            let ids = stmt
                .query_map(params![chat_id], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };
        ids.into_iter()
            .map(|id| load_reflection(&conn, id))
            .collect()
    }

    /// Write a finished exchange (the record, its messages and evaluations) in
    /// one transaction and return it as stored.
    ///
    /// Public ids and timestamps of the in-memory record are kept, so anything
    /// already streamed or indexed under them stays valid.
    pub fn save_reflection(&self, reflection: &Reflection) -> Result<Reflection, EngineError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO reflections (external_id, chat_id, created_at) VALUES (?1, ?2, ?3)",
            params![
                reflection.external_id.to_string(),
                reflection.chat_id,
                reflection.created_at
            ],
        )?;
        let reflection_id = tx.last_insert_rowid();

        for message in &reflection.messages {
            tx.execute(
                "INSERT INTO reflection_messages
                     (external_id, reflection_id, sender_name, is_optimal, title, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    message.external_id.to_string(),
                    reflection_id,
                    message.sender_name,
                    message.is_optimal,
                    message.title,
                    message.content,
                    message.created_at
                ],
            )?;
        }
        for evaluation in &reflection.evaluator_messages {
            tx.execute(
                "INSERT INTO evaluator_messages
                     (external_id, reflection_id, content, is_optimal, verdict, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    evaluation.external_id.to_string(),
                    reflection_id,
                    evaluation.content,
                    evaluation.is_optimal,
                    evaluation.evaluator_verdict,
                    evaluation.created_at
                ],
            )?;
        }

        let saved = load_reflection(&tx, reflection_id)?;
        tx.commit()?;
        Ok(saved)
    }

    // -----------------------------------------------------------------------
    // Usage
    // -----------------------------------------------------------------------

    pub fn record_usage(
        &self,
        user_id: Option<i64>,
        model_name: &str,
        usage: &TokenUsage,
    ) -> Result<(), EngineError> {
        self.conn().execute(
            "INSERT INTO usage_records (user_id, model_name, input_tokens, output_tokens, total_tokens, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                model_name,
                usage.input_tokens as i64,
                usage.output_tokens as i64,
                usage.total_tokens as i64,
                Utc::now()
            ],
        )?;
        Ok(())
    }

    /// Sum of all recorded usage for a user.
    pub fn usage_totals(&self, user_id: i64) -> Result<TokenUsage, EngineError> {
        let usage = self.conn().query_row(
            "SELECT COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                    COALESCE(SUM(total_tokens), 0)
             FROM usage_records WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(TokenUsage {
                    input_tokens: row.get::<_, i64>(0)? as usize,
                    output_tokens: row.get::<_, i64>(1)? as usize,
                    total_tokens: row.get::<_, i64>(2)? as usize,
                })
            },
        )?;
        Ok(usage)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_connection(path: &Path) -> Result<Connection, EngineError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn history_entry(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    Ok(HistoryEntry {
        sender_name: row.get(0)?,
        content: row.get(1)?,
        sent_at: row.get::<_, DateTime<Utc>>(2)?,
    })
}

fn load_reflection(conn: &Connection, reflection_id: i64) -> Result<Reflection, EngineError> {
    let mut reflection = conn
        .query_row(
            "SELECT id, external_id, chat_id, created_at FROM reflections WHERE id = ?1",
            params![reflection_id],
            |row| {
                Ok(Reflection {
                    id: row.get(0)?,
                    external_id: uuid_at(row, 1)?,
                    chat_id: row.get(2)?,
                    messages: Vec::new(),
                    evaluator_messages: Vec::new(),
                    created_at: row.get(3)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| EngineError::NotFound("Reflection".into()))?;

    let mut stmt = conn.prepare(
        "SELECT id, external_id, sender_name, is_optimal, title, content, created_at
         FROM reflection_messages WHERE reflection_id = ?1 ORDER BY id",
    )?;
    reflection.messages = stmt
        .query_map(params![reflection_id], |row| {
            Ok(ReflectionMessage {
                id: row.get(0)?,
                external_id: uuid_at(row, 1)?,
                sender_name: row.get(2)?,
                is_optimal: row.get(3)?,
                title: row.get(4)?,
                content: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT id, external_id, content, is_optimal, verdict, created_at
         FROM evaluator_messages WHERE reflection_id = ?1 ORDER BY id",
    )?;
    reflection.evaluator_messages = stmt
        .query_map(params![reflection_id], |row| {
            Ok(EvaluatorMessage {
                id: row.get(0)?,
                external_id: uuid_at(row, 1)?,
                content: row.get(2)?,
                is_optimal: row.get(3)?,
                evaluator_verdict: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(reflection)
}
