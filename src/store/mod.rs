//! Persistence collaborator for sessions, messages, topics and logs.
//!
//! [`SessionStore`] is what the session engine needs from the database:
//! session record reads and resumable-field writes, message history, topic
//! and log rows, and the per-session staging associations that are cleared
//! when a session closes. [`SqliteStore`] implements it over rusqlite.

pub mod sqlite;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(format!("unknown message role: {s}")),
        }
    }
}

/// Status of a topic in the live session's staging table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationStatus {
    /// Retrieved this session but not matched on the latest turn.
    Cached,
    /// Matched on the latest turn.
    Current,
}

impl AssociationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Current => "current",
        }
    }
}

impl std::str::FromStr for AssociationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cached" => Ok(Self::Cached),
            "current" => Ok(Self::Current),
            _ => Err(format!("unknown association status: {s}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: i64,
    pub user_id: i64,
    pub username: String,
    pub time_left: u32,
    pub chars_since_check: usize,
    /// Empty when no topic draft is in flight.
    pub potential_topic: String,
    pub saved_query: String,
    pub character: String,
    pub topic_names: Vec<String>,
    pub topic_ids: Vec<i64>,
    pub asked_questions: Vec<String>,
    pub summary: Option<String>,
    pub ended: bool,
    /// True when the user has no earlier session.
    pub first_session: bool,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicRecord {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub description: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionTopic {
    pub topic: TopicRecord,
    pub status: AssociationStatus,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub id: i64,
    pub user_id: i64,
    pub topic_id: i64,
    pub topic_name: String,
    pub session_id: i64,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Session fields written after every turn so a reconnect can resume.
#[derive(Debug, Clone, Default)]
pub struct ResumableFields {
    pub chars_since_check: usize,
    pub potential_topic: String,
    pub saved_query: String,
    pub character: String,
    pub topic_names: Vec<String>,
    pub topic_ids: Vec<i64>,
    pub asked_questions: Vec<String>,
}

/// A topic to create (`id == None`) or update at session end.
#[derive(Debug, Clone)]
pub struct TopicEdit {
    pub id: Option<i64>,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct TopicChange {
    pub record: TopicRecord,
    pub created: bool,
    /// Name or description differs from what was stored.
    pub changed: bool,
}

#[derive(Debug, Clone)]
pub struct NewLog {
    pub topic_id: i64,
    pub text: String,
}

/// Everything written when a session closes, in one transaction.
#[derive(Debug, Clone)]
pub struct SessionClosing {
    pub summary: String,
    pub log: Option<NewLog>,
}

/// Synchronous data access; async callers go through `spawn_blocking`.
pub trait SessionStore: Send + Sync {
    fn load_session(&self, session_id: i64) -> Result<SessionRecord>;

    fn save_resumable(&self, session_id: i64, fields: &ResumableFields) -> Result<()>;

    fn set_time_left(&self, session_id: i64, minutes: u32) -> Result<()>;

    fn messages(&self, session_id: i64) -> Result<Vec<MessageRecord>>;

    fn append_message(&self, session_id: i64, role: Role, content: &str) -> Result<()>;

    fn character(&self, user_id: i64) -> Result<String>;

    fn save_character(&self, user_id: i64, character: &str) -> Result<()>;

    /// Summary of the user's most recent closed session before `session_id`.
    fn previous_summary(&self, user_id: i64, session_id: i64) -> Result<Option<String>>;

    fn session_topics(&self, session_id: i64) -> Result<Vec<SessionTopic>>;

    /// Most recently updated active topics for a user.
    fn active_topics(&self, user_id: i64, limit: usize) -> Result<Vec<TopicRecord>>;

    /// Insert a topic and stage it as `current` for the session.
    fn create_topic(
        &self,
        user_id: i64,
        session_id: i64,
        name: &str,
        description: &str,
        confidence: f64,
    ) -> Result<TopicRecord>;

    /// Replace the session's topic staging rows.
    fn sync_session_topics(
        &self,
        session_id: i64,
        topics: &[(i64, AssociationStatus, f64)],
    ) -> Result<()>;

    fn link_session_logs(&self, session_id: i64, log_ids: &[i64]) -> Result<()>;

    fn apply_topic_edits(&self, user_id: i64, edits: &[TopicEdit]) -> Result<Vec<TopicChange>>;

    /// Insert the session log (if any), clear staging rows, write the summary,
    /// zero `time_left` and mark the session ended.
    fn close_session(&self, session_id: i64, closing: &SessionClosing) -> Result<Option<LogRecord>>;

    fn recent_logs(&self, user_id: i64, limit: usize) -> Result<Vec<LogRecord>>;
}
