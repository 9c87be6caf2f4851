//! SQL DDL for all tables.
//!
//! Defines the journaling tables (`users`, `sessions`, `messages`, `topics`,
//! `logs`), the per-session staging tables (`session_topics`, `session_logs`),
//! the vector index bookkeeping (`index_entries` plus the `topics_vec` and
//! `logs_vec` vec0 tables) and `schema_meta`. All DDL uses `IF NOT EXISTS` for
//! idempotent initialization.

use rusqlite::Connection;

/// Schema v1. Later columns arrive through [`super::migrations`].
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    character TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    time_left INTEGER NOT NULL CHECK(time_left >= 0),
    chars_since_check INTEGER NOT NULL DEFAULT 0,
    potential_topic TEXT NOT NULL DEFAULT '',
    saved_query TEXT NOT NULL DEFAULT '',
    character TEXT NOT NULL DEFAULT '',
    topic_names TEXT NOT NULL DEFAULT '[]',
    topic_ids TEXT NOT NULL DEFAULT '[]',
    summary TEXT,
    ended INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    role TEXT NOT NULL CHECK(role IN ('user','assistant')),
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);

CREATE TABLE IF NOT EXISTS topics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_topics_user ON topics(user_id);

CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    topic_id INTEGER NOT NULL REFERENCES topics(id) ON DELETE CASCADE,
    session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    text TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_logs_user ON logs(user_id);
CREATE INDEX IF NOT EXISTS idx_logs_topic ON logs(topic_id);

-- Staging rows for the live session; cleared at session end
CREATE TABLE IF NOT EXISTS session_topics (
    session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    topic_id INTEGER NOT NULL REFERENCES topics(id) ON DELETE CASCADE,
    status TEXT NOT NULL CHECK(status IN ('cached','current')),
    confidence REAL NOT NULL DEFAULT 0.0,
    PRIMARY KEY (session_id, topic_id)
);

CREATE TABLE IF NOT EXISTS session_logs (
    session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    log_id INTEGER NOT NULL REFERENCES logs(id) ON DELETE CASCADE,
    PRIMARY KEY (session_id, log_id)
);

-- Vector index bookkeeping: one row per vec0 entry
CREATE TABLE IF NOT EXISTS index_entries (
    entry_id TEXT PRIMARY KEY,
    namespace TEXT NOT NULL CHECK(namespace IN ('topics','logs')),
    business_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    metadata TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_index_entries_business ON index_entries(namespace, business_id);
CREATE INDEX IF NOT EXISTS idx_index_entries_user ON index_entries(namespace, user_id, updated_at);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual tables must be created separately (sqlite-vec syntax).
const VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS topics_vec USING vec0(
    entry_id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);

CREATE VIRTUAL TABLE IF NOT EXISTS logs_vec USING vec0(
    entry_id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(VEC_TABLE_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
