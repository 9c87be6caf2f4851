use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{
    AssociationStatus, LogRecord, MessageRecord, ResumableFields, Role, SessionClosing,
    SessionRecord, SessionStore, SessionTopic, TopicChange, TopicEdit, TopicRecord,
};

pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|e| anyhow!("db lock poisoned: {e}"))
    }

    /// Look up a user by name, creating the row on first use.
    pub fn find_or_create_user(&self, username: &str) -> Result<i64> {
        let username = username.trim();
        anyhow::ensure!(!username.is_empty(), "username must not be empty");
        let conn = self.conn()?;
        if let Some(id) = conn
            .query_row(
                "SELECT id FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?
        {
            return Ok(id);
        }
        conn.execute(
            "INSERT INTO users (username, created_at) VALUES (?1, ?2)",
            params![username, now()],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(user_id = id, username = %username, "user created");
        Ok(id)
    }

    pub fn find_user(&self, username: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id FROM users WHERE username = ?1",
                params![username.trim()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Create a fresh session with `minutes` on the clock.
    pub fn create_session(&self, user_id: i64, minutes: u32) -> Result<i64> {
        let conn = self.conn()?;
        let ts = now();
        conn.execute(
            "INSERT INTO sessions (user_id, time_left, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![user_id, minutes, ts],
        )
        .context("failed to create session")?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent session of a user that has not ended.
    pub fn open_session(&self, user_id: i64) -> Result<Option<i64>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id FROM sessions WHERE user_id = ?1 AND ended = 0 AND time_left > 0 \
                 ORDER BY id DESC LIMIT 1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?)
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn json_list<T: serde::de::DeserializeOwned>(raw: &str) -> Vec<T> {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "malformed JSON list in session record, treating as empty");
        Vec::new()
    })
}

fn topic_from_row(row: &Row<'_>) -> rusqlite::Result<TopicRecord> {
    Ok(TopicRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        updated_at: timestamp(row, 4)?,
    })
}

const TOPIC_COLUMNS: &str = "t.id, t.user_id, t.name, t.description, t.updated_at";

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<LogRecord> {
    Ok(LogRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        topic_id: row.get(2)?,
        topic_name: row.get(3)?,
        session_id: row.get(4)?,
        text: row.get(5)?,
        created_at: timestamp(row, 6)?,
    })
}

const LOG_SELECT: &str = "SELECT l.id, l.user_id, l.topic_id, t.name, l.session_id, l.text, l.created_at \
                          FROM logs l JOIN topics t ON t.id = l.topic_id";

fn find_topic(conn: &Connection, user_id: i64, id: Option<i64>, name: &str) -> Result<Option<TopicRecord>> {
    let by_id = match id {
        Some(id) => conn
            .query_row(
                &format!("SELECT {TOPIC_COLUMNS} FROM topics t WHERE t.id = ?1 AND t.user_id = ?2"),
                params![id, user_id],
                topic_from_row,
            )
            .optional()?,
        None => None,
    };
    if by_id.is_some() {
        return Ok(by_id);
    }
    Ok(conn
        .query_row(
            &format!(
                "SELECT {TOPIC_COLUMNS} FROM topics t \
                 WHERE t.user_id = ?1 AND lower(t.name) = lower(?2) AND t.active = 1 \
                 ORDER BY t.updated_at DESC LIMIT 1"
            ),
            params![user_id, name.trim()],
            topic_from_row,
        )
        .optional()?)
}

impl SessionStore for SqliteStore {
    fn load_session(&self, session_id: i64) -> Result<SessionRecord> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT s.id, s.user_id, u.username, s.time_left, s.chars_since_check, \
                 s.potential_topic, s.saved_query, s.character, s.topic_names, s.topic_ids, \
                 s.asked_questions, s.summary, s.ended, \
                 (SELECT COUNT(*) FROM sessions p WHERE p.user_id = s.user_id AND p.id < s.id) \
                 FROM sessions s JOIN users u ON u.id = s.user_id WHERE s.id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionRecord {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        username: row.get(2)?,
                        time_left: row.get(3)?,
                        chars_since_check: row.get::<_, i64>(4)?.max(0) as usize,
                        potential_topic: row.get(5)?,
                        saved_query: row.get(6)?,
                        character: row.get(7)?,
                        topic_names: json_list(&row.get::<_, String>(8)?),
                        topic_ids: json_list(&row.get::<_, String>(9)?),
                        asked_questions: json_list(&row.get::<_, String>(10)?),
                        summary: row.get(11)?,
                        ended: row.get(12)?,
                        first_session: row.get::<_, i64>(13)? == 0,
                    })
                },
            )
            .optional()?;
        record.ok_or_else(|| anyhow!("session not found: {session_id}"))
    }

    fn save_resumable(&self, session_id: i64, fields: &ResumableFields) -> Result<()> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE sessions SET chars_since_check = ?1, potential_topic = ?2, saved_query = ?3, \
             character = ?4, topic_names = ?5, topic_ids = ?6, asked_questions = ?7, updated_at = ?8 \
             WHERE id = ?9",
            params![
                fields.chars_since_check as i64,
                fields.potential_topic,
                fields.saved_query,
                fields.character,
                serde_json::to_string(&fields.topic_names)?,
                serde_json::to_string(&fields.topic_ids)?,
                serde_json::to_string(&fields.asked_questions)?,
                now(),
                session_id,
            ],
        )?;
        if rows == 0 {
            bail!("session not found: {session_id}");
        }
        Ok(())
    }

    fn set_time_left(&self, session_id: i64, minutes: u32) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sessions SET time_left = ?1, updated_at = ?2 WHERE id = ?3",
            params![minutes, now(), session_id],
        )?;
        Ok(())
    }

    fn messages(&self, session_id: i64) -> Result<Vec<MessageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT role, content, created_at FROM messages WHERE session_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                let role: String = row.get(0)?;
                let role = role.parse::<Role>().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        e.into(),
                    )
                })?;
                Ok(MessageRecord {
                    role,
                    content: row.get(1)?,
                    created_at: timestamp(row, 2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn append_message(&self, session_id: i64, role: Role, content: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (session_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, role.as_str(), content, now()],
        )?;
        Ok(())
    }

    fn character(&self, user_id: i64) -> Result<String> {
        let conn = self.conn()?;
        let character = conn
            .query_row(
                "SELECT character FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        character.ok_or_else(|| anyhow!("user not found: {user_id}"))
    }

    fn save_character(&self, user_id: i64, character: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE users SET character = ?1 WHERE id = ?2",
            params![character, user_id],
        )?;
        Ok(())
    }

    fn previous_summary(&self, user_id: i64, session_id: i64) -> Result<Option<String>> {
        let conn = self.conn()?;
        let summary: Option<Option<String>> = conn
            .query_row(
                "SELECT summary FROM sessions \
                 WHERE user_id = ?1 AND id < ?2 AND ended = 1 AND summary IS NOT NULL \
                 ORDER BY id DESC LIMIT 1",
                params![user_id, session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(summary.flatten())
    }

    fn session_topics(&self, session_id: i64) -> Result<Vec<SessionTopic>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TOPIC_COLUMNS}, st.status, st.confidence \
             FROM session_topics st JOIN topics t ON t.id = st.topic_id \
             WHERE st.session_id = ?1 ORDER BY st.confidence DESC"
        ))?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                let status: String = row.get(5)?;
                Ok(SessionTopic {
                    topic: topic_from_row(row)?,
                    status: status.parse().unwrap_or(AssociationStatus::Cached),
                    confidence: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn active_topics(&self, user_id: i64, limit: usize) -> Result<Vec<TopicRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TOPIC_COLUMNS} FROM topics t WHERE t.user_id = ?1 AND t.active = 1 \
             ORDER BY t.updated_at DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], topic_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn create_topic(
        &self,
        user_id: i64,
        session_id: i64,
        name: &str,
        description: &str,
        confidence: f64,
    ) -> Result<TopicRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let ts = now();
        tx.execute(
            "INSERT INTO topics (user_id, name, description, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![user_id, name, description, ts],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT OR REPLACE INTO session_topics (session_id, topic_id, status, confidence) \
             VALUES (?1, ?2, 'current', ?3)",
            params![session_id, id, confidence],
        )?;
        let record = tx.query_row(
            &format!("SELECT {TOPIC_COLUMNS} FROM topics t WHERE t.id = ?1"),
            params![id],
            topic_from_row,
        )?;
        tx.commit()?;
        tracing::info!(topic_id = id, user_id, name = %name, "topic created");
        Ok(record)
    }

    fn sync_session_topics(
        &self,
        session_id: i64,
        topics: &[(i64, AssociationStatus, f64)],
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM session_topics WHERE session_id = ?1",
            params![session_id],
        )?;
        for (topic_id, status, confidence) in topics {
            tx.execute(
                "INSERT OR REPLACE INTO session_topics (session_id, topic_id, status, confidence) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![session_id, topic_id, status.as_str(), confidence],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn link_session_logs(&self, session_id: i64, log_ids: &[i64]) -> Result<()> {
        let conn = self.conn()?;
        for log_id in log_ids {
            conn.execute(
                "INSERT OR IGNORE INTO session_logs (session_id, log_id) VALUES (?1, ?2)",
                params![session_id, log_id],
            )?;
        }
        Ok(())
    }

    fn apply_topic_edits(&self, user_id: i64, edits: &[TopicEdit]) -> Result<Vec<TopicChange>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changes = Vec::with_capacity(edits.len());

        for edit in edits {
            let name = edit.name.trim();
            let description = edit.description.trim();
            let ts = now();

            let change = match find_topic(&tx, user_id, edit.id, name)? {
                Some(existing) => {
                    let changed = existing.name != name || existing.description != description;
                    if changed {
                        tx.execute(
                            "UPDATE topics SET name = ?1, description = ?2, updated_at = ?3 WHERE id = ?4",
                            params![name, description, ts, existing.id],
                        )?;
                    }
                    TopicChange {
                        record: tx.query_row(
                            &format!("SELECT {TOPIC_COLUMNS} FROM topics t WHERE t.id = ?1"),
                            params![existing.id],
                            topic_from_row,
                        )?,
                        created: false,
                        changed,
                    }
                }
                None => {
                    tx.execute(
                        "INSERT INTO topics (user_id, name, description, created_at, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?4)",
                        params![user_id, name, description, ts],
                    )?;
                    let id = tx.last_insert_rowid();
                    TopicChange {
                        record: tx.query_row(
                            &format!("SELECT {TOPIC_COLUMNS} FROM topics t WHERE t.id = ?1"),
                            params![id],
                            topic_from_row,
                        )?,
                        created: true,
                        changed: true,
                    }
                }
            };
            changes.push(change);
        }

        tx.commit()?;
        Ok(changes)
    }

    fn close_session(&self, session_id: i64, closing: &SessionClosing) -> Result<Option<LogRecord>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let user_id: i64 = tx
            .query_row(
                "SELECT user_id FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| anyhow!("session not found: {session_id}"))?;

        let log = match &closing.log {
            Some(new_log) => {
                tx.execute(
                    "INSERT INTO logs (user_id, topic_id, session_id, text, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![user_id, new_log.topic_id, session_id, new_log.text, now()],
                )?;
                let id = tx.last_insert_rowid();
                Some(tx.query_row(&format!("{LOG_SELECT} WHERE l.id = ?1"), params![id], log_from_row)?)
            }
            None => None,
        };

        tx.execute("DELETE FROM session_topics WHERE session_id = ?1", params![session_id])?;
        tx.execute("DELETE FROM session_logs WHERE session_id = ?1", params![session_id])?;
        tx.execute(
            "UPDATE sessions SET summary = ?1, time_left = 0, ended = 1, potential_topic = '', \
             saved_query = '', updated_at = ?2 WHERE id = ?3",
            params![closing.summary, now(), session_id],
        )?;
        tx.commit()?;

        tracing::info!(session_id, log_id = ?log.as_ref().map(|l| l.id), "session closed");
        Ok(log)
    }

    fn recent_logs(&self, user_id: i64, limit: usize) -> Result<Vec<LogRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{LOG_SELECT} WHERE l.user_id = ?1 ORDER BY l.created_at DESC, l.id DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], log_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewLog;

    fn test_store() -> SqliteStore {
        let conn = crate::db::open_memory_database().unwrap();
        SqliteStore::new(Arc::new(Mutex::new(conn)))
    }

    #[test]
    fn first_session_flag() {
        let store = test_store();
        let user = store.find_or_create_user("ana").unwrap();
        let s1 = store.create_session(user, 30).unwrap();
        let s2 = store.create_session(user, 30).unwrap();

        assert!(store.load_session(s1).unwrap().first_session);
        let second = store.load_session(s2).unwrap();
        assert!(!second.first_session);
        assert_eq!(second.username, "ana");
        assert_eq!(second.time_left, 30);
        assert!(second.asked_questions.is_empty());
    }

    #[test]
    fn find_or_create_user_is_stable() {
        let store = test_store();
        let a = store.find_or_create_user("ana").unwrap();
        let b = store.find_or_create_user(" ana ").unwrap();
        assert_eq!(a, b);
        assert!(store.find_or_create_user("   ").is_err());
    }

    #[test]
    fn resumable_fields_roundtrip() {
        let store = test_store();
        let user = store.find_or_create_user("ana").unwrap();
        let session = store.create_session(user, 30).unwrap();

        store
            .save_resumable(
                session,
                &ResumableFields {
                    chars_since_check: 42,
                    potential_topic: "Running: training for a race".into(),
                    saved_query: "what should I do?".into(),
                    character: "curious".into(),
                    topic_names: vec!["Running".into()],
                    topic_ids: vec![3],
                    asked_questions: vec!["How often do you run?".into()],
                },
            )
            .unwrap();

        let record = store.load_session(session).unwrap();
        assert_eq!(record.chars_since_check, 42);
        assert_eq!(record.potential_topic, "Running: training for a race");
        assert_eq!(record.topic_ids, vec![3]);
        assert_eq!(record.asked_questions, vec!["How often do you run?".to_string()]);
    }

    #[test]
    fn messages_keep_order() {
        let store = test_store();
        let user = store.find_or_create_user("ana").unwrap();
        let session = store.create_session(user, 30).unwrap();
        store.append_message(session, Role::Assistant, "Hi!").unwrap();
        store.append_message(session, Role::User, "Hello").unwrap();

        let messages = store.messages(session).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[1].content, "Hello");
    }

    #[test]
    fn topic_edits_update_or_create() {
        let store = test_store();
        let user = store.find_or_create_user("ana").unwrap();
        let session = store.create_session(user, 30).unwrap();
        let career = store
            .create_topic(user, session, "Career", "Looking for a new job", 0.85)
            .unwrap();

        let changes = store
            .apply_topic_edits(
                user,
                &[
                    TopicEdit {
                        id: None,
                        name: "career".into(),
                        description: "Interviewing at two companies".into(),
                    },
                    TopicEdit {
                        id: None,
                        name: "Family".into(),
                        description: "Sister moving back home".into(),
                    },
                    TopicEdit {
                        id: Some(career.id),
                        name: "career".into(),
                        description: "Interviewing at two companies".into(),
                    },
                ],
            )
            .unwrap();

        assert_eq!(changes[0].record.id, career.id);
        assert!(!changes[0].created);
        assert!(changes[0].changed);
        assert!(changes[1].created);
        assert!(!changes[2].changed);
        assert_eq!(store.active_topics(user, 10).unwrap().len(), 2);
    }

    #[test]
    fn close_session_writes_log_and_clears_staging() {
        let store = test_store();
        let user = store.find_or_create_user("ana").unwrap();
        let session = store.create_session(user, 30).unwrap();
        let topic = store
            .create_topic(user, session, "Career", "Looking for a new job", 0.85)
            .unwrap();
        assert_eq!(store.session_topics(session).unwrap().len(), 1);

        let log = store
            .close_session(
                session,
                &SessionClosing {
                    summary: "Career:\nTalked about interviews".into(),
                    log: Some(NewLog {
                        topic_id: topic.id,
                        text: "Talked about interviews".into(),
                    }),
                },
            )
            .unwrap()
            .unwrap();

        assert_eq!(log.topic_name, "Career");
        assert!(store.session_topics(session).unwrap().is_empty());
        let record = store.load_session(session).unwrap();
        assert!(record.ended);
        assert_eq!(record.time_left, 0);
        assert_eq!(record.summary.as_deref(), Some("Career:\nTalked about interviews"));
        assert_eq!(store.recent_logs(user, 5).unwrap().len(), 1);

        let next = store.create_session(user, 30).unwrap();
        assert_eq!(
            store.previous_summary(user, next).unwrap().as_deref(),
            Some("Career:\nTalked about interviews")
        );
    }

    #[test]
    fn sync_session_topics_replaces_rows() {
        let store = test_store();
        let user = store.find_or_create_user("ana").unwrap();
        let session = store.create_session(user, 30).unwrap();
        let a = store.create_topic(user, session, "A", "a", 0.85).unwrap();
        let b = store.create_topic(user, session, "B", "b", 0.85).unwrap();

        store
            .sync_session_topics(session, &[(b.id, AssociationStatus::Cached, 0.4)])
            .unwrap();

        let staged = store.session_topics(session).unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].topic.id, b.id);
        assert_eq!(staged[0].status, AssociationStatus::Cached);
        assert_ne!(staged[0].topic.id, a.id);
    }
}
