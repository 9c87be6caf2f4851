#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::Connection;

use moments::config::MomentsConfig;
use moments::db;
use moments::embedding::{EmbeddingProvider, EMBEDDING_DIM};
use moments::index::SqliteVectorIndex;
use moments::llm::{InvokeConfig, LanguageModel, ResponseSchema, StructuredMode};
use moments::session::Services;
use moments::store::SqliteStore;

/// Open a fresh in-memory database with schema and migrations applied.
pub fn test_db() -> Arc<Mutex<Connection>> {
    Arc::new(Mutex::new(db::open_memory_database().unwrap()))
}

/// Generate a deterministic 384-dim embedding with a spike at position `seed`.
/// Distinct seeds give orthogonal vectors.
pub fn test_embedding(seed: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    v[seed % EMBEDDING_DIM] = 1.0;
    v
}

/// Embeds every text to the same spike.
pub struct SpikeEmbedder(pub usize);

impl EmbeddingProvider for SpikeEmbedder {
    fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(test_embedding(self.0))
    }
}

/// Language model stub. Free-text replies come from a queue (an empty queue
/// is an error); structured replies are looked up by schema name and default
/// to an empty object.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    structured: Mutex<HashMap<String, String>>,
    invokes: AtomicUsize,
    structured_calls: Mutex<Vec<(String, StructuredMode)>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, text: &str) -> Self {
        self.replies.lock().unwrap().push_back(text.to_string());
        self
    }

    pub fn structured(self, schema: &str, json: &str) -> Self {
        self.structured
            .lock()
            .unwrap()
            .insert(schema.to_string(), json.to_string());
        self
    }

    pub fn invoke_count(&self) -> usize {
        self.invokes.load(Ordering::SeqCst)
    }

    /// Modes of the structured calls made for `schema`, in order.
    pub fn structured_modes(&self, schema: &str) -> Vec<StructuredMode> {
        self.structured_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == schema)
            .map(|(_, mode)| *mode)
            .collect()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn invoke(&self, _prompt: &str, _config: &InvokeConfig) -> Result<String> {
        self.invokes.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no reply scripted"))
    }

    async fn invoke_structured(
        &self,
        _prompt: &str,
        _config: &InvokeConfig,
        schema: &ResponseSchema,
        mode: StructuredMode,
    ) -> Result<String> {
        self.structured_calls
            .lock()
            .unwrap()
            .push((schema.name.clone(), mode));
        Ok(self
            .structured
            .lock()
            .unwrap()
            .get(&schema.name)
            .cloned()
            .unwrap_or_else(|| "{}".to_string()))
    }
}

/// A database, the SQLite-backed collaborators and a scripted model.
pub struct Harness {
    pub db: Arc<Mutex<Connection>>,
    pub store: Arc<SqliteStore>,
    pub index: Arc<SqliteVectorIndex>,
    pub model: Arc<ScriptedModel>,
    pub config: MomentsConfig,
}

impl Harness {
    pub fn new(model: ScriptedModel) -> Self {
        let db = test_db();
        Self {
            store: Arc::new(SqliteStore::new(Arc::clone(&db))),
            index: Arc::new(SqliteVectorIndex::new(Arc::clone(&db))),
            model: Arc::new(model),
            config: MomentsConfig::default(),
            db,
        }
    }

    pub fn services(&self) -> Services {
        Services {
            store: self.store.clone(),
            index: self.index.clone(),
            embedder: Arc::new(SpikeEmbedder(0)),
            model: self.model.clone(),
            config: Arc::new(self.config.clone()),
        }
    }

    /// Create a user (if needed) and a new session. Returns `(user_id, session_id)`.
    pub fn new_session(&self, username: &str, minutes: u32) -> (i64, i64) {
        let user_id = self.store.find_or_create_user(username).unwrap();
        let session_id = self.store.create_session(user_id, minutes).unwrap();
        (user_id, session_id)
    }
}
