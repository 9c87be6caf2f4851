use std::sync::Arc;

use anyhow::{Context, Result};

use super::embed_text;
use super::scoring::{LogMetadata, RankLimits, RelevanceScorer};
use super::state::{ConversationState, LogCandidate};
use crate::config::{LogConfig, MomentsConfig};
use crate::embedding::EmbeddingProvider;
use crate::index::{IndexEntry, IndexFilter, Namespace, VectorIndex};
use crate::store::LogRecord;
use crate::util::blocking;

/// Finds earlier session logs relevant to the current turn.
pub struct LogCoordinator {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    scorer: RelevanceScorer,
    config: LogConfig,
}

impl LogCoordinator {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: &MomentsConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            scorer: RelevanceScorer::from_config(&config.scoring),
            config: config.logs.clone(),
        }
    }

    /// Replace `current_logs` with this turn's matches. Without an embedding
    /// the list stays empty and the index is not queried.
    pub async fn check_logs(&self, state: &mut ConversationState) -> Result<usize> {
        state.current_logs.clear();
        let Some(embedding) = state.embedding.clone() else {
            return Ok(0);
        };

        let index = Arc::clone(&self.index);
        let filter = IndexFilter::for_user(state.user_id).within_days(self.config.recency_days);
        let top_k = self.config.max_results * 4;
        let hits = blocking(move || index.query(Namespace::Logs, &embedding, &filter, top_k))
            .await
            .context("log index query failed")?;

        state.current_logs = self
            .scorer
            .rank::<LogMetadata>(
                hits,
                RankLimits {
                    base_threshold: self.config.base_threshold,
                    min_score: self.config.final_threshold,
                    max_results: self.config.max_results,
                },
            )
            .into_iter()
            .map(|scored| LogCandidate {
                log_id: scored.item.id,
                topic_id: scored.item.topic_id,
                topic_name: scored.item.topic_name,
                text: scored.item.text,
                date: scored.last_updated,
            })
            .collect();

        tracing::debug!(session_id = state.session_id, count = state.current_logs.len(), "logs retrieved");
        Ok(state.current_logs.len())
    }

    /// Index a newly written log so later sessions can retrieve it.
    pub async fn record_log(&self, log: &LogRecord) -> Result<()> {
        let vector = embed_text(&self.embedder, &format!("{}: {}", log.topic_name, log.text))
            .await
            .context("failed to embed log")?;
        let entry = IndexEntry {
            business_id: log.id,
            user_id: log.user_id,
            updated_at: log.created_at,
            metadata: serde_json::to_value(LogMetadata {
                id: log.id,
                topic_id: log.topic_id,
                topic_name: log.topic_name.clone(),
                text: log.text.clone(),
                date: log.created_at.to_rfc3339(),
            })?,
        };
        let index = Arc::clone(&self.index);
        blocking(move || index.upsert(Namespace::Logs, &entry, &vector)).await?;
        tracing::info!(log_id = log.id, topic_id = log.topic_id, "log indexed");
        Ok(())
    }
}
