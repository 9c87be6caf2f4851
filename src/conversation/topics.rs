use std::sync::Arc;

use anyhow::{Context, Result};

use super::embed_text;
use super::prompts;
use super::scoring::{RankLimits, RelevanceScorer, TopicMetadata};
use super::state::{ConversationState, PotentialTopic, TopicCandidate, TopicConfirmation};
use crate::config::{MomentsConfig, TopicConfig};
use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::index::{IndexEntry, IndexFilter, Namespace, VectorIndex};
use crate::llm::extract::TopicDraftJson;
use crate::llm::{run_until_json, InvokeConfig, LanguageModel};
use crate::store::{AssociationStatus, SessionStore, TopicRecord};
use crate::util::blocking;

/// Outcome of one [`TopicCoordinator::check_topics`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicCheck {
    /// Gate closed; nothing ran and state is unchanged.
    Skipped,
    /// No embedding for this turn; state is unchanged.
    NoEmbedding,
    /// Cached topics matched the current embedding.
    Matched(usize),
    /// No cached match; this many topics came from the index.
    Retrieved(usize),
}

/// The session's pool of candidate topics.
#[derive(Debug, Clone, Default)]
pub struct TopicCache {
    topics: Vec<TopicCandidate>,
}

impl TopicCache {
    pub fn topics(&self) -> &[TopicCandidate] {
        &self.topics
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<&TopicCandidate> {
        self.topics.iter().find(|t| t.id == Some(id))
    }

    /// Insert, or refresh an entry with the same id keeping the higher confidence.
    pub fn merge(&mut self, candidate: TopicCandidate) {
        let existing = candidate
            .id
            .and_then(|id| self.topics.iter_mut().find(|t| t.id == Some(id)));
        match existing {
            Some(topic) => {
                let confidence = topic.confidence.max(candidate.confidence);
                *topic = TopicCandidate {
                    confidence,
                    ..candidate
                };
            }
            None => self.topics.push(candidate),
        }
    }
}

pub struct TopicCoordinator {
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn SessionStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    model: Arc<dyn LanguageModel>,
    scorer: RelevanceScorer,
    config: TopicConfig,
    invoke: InvokeConfig,
    attempts: usize,
    cache: TopicCache,
}

impl TopicCoordinator {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn SessionStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        model: Arc<dyn LanguageModel>,
        config: &MomentsConfig,
    ) -> Self {
        Self {
            index,
            store,
            embedder,
            model,
            scorer: RelevanceScorer::from_config(&config.scoring),
            config: config.topics.clone(),
            invoke: InvokeConfig::from_config(&config.llm).precise(),
            attempts: config.llm.extraction_attempts,
            cache: TopicCache::default(),
        }
    }

    pub fn cache(&self) -> &TopicCache {
        &self.cache
    }

    /// Runs when both the accumulated and the latest message length are below
    /// their thresholds.
    pub fn should_check(&self, state: &ConversationState) -> bool {
        state.chars_since_last_topic_check < self.config.char_threshold
            && state.current_message.chars().count() < self.config.message_char_threshold
    }

    pub async fn check_topics(&mut self, state: &mut ConversationState) -> Result<TopicCheck> {
        if !self.should_check(state) {
            tracing::debug!(
                session_id = state.session_id,
                chars = state.chars_since_last_topic_check,
                "topic check skipped"
            );
            return Ok(TopicCheck::Skipped);
        }
        let Some(embedding) = state.embedding.clone() else {
            return Ok(TopicCheck::NoEmbedding);
        };
        state.chars_since_last_topic_check = 0;

        let matched = self.match_cached(&embedding);
        if !matched.is_empty() {
            let count = matched.len();
            state.current_topics = matched;
            tracing::debug!(session_id = state.session_id, count, "cached topics matched");
            return Ok(TopicCheck::Matched(count));
        }

        let retrieved = self.retrieve(state.user_id, &embedding).await?;
        let count = retrieved.len();
        for topic in &retrieved {
            self.cache.merge(topic.clone());
        }
        state.current_topics = retrieved;
        tracing::debug!(session_id = state.session_id, count, "topics retrieved from index");
        Ok(TopicCheck::Retrieved(count))
    }

    /// Blend matched confidences, decay the rest. Returns the matched set.
    fn match_cached(&mut self, embedding: &[f32]) -> Vec<TopicCandidate> {
        let mut matched = Vec::new();
        for topic in &mut self.cache.topics {
            let similarity = topic
                .embedding
                .as_deref()
                .map(|v| cosine_similarity(embedding, v))
                .unwrap_or(0.0);
            if similarity > self.config.similarity_threshold {
                topic.confidence = self.config.blend_weight * topic.confidence
                    + (1.0 - self.config.blend_weight) * similarity;
                matched.push(topic.clone());
            } else {
                topic.confidence *= self.config.decay_factor;
            }
        }
        matched
    }

    async fn retrieve(&self, user_id: i64, embedding: &[f32]) -> Result<Vec<TopicCandidate>> {
        let index = Arc::clone(&self.index);
        let vector = embedding.to_vec();
        let filter = IndexFilter::for_user(user_id).within_days(self.config.recency_days);
        let top_k = self.config.max_results * 4;
        let hits = blocking(move || index.query(Namespace::Topics, &vector, &filter, top_k))
            .await
            .context("topic index query failed")?;

        let ranked = self.scorer.rank::<TopicMetadata>(
            hits,
            RankLimits {
                base_threshold: self.config.base_threshold,
                min_score: self.config.final_threshold,
                max_results: self.config.max_results,
            },
        );

        let mut candidates = Vec::with_capacity(ranked.len());
        for scored in ranked {
            let index = Arc::clone(&self.index);
            let id = scored.item.id;
            let stored = blocking(move || index.get_by_business_id(Namespace::Topics, id)).await?;
            candidates.push(TopicCandidate {
                id: Some(id),
                name: scored.item.name,
                description: scored.item.text,
                confidence: scored.score,
                embedding: stored,
                last_updated: scored.last_updated,
            });
        }
        Ok(candidates)
    }

    /// Ask the model whether the recent conversation opens a new theme. A
    /// valid answer starts a draft and defers the current message.
    pub async fn detect_new_topic(&self, state: &mut ConversationState, history: &str) -> bool {
        let known: Vec<String> = self.cache.topics.iter().map(|t| t.name.clone()).collect();
        let prompt = prompts::detect_topic(history, &known);
        let draft: TopicDraftJson =
            run_until_json(self.model.as_ref(), &prompt, &self.invoke, self.attempts).await;
        if !draft.is_valid() {
            return false;
        }
        let name = draft.topic_name.trim();
        tracing::info!(session_id = state.session_id, topic = %name, "new topic drafted");
        state.potential_topic = PotentialTopic::Drafting(format!("{name}: {}", draft.text.trim()));
        state.saved_query = state.current_message.clone();
        state.topic_confirmation = TopicConfirmation::Continue;
        true
    }

    /// Persist a confirmed topic, index it, and make it current.
    pub async fn store_topic(
        &mut self,
        state: &mut ConversationState,
        name: &str,
        description: &str,
    ) -> Result<TopicCandidate> {
        let store = Arc::clone(&self.store);
        let (user_id, session_id) = (state.user_id, state.session_id);
        let (n, d, confidence) = (
            name.trim().to_string(),
            description.trim().to_string(),
            self.config.new_topic_confidence,
        );
        let record = blocking(move || store.create_topic(user_id, session_id, &n, &d, confidence))
            .await
            .context("failed to save topic")?;

        let embedding = match self.refresh_topic_index(&record).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                tracing::warn!(topic_id = record.id, error = %e, "topic saved without index entry");
                None
            }
        };

        let candidate = TopicCandidate {
            id: Some(record.id),
            name: record.name,
            description: record.description,
            confidence,
            embedding,
            last_updated: record.updated_at,
        };
        self.cache.merge(candidate.clone());
        state.current_topics.push(candidate.clone());
        Ok(candidate)
    }

    /// Delete and re-insert the topic's index entry. Returns the new vector.
    pub async fn refresh_topic_index(&self, topic: &TopicRecord) -> Result<Vec<f32>> {
        let vector = embed_text(&self.embedder, &format!("{}: {}", topic.name, topic.description))
            .await
            .context("failed to embed topic")?;
        let metadata = serde_json::to_value(TopicMetadata {
            id: topic.id,
            name: topic.name.clone(),
            text: topic.description.clone(),
            date: topic.updated_at.to_rfc3339(),
        })?;
        let entry = IndexEntry {
            business_id: topic.id,
            user_id: topic.user_id,
            updated_at: topic.updated_at,
            metadata,
        };

        let index = Arc::clone(&self.index);
        let stored = vector.clone();
        blocking(move || {
            index.delete(Namespace::Topics, &IndexFilter::for_business_id(entry.business_id))?;
            index.upsert(Namespace::Topics, &entry, &stored)
        })
        .await?;
        Ok(vector)
    }

    /// Restore the cache and current topics from the session's staging rows.
    pub async fn load_session_topics(&mut self, state: &mut ConversationState) -> Result<()> {
        let store = Arc::clone(&self.store);
        let session_id = state.session_id;
        let rows = blocking(move || store.session_topics(session_id)).await?;

        state.current_topics.clear();
        for row in rows {
            let index = Arc::clone(&self.index);
            let id = row.topic.id;
            let embedding = blocking(move || index.get_by_business_id(Namespace::Topics, id))
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(topic_id = id, error = %e, "topic vector lookup failed");
                    None
                });
            let candidate = TopicCandidate {
                id: Some(id),
                name: row.topic.name,
                description: row.topic.description,
                confidence: row.confidence,
                embedding,
                last_updated: row.topic.updated_at,
            };
            if row.status == AssociationStatus::Current {
                state.current_topics.push(candidate.clone());
            }
            self.cache.merge(candidate);
        }
        tracing::debug!(
            session_id,
            cached = self.cache.len(),
            current = state.current_topics.len(),
            "session topics loaded"
        );
        Ok(())
    }

    /// Staging rows for every persisted cached topic.
    pub fn associations(&self, state: &ConversationState) -> Vec<(i64, AssociationStatus, f64)> {
        self.cache
            .topics
            .iter()
            .filter_map(|topic| {
                let id = topic.id?;
                let status = if state.current_topics.iter().any(|t| t.id == Some(id)) {
                    AssociationStatus::Current
                } else {
                    AssociationStatus::Cached
                };
                Some((id, status, topic.confidence))
            })
            .collect()
    }

    /// Drop the session's pool after finalization.
    pub fn clear(&mut self) {
        self.cache = TopicCache::default();
    }

    #[cfg(test)]
    pub(crate) fn seed(&mut self, candidate: TopicCandidate) {
        self.cache.merge(candidate);
    }
}
