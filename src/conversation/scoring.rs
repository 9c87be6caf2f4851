use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ScoringConfig;
use crate::index::IndexMatch;

// ── Index metadata ───────────────────────────────────────────────────────────

/// Metadata stored with every topic vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMetadata {
    pub id: i64,
    pub name: String,
    pub text: String,
    /// RFC 3339 timestamp of the topic's last update.
    pub date: String,
}

/// Metadata stored with every log vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMetadata {
    pub id: i64,
    pub topic_id: i64,
    pub topic_name: String,
    pub text: String,
    pub date: String,
}

/// Metadata that carries the timestamp decay is computed from.
pub trait Dated: Sized {
    fn parse(metadata: &Value) -> Result<Self>;
    fn date(&self) -> &str;
}

impl Dated for TopicMetadata {
    fn parse(metadata: &Value) -> Result<Self> {
        let parsed: Self =
            serde_json::from_value(metadata.clone()).context("topic metadata is malformed")?;
        anyhow::ensure!(!parsed.name.trim().is_empty(), "topic metadata has no name");
        Ok(parsed)
    }

    fn date(&self) -> &str {
        &self.date
    }
}

impl Dated for LogMetadata {
    fn parse(metadata: &Value) -> Result<Self> {
        let parsed: Self =
            serde_json::from_value(metadata.clone()).context("log metadata is malformed")?;
        anyhow::ensure!(!parsed.text.trim().is_empty(), "log metadata has no text");
        Ok(parsed)
    }

    fn date(&self) -> &str {
        &self.date
    }
}

// ── Scoring ──────────────────────────────────────────────────────────────────

/// Thresholds for one ranking pass.
#[derive(Debug, Clone, Copy)]
pub struct RankLimits {
    /// Raw similarity below this is dropped before scoring.
    pub base_threshold: f64,
    /// Adjusted score below this is dropped after scoring.
    pub min_score: f64,
    pub max_results: usize,
}

#[derive(Debug, Clone)]
pub struct Scored<T> {
    pub item: T,
    pub last_updated: DateTime<Utc>,
    pub similarity: f64,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct RelevanceScorer {
    half_life_days: f64,
    floor: f64,
    similarity_weight: f64,
}

impl Default for RelevanceScorer {
    fn default() -> Self {
        Self::from_config(&ScoringConfig::default())
    }
}

impl RelevanceScorer {
    pub fn from_config(config: &ScoringConfig) -> Self {
        Self {
            half_life_days: config.half_life_days,
            floor: config.decay_floor,
            similarity_weight: config.similarity_weight,
        }
    }

    /// `max(floor, 0.5^(days/half_life))` over whole elapsed days.
    pub fn decay_at(&self, last_updated: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let days = (now - last_updated).num_days();
        if days <= 0 {
            return 1.0;
        }
        0.5f64
            .powf(days as f64 / self.half_life_days)
            .max(self.floor)
    }

    pub fn adjusted_score(&self, similarity: f64, last_updated: DateTime<Utc>) -> f64 {
        self.adjusted_score_at(similarity, last_updated, Utc::now())
    }

    fn adjusted_score_at(
        &self,
        similarity: f64,
        last_updated: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> f64 {
        self.similarity_weight * similarity
            + (1.0 - self.similarity_weight) * self.decay_at(last_updated, now)
    }

    /// Score index hits and keep the best. Hits with unusable metadata are
    /// skipped with a warning.
    pub fn rank<T: Dated>(&self, matches: Vec<IndexMatch>, limits: RankLimits) -> Vec<Scored<T>> {
        let now = Utc::now();
        let mut scored: Vec<Scored<T>> = matches
            .into_iter()
            .filter(|m| m.score >= limits.base_threshold)
            .filter_map(|m| {
                let item = match T::parse(&m.metadata) {
                    Ok(item) => item,
                    Err(e) => {
                        tracing::warn!(business_id = m.business_id, error = %e, "skipping index hit");
                        return None;
                    }
                };
                let last_updated = match DateTime::parse_from_rfc3339(item.date()) {
                    Ok(dt) => dt.with_timezone(&Utc),
                    Err(e) => {
                        tracing::warn!(business_id = m.business_id, error = %e, "skipping index hit with bad date");
                        return None;
                    }
                };
                Some(Scored {
                    score: self.adjusted_score_at(m.score, last_updated, now),
                    similarity: m.score,
                    last_updated,
                    item,
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.retain(|s| s.score >= limits.min_score);
        scored.truncate(limits.max_results);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn hit(id: i64, score: f64, days_ago: i64) -> IndexMatch {
        IndexMatch {
            business_id: id,
            metadata: json!({
                "id": id,
                "name": format!("topic {id}"),
                "text": "about things",
                "date": (Utc::now() - Duration::days(days_ago)).to_rfc3339(),
            }),
            score,
        }
    }

    const LIMITS: RankLimits = RankLimits {
        base_threshold: 0.3,
        min_score: 0.5,
        max_results: 3,
    };

    #[test]
    fn decay_values() {
        let scorer = RelevanceScorer::default();
        let now = Utc::now();
        assert_eq!(scorer.decay_at(now, now), 1.0);
        assert_eq!(scorer.decay_at(now + Duration::days(2), now), 1.0);
        assert!((scorer.decay_at(now - Duration::days(90), now) - 0.125).abs() < 1e-9);
        assert_eq!(scorer.decay_at(now - Duration::days(150), now), 0.1);
        assert_eq!(scorer.decay_at(now - Duration::days(400), now), 0.1);
    }

    #[test]
    fn decay_counts_whole_days() {
        let scorer = RelevanceScorer::default();
        let now = Utc::now();
        assert_eq!(scorer.decay_at(now - Duration::hours(23), now), 1.0);
    }

    #[test]
    fn adjusted_score_blends_similarity_and_decay() {
        let scorer = RelevanceScorer::default();
        let score = scorer.adjusted_score(0.8, Utc::now());
        assert!((score - (0.7 * 0.8 + 0.3)).abs() < 1e-9);
    }

    #[test]
    fn rank_applies_thresholds_and_order() {
        let scorer = RelevanceScorer::default();
        let ranked: Vec<Scored<TopicMetadata>> = scorer.rank(
            vec![
                hit(1, 0.2, 0),   // below base threshold
                hit(2, 0.6, 0),   // 0.72
                hit(3, 0.9, 0),   // 0.93
                hit(4, 0.35, 200), // 0.275, below final
            ],
            LIMITS,
        );
        let ids: Vec<i64> = ranked.iter().map(|s| s.item.id).collect();
        assert_eq!(ids, vec![3, 2]);
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn rank_truncates_to_max_results() {
        let scorer = RelevanceScorer::default();
        let hits = (1..=6).map(|i| hit(i, 0.9, i)).collect();
        let ranked: Vec<Scored<TopicMetadata>> = scorer.rank(hits, LIMITS);
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].item.id, 1);
    }

    #[test]
    fn malformed_metadata_is_skipped() {
        let scorer = RelevanceScorer::default();
        let mut bad_date = hit(2, 0.9, 0);
        bad_date.metadata["date"] = json!("yesterday");
        let missing = IndexMatch {
            business_id: 3,
            metadata: json!({"id": 3, "text": "no name"}),
            score: 0.9,
        };
        let ranked: Vec<Scored<TopicMetadata>> =
            scorer.rank(vec![hit(1, 0.9, 0), bad_date, missing], LIMITS);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].item.id, 1);
    }

    #[test]
    fn log_metadata_requires_text() {
        let value = json!({"id": 1, "topic_id": 2, "topic_name": "Work", "text": " ", "date": Utc::now().to_rfc3339()});
        assert!(LogMetadata::parse(&value).is_err());
    }
}
