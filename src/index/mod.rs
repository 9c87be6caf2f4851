//! Namespaced nearest-neighbour index over topic and log vectors.
//!
//! Every entry is owned by a user, carries the business id of the row it
//! describes (topic id or log id) and a JSON metadata blob that retrieval
//! parses back into candidates. [`VectorIndex`] is the seam the coordinators
//! talk to; [`sqlite::SqliteVectorIndex`] is the sqlite-vec implementation.

pub mod sqlite;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub use sqlite::SqliteVectorIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Topics,
    Logs,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Topics => "topics",
            Self::Logs => "logs",
        }
    }

    /// vec0 table holding this namespace's vectors.
    pub(crate) fn vec_table(&self) -> &'static str {
        match self {
            Self::Topics => "topics_vec",
            Self::Logs => "logs_vec",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Restricts queries and deletes. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct IndexFilter {
    pub user_id: Option<i64>,
    pub business_id: Option<i64>,
    pub updated_since: Option<DateTime<Utc>>,
}

impl IndexFilter {
    pub fn for_user(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            ..Default::default()
        }
    }

    pub fn for_business_id(business_id: i64) -> Self {
        Self {
            business_id: Some(business_id),
            ..Default::default()
        }
    }

    /// Only entries updated within the last `days` days.
    pub fn within_days(mut self, days: i64) -> Self {
        self.updated_since = Some(Utc::now() - chrono::Duration::days(days));
        self
    }
}

/// An entry to write. `business_id` is the topic or log row id.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub business_id: i64,
    pub user_id: i64,
    pub updated_at: DateTime<Utc>,
    pub metadata: Value,
}

/// One query hit: the stored metadata and the raw cosine similarity.
#[derive(Debug, Clone)]
pub struct IndexMatch {
    pub business_id: i64,
    pub metadata: Value,
    pub score: f64,
}

pub trait VectorIndex: Send + Sync {
    /// Insert or replace the entry for `entry.business_id` in `namespace`.
    fn upsert(&self, namespace: Namespace, entry: &IndexEntry, vector: &[f32]) -> Result<()>;

    /// Delete all entries matching `filter`. Returns how many were removed.
    fn delete(&self, namespace: Namespace, filter: &IndexFilter) -> Result<usize>;

    /// Nearest entries to `vector` that satisfy `filter`, best first.
    fn query(
        &self,
        namespace: Namespace,
        vector: &[f32],
        filter: &IndexFilter,
        top_k: usize,
    ) -> Result<Vec<IndexMatch>>;

    /// Stored vector for a business id, if indexed.
    fn get_by_business_id(&self, namespace: Namespace, business_id: i64)
        -> Result<Option<Vec<f32>>>;
}

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Inverse of [`embedding_to_bytes`]. Trailing bytes that do not form a full f32 are ignored.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(std::mem::size_of::<f32>())
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_roundtrip() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(bytes_to_embedding(embedding_to_bytes(&v)), v);
    }

    #[test]
    fn within_days_sets_cutoff_in_the_past() {
        let filter = IndexFilter::for_user(7).within_days(90);
        let cutoff = filter.updated_since.unwrap();
        let age = Utc::now() - cutoff;
        assert!(age.num_days() >= 89 && age.num_days() <= 90);
        assert_eq!(filter.user_id, Some(7));
        assert!(filter.business_id.is_none());
    }
}
