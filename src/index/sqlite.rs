//! sqlite-vec backed [`VectorIndex`].
//!
//! Vectors live in the `topics_vec` / `logs_vec` vec0 tables keyed by a
//! UUIDv7 entry id; ownership, business id, timestamp and metadata live in
//! `index_entries`. Queries select the rows matching the filter first and
//! score only those with exact cosine similarity, so one owner's entries are
//! never crowded out by closer vectors belonging to someone else.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::{
    bytes_to_embedding, embedding_to_bytes, IndexEntry, IndexFilter, IndexMatch, Namespace,
    VectorIndex,
};
use crate::embedding::{cosine_similarity, EMBEDDING_DIM};

pub struct SqliteVectorIndex {
    db: Arc<Mutex<Connection>>,
}

impl SqliteVectorIndex {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|e| anyhow!("db lock poisoned: {e}"))
    }
}

/// Build the `index_entries` WHERE clause for a filter, with positional params.
/// `alias` qualifies the columns when the table is joined (`"e."`), or is empty.
fn filter_clause(
    namespace: Namespace,
    filter: &IndexFilter,
    alias: &str,
) -> (String, Vec<SqlValue>) {
    let mut clause = format!("{alias}namespace = ?1");
    let mut values = vec![SqlValue::Text(namespace.as_str().to_string())];
    if let Some(user_id) = filter.user_id {
        values.push(SqlValue::Integer(user_id));
        clause.push_str(&format!(" AND {alias}user_id = ?{}", values.len()));
    }
    if let Some(business_id) = filter.business_id {
        values.push(SqlValue::Integer(business_id));
        clause.push_str(&format!(" AND {alias}business_id = ?{}", values.len()));
    }
    (clause, values)
}

fn delete_matching(conn: &Connection, namespace: Namespace, filter: &IndexFilter) -> Result<usize> {
    let (clause, values) = filter_clause(namespace, filter, "");
    let mut stmt = conn.prepare(&format!(
        "SELECT entry_id, updated_at FROM index_entries WHERE {clause}"
    ))?;
    let rows: Vec<(String, String)> = stmt
        .query_map(params_from_iter(values), |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut removed = 0;
    for (entry_id, updated_at) in rows {
        if let Some(since) = filter.updated_since {
            if parse_timestamp(&updated_at).is_some_and(|t| t < since) {
                continue;
            }
        }
        conn.execute(
            &format!("DELETE FROM {} WHERE entry_id = ?1", namespace.vec_table()),
            params![entry_id],
        )?;
        conn.execute("DELETE FROM index_entries WHERE entry_id = ?1", params![entry_id])?;
        removed += 1;
    }
    Ok(removed)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

impl VectorIndex for SqliteVectorIndex {
    fn upsert(&self, namespace: Namespace, entry: &IndexEntry, vector: &[f32]) -> Result<()> {
        anyhow::ensure!(
            vector.len() == EMBEDDING_DIM,
            "vector has {} dimensions, index expects {EMBEDDING_DIM}",
            vector.len()
        );
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        delete_matching(&tx, namespace, &IndexFilter::for_business_id(entry.business_id))?;

        let entry_id = uuid::Uuid::now_v7().to_string();
        tx.execute(
            "INSERT INTO index_entries (entry_id, namespace, business_id, user_id, updated_at, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry_id,
                namespace.as_str(),
                entry.business_id,
                entry.user_id,
                entry.updated_at.to_rfc3339(),
                entry.metadata.to_string(),
            ],
        )?;
        tx.execute(
            &format!(
                "INSERT INTO {} (entry_id, embedding) VALUES (?1, ?2)",
                namespace.vec_table()
            ),
            params![entry_id, embedding_to_bytes(vector)],
        )?;
        tx.commit()?;

        tracing::debug!(
            namespace = %namespace,
            business_id = entry.business_id,
            entry_id = %entry_id,
            "index entry written"
        );
        Ok(())
    }

    fn delete(&self, namespace: Namespace, filter: &IndexFilter) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = delete_matching(&tx, namespace, filter)?;
        tx.commit()?;
        tracing::debug!(namespace = %namespace, removed, "index entries deleted");
        Ok(removed)
    }

    fn query(
        &self,
        namespace: Namespace,
        vector: &[f32],
        filter: &IndexFilter,
        top_k: usize,
    ) -> Result<Vec<IndexMatch>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let (clause, values) = filter_clause(namespace, filter, "e.");

        let mut stmt = conn.prepare(&format!(
            "SELECT e.entry_id, e.business_id, e.updated_at, e.metadata, v.embedding \
             FROM index_entries e JOIN {} v ON v.entry_id = e.entry_id \
             WHERE {clause}",
            namespace.vec_table()
        ))?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                ))
            })
            .context("index query failed")?;

        let mut matches = Vec::new();
        for row in rows {
            let (entry_id, business_id, updated_at, metadata, blob) = row?;
            if let Some(since) = filter.updated_since {
                match parse_timestamp(&updated_at) {
                    Some(t) if t >= since => {}
                    Some(_) => continue,
                    None => {
                        tracing::warn!(entry_id = %entry_id, updated_at = %updated_at, "unparsable index timestamp, skipping");
                        continue;
                    }
                }
            }
            let metadata = match serde_json::from_str(&metadata) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(entry_id = %entry_id, error = %e, "index metadata is not JSON, skipping");
                    continue;
                }
            };

            matches.push(IndexMatch {
                business_id,
                metadata,
                score: cosine_similarity(vector, &bytes_to_embedding(&blob)),
            });
        }

        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(top_k);
        Ok(matches)
    }

    fn get_by_business_id(
        &self,
        namespace: Namespace,
        business_id: i64,
    ) -> Result<Option<Vec<f32>>> {
        let conn = self.conn()?;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                &format!(
                    "SELECT v.embedding FROM index_entries e JOIN {} v ON v.entry_id = e.entry_id \
                     WHERE e.namespace = ?1 AND e.business_id = ?2 \
                     ORDER BY e.updated_at DESC LIMIT 1",
                    namespace.vec_table()
                ),
                params![namespace.as_str(), business_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.map(|b| bytes_to_embedding(&b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_index() -> SqliteVectorIndex {
        let conn = crate::db::open_memory_database().unwrap();
        SqliteVectorIndex::new(Arc::new(Mutex::new(conn)))
    }

    fn spike(pos: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[pos] = 1.0;
        v
    }

    fn entry(business_id: i64, user_id: i64, days_ago: i64) -> IndexEntry {
        IndexEntry {
            business_id,
            user_id,
            updated_at: Utc::now() - chrono::Duration::days(days_ago),
            metadata: json!({ "topic_id": business_id, "name": format!("topic {business_id}") }),
        }
    }

    #[test]
    fn query_ranks_by_cosine_and_filters_user() {
        let index = test_index();
        index.upsert(Namespace::Topics, &entry(1, 10, 0), &spike(0)).unwrap();
        index.upsert(Namespace::Topics, &entry(2, 10, 0), &spike(1)).unwrap();
        index.upsert(Namespace::Topics, &entry(3, 99, 0), &spike(0)).unwrap();

        let hits = index
            .query(Namespace::Topics, &spike(0), &IndexFilter::for_user(10), 5)
            .unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].business_id, 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert_eq!(hits[1].business_id, 2);
        assert!(hits[1].score.abs() < 1e-6);
        assert_eq!(hits[0].metadata["name"], "topic 1");
    }

    #[test]
    fn own_entries_survive_many_closer_foreign_vectors() {
        let index = test_index();
        for business_id in 1..=300 {
            index
                .upsert(Namespace::Topics, &entry(business_id, 2, 0), &spike(0))
                .unwrap();
        }
        let mut own = vec![0.0f32; EMBEDDING_DIM];
        own[0] = 0.8;
        own[1] = 0.6;
        index.upsert(Namespace::Topics, &entry(1000, 1, 3), &own).unwrap();

        let hits = index
            .query(
                Namespace::Topics,
                &spike(0),
                &IndexFilter::for_user(1).within_days(90),
                12,
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].business_id, 1000);
        assert!((hits[0].score - 0.8).abs() < 1e-5);
    }

    #[test]
    fn query_respects_recency_window() {
        let index = test_index();
        index.upsert(Namespace::Logs, &entry(1, 10, 5), &spike(0)).unwrap();
        index.upsert(Namespace::Logs, &entry(2, 10, 200), &spike(0)).unwrap();

        let hits = index
            .query(
                Namespace::Logs,
                &spike(0),
                &IndexFilter::for_user(10).within_days(90),
                5,
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].business_id, 1);
    }

    #[test]
    fn namespaces_are_isolated() {
        let index = test_index();
        index.upsert(Namespace::Topics, &entry(1, 10, 0), &spike(0)).unwrap();
        let hits = index
            .query(Namespace::Logs, &spike(0), &IndexFilter::for_user(10), 5)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn upsert_replaces_existing_business_id() {
        let index = test_index();
        index.upsert(Namespace::Topics, &entry(1, 10, 0), &spike(0)).unwrap();
        index.upsert(Namespace::Topics, &entry(1, 10, 0), &spike(5)).unwrap();

        let stored = index.get_by_business_id(Namespace::Topics, 1).unwrap().unwrap();
        assert_eq!(stored, spike(5));

        let hits = index
            .query(Namespace::Topics, &spike(5), &IndexFilter::for_user(10), 5)
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn delete_by_business_id() {
        let index = test_index();
        index.upsert(Namespace::Topics, &entry(1, 10, 0), &spike(0)).unwrap();
        index.upsert(Namespace::Topics, &entry(2, 10, 0), &spike(1)).unwrap();

        let removed = index
            .delete(Namespace::Topics, &IndexFilter::for_business_id(1))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(index.get_by_business_id(Namespace::Topics, 1).unwrap().is_none());
        assert!(index.get_by_business_id(Namespace::Topics, 2).unwrap().is_some());
    }

    #[test]
    fn rejects_wrong_dimension() {
        let index = test_index();
        let err = index
            .upsert(Namespace::Topics, &entry(1, 10, 0), &[1.0, 0.0])
            .unwrap_err();
        assert!(err.to_string().contains("dimensions"));
    }
}
