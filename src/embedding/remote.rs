//! OpenAI-compatible `/embeddings` provider.
//!
//! Requests [`EMBEDDING_DIM`] dimensions so vectors fit the same vec0 tables
//! as the local model.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;

use super::{EmbeddingProvider, EMBEDDING_DIM};
use crate::config::EmbeddingConfig;

pub struct RemoteEmbeddingProvider {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl RemoteEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .with_context(|| format!("{} is not set", config.api_key_env))?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        })
    }

    async fn request(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.api_base);
        let body = json!({
            "model": self.model,
            "input": texts,
            "dimensions": EMBEDDING_DIM,
        });
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("embedding request to {url} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("embedding endpoint returned {status}: {text}");
        }

        let mut parsed: EmbeddingResponse = resp.json().await.context("bad embedding response")?;
        parsed.data.sort_by_key(|d| d.index);
        anyhow::ensure!(
            parsed.data.len() == texts.len(),
            "expected {} embeddings, got {}",
            texts.len(),
            parsed.data.len()
        );
        for datum in &parsed.data {
            anyhow::ensure!(
                datum.embedding.len() == EMBEDDING_DIM,
                "embedding has {} dimensions, expected {EMBEDDING_DIM}",
                datum.embedding.len()
            );
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

impl EmbeddingProvider for RemoteEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])?
            .pop()
            .ok_or_else(|| anyhow!("embedding endpoint returned nothing"))
    }

    /// Must run on a blocking thread of a tokio runtime (`spawn_blocking`).
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let handle = tokio::runtime::Handle::try_current()
            .context("remote embeddings need a tokio runtime")?;
        handle.block_on(self.request(texts))
    }
}
