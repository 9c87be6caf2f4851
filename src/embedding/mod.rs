//! Text-to-vector embedding gateway.
//!
//! Provides the [`EmbeddingProvider`] trait, the text normalization applied
//! before anything is embedded ([`prepare_text`]), and two implementations:
//! a local all-MiniLM-L6-v2 model and a remote OpenAI-compatible endpoint.
//! Both produce [`EMBEDDING_DIM`]-dimensional vectors so they can share the
//! same vector index.

pub mod local;
pub mod remote;

use anyhow::Result;

/// Number of dimensions in every stored vector.
pub const EMBEDDING_DIM: usize = 384;

/// Trait for embedding text into vectors.
///
/// Implementations must be deterministic for the same text and model. All
/// methods are synchronous; async callers go through `spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts. Implementations may override for batched inference.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Create an embedding provider from config.
///
/// `local` needs the model files from `moments model download`; `openai`
/// needs the API key named by `api_key_env`.
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "local" => Ok(Box::new(local::LocalEmbeddingProvider::new(config)?)),
        "openai" => Ok(Box::new(remote::RemoteEmbeddingProvider::new(config)?)),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: local, openai"),
    }
}

/// Normalize free text before embedding: lowercase, drop URLs and email
/// addresses, turn punctuation and digits into spaces, collapse whitespace.
pub fn prepare_text(text: &str) -> String {
    let mut words = Vec::new();
    for token in text.split_whitespace() {
        let lower = token.to_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("www.") {
            continue;
        }
        if is_email(&lower) {
            continue;
        }
        let cleaned: String = lower
            .chars()
            .map(|c| if c.is_alphabetic() || c == '_' { c } else { ' ' })
            .collect();
        words.extend(cleaned.split_whitespace().map(str::to_owned));
    }
    words.join(" ")
}

/// Cosine similarity of two vectors. Zero-norm inputs and length mismatches score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn is_email(token: &str) -> bool {
    let token = token.trim_matches(|c: char| !c.is_alphanumeric());
    match token.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_text_lowercases_and_strips_punctuation() {
        assert_eq!(
            prepare_text("Hello, World!  I'm  FINE..."),
            "hello world i m fine"
        );
    }

    #[test]
    fn prepare_text_drops_urls_emails_and_digits() {
        let raw = "Mail me at ana@example.com or see https://example.com/x?y=1 in 2024 www.site.org ok";
        assert_eq!(prepare_text(raw), "mail me at or see in ok");
    }

    #[test]
    fn prepare_text_keeps_non_ascii_letters() {
        assert_eq!(prepare_text("Café\tnaïve\n\nrésumé"), "café naïve résumé");
    }

    #[test]
    fn prepare_text_of_blank_is_empty() {
        assert_eq!(prepare_text("  \n\t 42 !! "), "");
    }

    #[test]
    fn cosine_is_symmetric_and_scale_invariant() {
        let v = vec![0.3f32, -1.2, 4.0, 0.5];
        let w = vec![1.0f32, 2.0, -0.5, 0.0];
        let scaled: Vec<f32> = v.iter().map(|x| x * 7.5).collect();

        assert!((cosine_similarity(&v, &w) - cosine_similarity(&w, &v)).abs() < 1e-12);
        assert!((cosine_similarity(&v, &scaled) - 1.0).abs() < 1e-9);
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        let zero = vec![0.0f32; 4];
        let v = vec![1.0f32, 0.0, 0.0, 0.0];
        assert_eq!(cosine_similarity(&zero, &v), 0.0);
        assert_eq!(cosine_similarity(&v, &zero), 0.0);
        assert_eq!(cosine_similarity(&v, &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn create_provider_rejects_unknown() {
        let config = crate::config::EmbeddingConfig {
            provider: "word2vec".into(),
            ..Default::default()
        };
        let err = create_provider(&config).err().unwrap();
        assert!(err.to_string().contains("unknown embedding provider"));
    }
}
