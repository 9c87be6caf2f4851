//! The per-turn conversation engine: state, retrieval coordinators, scoring
//! and the dialogue state machine that ties them together.

pub mod dialogue;
pub mod logs;
pub mod prompts;
pub mod scoring;
pub mod state;
pub mod topics;

use std::sync::Arc;

use anyhow::Result;

use crate::embedding::{prepare_text, EmbeddingProvider};
use crate::util::blocking;

pub use dialogue::{DialogueController, Phase, TurnReport};
pub use logs::LogCoordinator;
pub use scoring::RelevanceScorer;
pub use state::{
    ConversationState, LogCandidate, PotentialTopic, ResponseType, TopicCandidate,
    TopicConfirmation,
};
pub use topics::{TopicCache, TopicCheck, TopicCoordinator};

/// Normalize and embed `text` on the blocking pool.
pub(crate) async fn embed_text(
    embedder: &Arc<dyn EmbeddingProvider>,
    text: &str,
) -> Result<Vec<f32>> {
    let embedder = Arc::clone(embedder);
    let prepared = prepare_text(text);
    anyhow::ensure!(!prepared.is_empty(), "nothing to embed after normalization");
    blocking(move || embedder.embed(&prepared)).await
}
