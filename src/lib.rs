//! Conversational journaling sessions with a tracking coach.
//!
//! A user has timed chat sessions with an assistant that keeps track of the
//! recurring themes in their life (**topics**) and writes one journal entry
//! (**log**) per session. This crate is the session engine behind that:
//!
//! - a per-session conversation state driven through a small state machine
//!   each turn, including an interactive "shall I track this topic?" detour
//! - retrieval of relevant topics and earlier logs by vector similarity
//!   blended with a 30-day half-life time decay
//! - a background clock that warns before the session ends and finalizes it
//!   when time runs out
//! - transactional persistence of topic edits, the session log and summary
//!
//! # Architecture
//!
//! - **Storage**: SQLite via rusqlite, with
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for the vector index
//! - **Embeddings**: local ONNX Runtime with all-MiniLM-L6-v2 (384 dimensions),
//!   or any OpenAI-compatible `/embeddings` endpoint
//! - **Language model**: any OpenAI-compatible `/chat/completions` endpoint
//! - **Transport**: anything implementing [`session::EventSink`]; the binary
//!   ships a terminal chat
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from TOML files and environment variables
//! - [`db`]: SQLite initialization, schema, migrations, and health checks
//! - [`embedding`]: Text normalization and text-to-vector embedding
//! - [`index`]: Namespaced nearest-neighbour index over topic and log vectors
//! - [`store`]: Sessions, messages, topics and logs
//! - [`llm`]: Language model client and structured extraction with retries
//! - [`conversation`]: Conversation state, retrieval, scoring and the dialogue state machine
//! - [`session`]: Session lifecycle, clock and finalization

pub mod config;
pub mod conversation;
pub mod db;
pub mod embedding;
pub mod index;
pub mod llm;
pub mod session;
pub mod store;

mod util;
