//! End-of-session work: topic edits, the session log, the summary and the
//! goodbye. Every step logs its own failure and lets the next one run.

use std::sync::Arc;

use super::{Live, SessionInner};
use crate::conversation::prompts;
use crate::conversation::{ConversationState, DialogueController, TopicCandidate};
use crate::llm::extract::{LogJson, SessionTopicsJson};
use crate::llm::{run_until_json, InvokeConfig};
use crate::store::{LogRecord, NewLog, Role, SessionClosing, TopicEdit, TopicRecord};
use crate::util::blocking;

impl SessionInner {
    pub(super) async fn finalize(&self) -> String {
        let session_id = self.session_id;
        tracing::info!(session_id, "finalizing session");

        let mut live = self.live.lock().await;
        let Live { state, dialogue } = &mut *live;
        let transcript = state.conversation_context.clone();
        let llm = &self.services.config.llm;
        let extract = InvokeConfig::from_config(llm).precise();

        let prompt = prompts::session_topics(&transcript, dialogue.topics().cache().topics(), &state.character);
        let extracted: SessionTopicsJson =
            run_until_json(self.services.model.as_ref(), &prompt, &extract, llm.extraction_attempts).await;

        self.update_character(state, &extracted.character).await;

        let edits: Vec<TopicEdit> = extracted
            .topics
            .iter()
            .filter(|t| t.is_valid())
            .map(|t| TopicEdit {
                id: known_topic_id(dialogue.topics().cache().topics(), &t.name),
                name: t.name.trim().to_string(),
                description: t.text.trim().to_string(),
            })
            .collect();

        let (summary, log) = if edits.is_empty() {
            tracing::info!(session_id, "no topics discussed");
            (prompts::NO_TOPICS_SUMMARY.to_string(), None)
        } else {
            let topics = self.apply_topic_edits(dialogue, &edits).await;
            self.write_log(&transcript, &topics, &extract).await
        };

        let closing = SessionClosing {
            summary: summary.clone(),
            log,
        };
        let store = Arc::clone(&self.services.store);
        match blocking(move || store.close_session(session_id, &closing)).await {
            Ok(Some(record)) => self.index_log(dialogue, &record).await,
            Ok(None) => {}
            Err(e) => {
                tracing::error!(session_id, error = %e, "failed to close session");
                let store = Arc::clone(&self.services.store);
                if let Err(e) = blocking(move || store.set_time_left(session_id, 0)).await {
                    tracing::error!(session_id, error = %e, "failed to zero remaining time");
                }
            }
        }
        dialogue.topics_mut().clear();

        let goodbye = self.goodbye_text(&summary).await;
        state.add_response(&goodbye);
        self.persist_message(Role::Assistant, &goodbye).await;
        tracing::info!(session_id, summary_chars = summary.len(), "session finalized");
        goodbye
    }

    async fn update_character(&self, state: &mut ConversationState, character: &str) {
        let character = character.trim();
        if character.is_empty() || character == state.character.trim() {
            return;
        }
        state.character = character.to_string();
        let store = Arc::clone(&self.services.store);
        let (user_id, text) = (self.user_id, character.to_string());
        if let Err(e) = blocking(move || store.save_character(user_id, &text)).await {
            tracing::error!(user_id, error = %e, "failed to save character");
        }
    }

    /// Persist edits and refresh the index entries of topics that changed.
    async fn apply_topic_edits(
        &self,
        dialogue: &DialogueController,
        edits: &[TopicEdit],
    ) -> Vec<TopicRecord> {
        let store = Arc::clone(&self.services.store);
        let (user_id, owned) = (self.user_id, edits.to_vec());
        let changes = match blocking(move || store.apply_topic_edits(user_id, &owned)).await {
            Ok(changes) => changes,
            Err(e) => {
                tracing::error!(session_id = self.session_id, error = %e, "failed to save topic edits");
                return Vec::new();
            }
        };

        let mut topics = Vec::with_capacity(changes.len());
        for change in changes {
            if change.created || change.changed {
                if let Err(e) = dialogue.topics().refresh_topic_index(&change.record).await {
                    tracing::error!(topic_id = change.record.id, error = %e, "failed to refresh topic index");
                }
            }
            topics.push(change.record);
        }
        tracing::info!(session_id = self.session_id, topics = topics.len(), "topic edits applied");
        topics
    }

    /// Extract the session log. Returns the summary and the log to insert.
    async fn write_log(
        &self,
        transcript: &str,
        topics: &[TopicRecord],
        extract: &InvokeConfig,
    ) -> (String, Option<NewLog>) {
        let fallback = topics
            .iter()
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let Some(first) = topics.first() else {
            return (prompts::NO_TOPICS_SUMMARY.to_string(), None);
        };

        let prompt = prompts::session_log(transcript, topics);
        let log: LogJson = run_until_json(
            self.services.model.as_ref(),
            &prompt,
            extract,
            self.services.config.llm.extraction_attempts,
        )
        .await;
        let text = log.text.trim();
        if text.is_empty() {
            tracing::warn!(session_id = self.session_id, "log extraction came back empty");
            return (fallback, None);
        }

        let topic = topics
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(log.topic_name.trim()))
            .unwrap_or(first);
        (
            format!("{}:\n{}", topic.name, text),
            Some(NewLog {
                topic_id: topic.id,
                text: text.to_string(),
            }),
        )
    }

    async fn index_log(&self, dialogue: &DialogueController, record: &LogRecord) {
        if let Err(e) = dialogue.logs().record_log(record).await {
            tracing::error!(log_id = record.id, error = %e, "failed to index session log");
        }
    }

    async fn goodbye_text(&self, summary: &str) -> String {
        let config = InvokeConfig::from_config(&self.services.config.llm);
        let prompt = prompts::goodbye(&self.username, summary);
        match self.services.model.invoke(&prompt, &config).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => prompts::goodbye_fallback(&self.username),
            Err(e) => {
                tracing::warn!(session_id = self.session_id, error = %e, "goodbye generation failed");
                prompts::goodbye_fallback(&self.username)
            }
        }
    }
}

/// Id of a cached topic with this name, ignoring case.
fn known_topic_id(cached: &[TopicCandidate], name: &str) -> Option<i64> {
    let name = name.trim();
    cached
        .iter()
        .find(|t| t.name.eq_ignore_ascii_case(name))
        .and_then(|t| t.id)
}
