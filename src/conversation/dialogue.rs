//! Per-turn state machine.
//!
//! ```text
//! Start ─┬─> TopicExploration ─┬─ confirm ─> SaveTopic ─> LeaveTopic ─┐
//!        │                     ├─ decline ─────────────> LeaveTopic ──┤
//!        │                     └─ continue ─> ContinueDraft ──────────┼─> Validate ─> End
//!        └─> ProcessMessage <──────────────────────────────────────────┘
//! ```
//!
//! `Start` only runs when no draft is in flight. The draft itself
//! ([`PotentialTopic::Drafting`]) is the only routing signal into
//! `TopicExploration`.

use std::sync::Arc;

use anyhow::Result;

use super::logs::LogCoordinator;
use super::prompts::{self, ReplyContext};
use super::state::{ConversationState, PotentialTopic, ResponseType, TopicCandidate, TopicConfirmation};
use super::topics::{TopicCheck, TopicCoordinator};
use super::embed_text;
use crate::config::{MomentsConfig, SessionConfig};
use crate::embedding::EmbeddingProvider;
use crate::llm::extract::TopicJson;
use crate::llm::{run_until_json, InvokeConfig, LanguageModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    TopicExploration,
    SaveTopic,
    LeaveTopic,
    ContinueDraft,
    ProcessMessage,
    Validate,
    End,
}

/// What one pass through the controller did.
#[derive(Debug, Clone, Default)]
pub struct TurnReport {
    pub phases: Vec<Phase>,
    pub topic_check: Option<TopicCheck>,
    /// A new topic draft was opened on this turn.
    pub drafted: bool,
    pub saved_topic: Option<TopicCandidate>,
    pub logs_found: usize,
}

impl TurnReport {
    pub fn visited(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }
}

pub struct DialogueController {
    topics: TopicCoordinator,
    logs: LogCoordinator,
    embedder: Arc<dyn EmbeddingProvider>,
    model: Arc<dyn LanguageModel>,
    session: SessionConfig,
    reply_config: InvokeConfig,
    extract_config: InvokeConfig,
    attempts: usize,
}

impl DialogueController {
    pub fn new(
        topics: TopicCoordinator,
        logs: LogCoordinator,
        embedder: Arc<dyn EmbeddingProvider>,
        model: Arc<dyn LanguageModel>,
        config: &MomentsConfig,
    ) -> Self {
        let reply_config = InvokeConfig::from_config(&config.llm);
        Self {
            topics,
            logs,
            embedder,
            model,
            session: config.session.clone(),
            reply_config,
            extract_config: reply_config.precise(),
            attempts: config.llm.extraction_attempts,
        }
    }

    pub fn topics(&self) -> &TopicCoordinator {
        &self.topics
    }

    pub fn topics_mut(&mut self) -> &mut TopicCoordinator {
        &mut self.topics
    }

    pub fn logs(&self) -> &LogCoordinator {
        &self.logs
    }

    /// Drive one user turn. Expects the message to be in `state` already.
    pub async fn run_turn(&mut self, state: &mut ConversationState) -> Result<TurnReport> {
        let mut report = TurnReport::default();

        if !state.potential_topic.is_drafting() {
            report.phases.push(Phase::Start);
            self.start(state, &mut report).await;
        }

        if state.potential_topic.is_drafting() {
            report.phases.push(Phase::TopicExploration);
            self.explore(state, &mut report).await;
        } else {
            self.process_message(state, &mut report).await;
        }

        report.phases.push(Phase::Validate);
        if state.response.trim().is_empty() {
            tracing::warn!(session_id = state.session_id, "empty response, using fallback");
            state.response = prompts::DIDNT_UNDERSTAND.to_string();
        }

        report.phases.push(Phase::End);
        let response = state.response.clone();
        state.add_response(&response);

        tracing::info!(
            session_id = state.session_id,
            response_type = %state.response_type,
            phases = ?report.phases,
            "turn complete"
        );
        Ok(report)
    }

    // ── Phases ──────────────────────────────────────────────────────────────

    async fn start(&mut self, state: &mut ConversationState, report: &mut TurnReport) {
        state.context_window = state.split_context(self.session.history_window_chars);

        let recent = state.retrieval_text(self.session.retrieval_window_chars);
        state.embedding = match embed_text(&self.embedder, &recent).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                tracing::warn!(session_id = state.session_id, error = %e, "embedding failed");
                None
            }
        };

        match self.topics.check_topics(state).await {
            Ok(check) => report.topic_check = Some(check),
            Err(e) => tracing::warn!(session_id = state.session_id, error = %e, "topic check failed"),
        }

        match self.logs.check_logs(state).await {
            Ok(count) => report.logs_found = count,
            Err(e) => tracing::warn!(session_id = state.session_id, error = %e, "log check failed"),
        }

        if report.topic_check == Some(TopicCheck::Retrieved(0)) {
            let recent = recent_transcript(state);
            report.drafted = self.topics.detect_new_topic(state, &recent).await;
        }
    }

    async fn explore(&mut self, state: &mut ConversationState, report: &mut TurnReport) {
        state.response_type = ResponseType::Topic;
        match state.topic_confirmation {
            TopicConfirmation::Confirm => {
                report.phases.push(Phase::SaveTopic);
                self.save_topic(state, report).await;
                self.leave_topic(state, report).await;
            }
            TopicConfirmation::Decline => self.leave_topic(state, report).await,
            TopicConfirmation::Continue => {
                report.phases.push(Phase::ContinueDraft);
                self.continue_draft(state, report.drafted).await;
            }
        }
    }

    async fn save_topic(&mut self, state: &mut ConversationState, report: &mut TurnReport) {
        let draft = state.potential_topic.draft().unwrap_or_default().to_string();
        let prompt = prompts::extract_topic(&draft);
        let topic: TopicJson =
            run_until_json(self.model.as_ref(), &prompt, &self.extract_config, self.attempts).await;
        if !topic.is_valid() {
            tracing::warn!(session_id = state.session_id, "topic extraction failed, leaving draft");
            return;
        }
        match self.topics.store_topic(state, &topic.name, &topic.text).await {
            Ok(saved) => {
                tracing::info!(session_id = state.session_id, topic_id = ?saved.id, name = %saved.name, "topic saved");
                report.saved_topic = Some(saved);
            }
            Err(e) => tracing::error!(session_id = state.session_id, error = %e, "failed to save topic"),
        }
    }

    async fn leave_topic(&mut self, state: &mut ConversationState, report: &mut TurnReport) {
        report.phases.push(Phase::LeaveTopic);
        state.potential_topic = PotentialTopic::Idle;
        state.asked_questions.clear();
        state.chars_since_last_topic_check = 0;
        state.topic_confirmation = TopicConfirmation::Continue;
        state.context_window = state.split_context(self.session.history_window_chars);
        self.process_message(state, report).await;
    }

    async fn continue_draft(&mut self, state: &mut ConversationState, fresh: bool) {
        if !fresh {
            if let PotentialTopic::Drafting(draft) = &mut state.potential_topic {
                draft.push('\n');
                draft.push_str(state.current_message.trim());
            }
        }
        let draft = state.potential_topic.draft().unwrap_or_default().to_string();
        let prompt = prompts::clarify_topic(&state.username, &draft, &state.asked_questions);
        match self.model.invoke(&prompt, &self.reply_config).await {
            Ok(question) if !question.trim().is_empty() => {
                let question = question.trim().to_string();
                state.asked_questions.push(question.clone());
                state.response = question;
            }
            Ok(_) => state.response = prompts::CLARIFY_FALLBACK.to_string(),
            Err(e) => {
                tracing::warn!(session_id = state.session_id, error = %e, "clarifying question failed");
                state.response = prompts::CLARIFY_FALLBACK.to_string();
            }
        }
    }

    async fn process_message(&mut self, state: &mut ConversationState, report: &mut TurnReport) {
        report.phases.push(Phase::ProcessMessage);
        state.response_type = ResponseType::Message;

        let resumed = std::mem::take(&mut state.saved_query);
        let query = if resumed.trim().is_empty() {
            state.current_message.clone()
        } else {
            resumed.clone()
        };

        let history = history_for_prompt(&state.context_window.history, &query);
        let prompt = prompts::reply(&ReplyContext {
            username: &state.username,
            character: &state.character,
            history,
            query: &query,
            topics: &state.current_topics,
            logs: &state.current_logs,
        });

        let reply = match self.model.invoke(&prompt, &self.reply_config).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                tracing::warn!(session_id = state.session_id, error = %e, "reply generation failed");
                prompts::GENERATION_FALLBACK.to_string()
            }
        };

        state.response = if resumed.trim().is_empty() || reply.is_empty() {
            reply
        } else {
            format!("{}{reply}", prompts::CONTINUATION_MARKER)
        };
    }
}

/// History is left out when it only repeats the query.
fn history_for_prompt<'a>(history: &'a str, query: &str) -> &'a str {
    let trimmed = history.trim();
    let query = query.trim();
    if trimmed == query || trimmed.strip_prefix("Human: ") == Some(query) {
        ""
    } else {
        history
    }
}

/// Windowed history plus the pending user messages, as a transcript.
fn recent_transcript(state: &ConversationState) -> String {
    let window = &state.context_window;
    let mut text = window.history.clone();
    if !window.pending.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str("Human: ");
        text.push_str(&window.pending);
    }
    text
}
