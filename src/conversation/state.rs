//! Per-session conversation state and the transcript helpers built on it.

use chrono::{DateTime, Utc};

use crate::store::{MessageRecord, ResumableFields, Role};

const HUMAN: &str = "Human: ";
const ASSISTANT: &str = "Assistant: ";
/// Indent for the second and later lines of a turn.
const CONTINUATION: &str = "  ";

/// Whether a new topic is being drafted with the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PotentialTopic {
    #[default]
    Idle,
    /// Draft description accumulated so far.
    Drafting(String),
}

impl PotentialTopic {
    pub fn is_drafting(&self) -> bool {
        matches!(self, Self::Drafting(_))
    }

    pub fn draft(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Drafting(text) => Some(text),
        }
    }

    /// Session records store the draft as text, empty meaning idle.
    pub fn from_stored(raw: &str) -> Self {
        if raw.trim().is_empty() {
            Self::Idle
        } else {
            Self::Drafting(raw.to_string())
        }
    }

    pub fn to_stored(&self) -> String {
        self.draft().unwrap_or_default().to_string()
    }
}

/// The user's answer to "should I keep track of this topic?".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TopicConfirmation {
    Decline,
    Confirm,
    /// Keep refining the draft. Also the reading of any ambiguous input.
    #[default]
    Continue,
}

impl TopicConfirmation {
    /// Wire codes: 0 decline, 1 confirm, anything else continue.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Decline,
            1 => Self::Confirm,
            _ => Self::Continue,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseType {
    #[default]
    Message,
    Topic,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Topic => "topic",
        }
    }
}

impl std::fmt::Display for ResponseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopicCandidate {
    /// `None` until the topic row exists.
    pub id: Option<i64>,
    pub name: String,
    pub description: String,
    pub confidence: f64,
    pub embedding: Option<Vec<f32>>,
    pub last_updated: DateTime<Utc>,
}

impl Default for TopicCandidate {
    fn default() -> Self {
        Self {
            id: None,
            name: String::new(),
            description: String::new(),
            confidence: 0.0,
            embedding: None,
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogCandidate {
    pub log_id: i64,
    pub topic_id: i64,
    pub topic_name: String,
    pub text: String,
    pub date: DateTime<Utc>,
}

/// Recent transcript split for prompting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextWindow {
    /// Whole earlier turns, oldest first, within the character budget.
    pub history: String,
    /// User messages since the last assistant reply.
    pub pending: String,
}

#[derive(Debug, Clone)]
pub struct ConversationState {
    pub session_id: i64,
    pub user_id: i64,
    pub username: String,
    pub conversation_context: String,
    pub current_message: String,
    pub chars_since_last_topic_check: usize,
    pub current_topics: Vec<TopicCandidate>,
    pub current_logs: Vec<LogCandidate>,
    pub potential_topic: PotentialTopic,
    pub embedding: Option<Vec<f32>>,
    pub character: String,
    pub saved_query: String,
    pub asked_questions: Vec<String>,
    pub previous_summary: Option<String>,
    pub topic_confirmation: TopicConfirmation,
    pub context_window: ContextWindow,
    pub response: String,
    pub response_type: ResponseType,
}

impl ConversationState {
    pub fn new(session_id: i64, user_id: i64, username: impl Into<String>) -> Self {
        Self {
            session_id,
            user_id,
            username: username.into(),
            conversation_context: String::new(),
            current_message: String::new(),
            chars_since_last_topic_check: 0,
            current_topics: Vec::new(),
            current_logs: Vec::new(),
            potential_topic: PotentialTopic::Idle,
            embedding: None,
            character: String::new(),
            saved_query: String::new(),
            asked_questions: Vec::new(),
            previous_summary: None,
            topic_confirmation: TopicConfirmation::Continue,
            context_window: ContextWindow::default(),
            response: String::new(),
            response_type: ResponseType::Message,
        }
    }

    /// Record a user message as the start of a new turn.
    pub fn add_message(&mut self, message: &str) {
        self.current_message = message.to_string();
        self.conversation_context.push_str(&format_turn(Role::User, message));
        self.conversation_context.push('\n');
        self.chars_since_last_topic_check += message.chars().count();
        self.current_logs.clear();
        self.response.clear();
    }

    pub fn add_response(&mut self, response: &str) {
        self.conversation_context.push_str(&format_turn(Role::Assistant, response));
        self.conversation_context.push('\n');
    }

    /// Rebuild the transcript from stored messages.
    pub fn load_transcript(&mut self, messages: &[MessageRecord]) {
        self.conversation_context = transcript_from_messages(messages);
    }

    /// Transcript parsed back into turns; indented continuation lines join the turn above.
    pub fn turns(&self) -> Vec<(Role, String)> {
        let mut turns: Vec<(Role, String)> = Vec::new();
        for line in self.conversation_context.lines() {
            if let Some(rest) = line.strip_prefix(HUMAN) {
                turns.push((Role::User, rest.to_string()));
            } else if let Some(rest) = line.strip_prefix(ASSISTANT) {
                turns.push((Role::Assistant, rest.to_string()));
            } else if let Some((_, text)) = turns.last_mut() {
                text.push('\n');
                text.push_str(line.strip_prefix(CONTINUATION).unwrap_or(line));
            }
        }
        turns
    }

    /// Count of Human/Assistant turns in the transcript.
    pub fn turn_counts(&self) -> (usize, usize) {
        self.turns().iter().fold((0, 0), |(h, a), (role, _)| match role {
            Role::User => (h + 1, a),
            Role::Assistant => (h, a + 1),
        })
    }

    /// Split the transcript into pending user messages and a bounded history.
    pub fn split_context(&self, window_chars: usize) -> ContextWindow {
        let turns = self.turns();
        let last_assistant = turns.iter().rposition(|(role, _)| *role == Role::Assistant);
        let (earlier, pending) = match last_assistant {
            Some(idx) => turns.split_at(idx + 1),
            None => turns.split_at(0),
        };

        let pending = pending
            .iter()
            .map(|(_, text)| text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let mut kept = Vec::new();
        let mut used = 0;
        for (role, text) in earlier.iter().rev() {
            let line = format_turn(*role, text);
            let len = line.chars().count();
            if used + len > window_chars {
                break;
            }
            used += len;
            kept.push(line);
        }
        kept.reverse();

        ContextWindow {
            history: kept.join("\n"),
            pending,
        }
    }

    /// Tail of the transcript used to embed "what we are talking about now":
    /// the last `window_chars` characters of message text, whitespace
    /// collapsed and control characters removed.
    pub fn retrieval_text(&self, window_chars: usize) -> String {
        let joined = self
            .turns()
            .into_iter()
            .map(|(_, text)| text)
            .collect::<Vec<_>>()
            .join(" ");
        let cleaned: String = joined
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .filter(|c| !c.is_control())
            .collect();
        let total = cleaned.chars().count();
        cleaned.chars().skip(total.saturating_sub(window_chars)).collect()
    }

    pub fn resumable_fields(&self, cached: &[TopicCandidate]) -> ResumableFields {
        let mut topic_names = Vec::new();
        let mut topic_ids = Vec::new();
        for topic in self.current_topics.iter().chain(cached) {
            if let Some(id) = topic.id {
                if !topic_ids.contains(&id) {
                    topic_ids.push(id);
                    topic_names.push(topic.name.clone());
                }
            }
        }
        ResumableFields {
            chars_since_check: self.chars_since_last_topic_check,
            potential_topic: self.potential_topic.to_stored(),
            saved_query: self.saved_query.clone(),
            character: self.character.clone(),
            topic_names,
            topic_ids,
            asked_questions: self.asked_questions.clone(),
        }
    }
}

/// One transcript turn. Inner lines are indented so they never read as a role prefix.
fn format_turn(role: Role, text: &str) -> String {
    let prefix = match role {
        Role::User => HUMAN,
        Role::Assistant => ASSISTANT,
    };
    let body = text.replace('\n', &format!("\n{CONTINUATION}"));
    format!("{prefix}{body}")
}

/// Format stored messages as a transcript, merging consecutive messages of the same role.
pub fn transcript_from_messages(messages: &[MessageRecord]) -> String {
    let mut merged: Vec<(Role, String)> = Vec::new();
    for message in messages {
        match merged.last_mut() {
            Some((role, text)) if *role == message.role => {
                text.push(' ');
                text.push_str(message.content.trim());
            }
            _ => merged.push((message.role, message.content.trim().to_string())),
        }
    }
    merged
        .iter()
        .map(|(role, text)| format!("{}\n", format_turn(*role, text)))
        .collect()
}
