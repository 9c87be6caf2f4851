//! Prompt builders and the fixed texts the engine falls back to.

use std::fmt::Write;

use super::state::{LogCandidate, TopicCandidate};
use crate::store::TopicRecord;

pub const CONTINUATION_MARKER: &str = "Coming back to what you said before: ";
pub const DIDNT_UNDERSTAND: &str =
    "Sorry, I didn't quite understand that. Could you say it another way?";
pub const GENERATION_FALLBACK: &str =
    "I'm having trouble finding the right words right now. Could you tell me a bit more?";
pub const CLARIFY_FALLBACK: &str =
    "Could you tell me a little more about that? Say yes if you'd like me to keep track of it, or no to move on.";
pub const NO_TOPICS_SUMMARY: &str = "You didn't discuss any topics here";

pub fn first_time_intro(username: &str) -> String {
    format!(
        "Hi {username}, welcome to your first session! This is a space to talk through \
         whatever is on your mind. As we go I'll keep track of the themes that matter to \
         you so we can pick them up again next time. What would you like to start with?"
    )
}

pub fn returning_intro(username: &str, previous_summary: Option<&str>) -> String {
    let mut text = format!("Welcome back, {username}! Good to see you again.");
    if let Some(summary) = previous_summary.filter(|s| !s.trim().is_empty()) {
        let _ = write!(text, " Last time we talked about {}", summary.trim());
        if !text.ends_with('.') {
            text.push('.');
        }
    }
    text.push_str(" What's on your mind today?");
    text
}

/// Human-readable list appended to the opening message.
pub fn active_topics_list(names: &[String]) -> Option<String> {
    if names.is_empty() {
        return None;
    }
    let mut text = String::from("Topics we've been following:");
    for name in names {
        let _ = write!(text, "\n- {name}");
    }
    Some(text)
}

pub fn ending_soon(username: &str, minutes: u32) -> String {
    format!(
        "Just a heads-up, {username}: we have about {minutes} minutes left in this session. \
         Is there anything you'd like to make sure we cover before we wrap up?"
    )
}

pub fn goodbye_fallback(username: &str) -> String {
    format!("Our time is up for today, {username}. Thank you for sharing. Take care until next time!")
}

// ── Model prompts ─────────────────────────────────────────────────────────────

/// Everything the reply prompt is grounded on.
pub struct ReplyContext<'a> {
    pub username: &'a str,
    pub character: &'a str,
    pub history: &'a str,
    pub query: &'a str,
    pub topics: &'a [TopicCandidate],
    pub logs: &'a [LogCandidate],
}

pub fn reply(ctx: &ReplyContext<'_>) -> String {
    let mut prompt = format!(
        "You are a warm, thoughtful journaling coach talking with {}. \
         Reply conversationally in a few sentences and ask at most one question.\n",
        ctx.username
    );
    if !ctx.character.trim().is_empty() {
        let _ = write!(prompt, "\nWhat you know about {}:\n{}\n", ctx.username, ctx.character.trim());
    }
    if !ctx.topics.is_empty() {
        prompt.push_str("\nTopics that seem relevant right now:\n");
        for topic in ctx.topics {
            let _ = writeln!(prompt, "- {}: {}", topic.name, topic.description);
        }
    }
    if !ctx.logs.is_empty() {
        prompt.push_str("\nNotes from earlier sessions:\n");
        for log in ctx.logs {
            let _ = writeln!(
                prompt,
                "- [{}] {}: {}",
                log.date.format("%Y-%m-%d"),
                log.topic_name,
                log.text
            );
        }
    }
    if !ctx.history.trim().is_empty() {
        let _ = write!(prompt, "\nConversation so far:\n{}\n", ctx.history.trim());
    }
    let _ = write!(prompt, "\n{} says: {}\n\nYour reply:", ctx.username, ctx.query);
    prompt
}

pub fn detect_topic(history: &str, known_topics: &[String]) -> String {
    let mut prompt = String::from(
        "Read the conversation below and decide whether the person has introduced a recurring \
         theme in their life that is worth tracking across sessions (for example a goal, a \
         relationship or an ongoing situation). Small talk is not a theme.\n",
    );
    if !known_topics.is_empty() {
        let _ = write!(prompt, "\nAlready tracked, do not repeat: {}\n", known_topics.join(", "));
    }
    let _ = write!(
        prompt,
        "\nConversation:\n{}\n\nReturn `topic_name` (two to four words) and `text` (one or two \
         sentences describing the theme). If there is no new theme, return empty strings.",
        history.trim()
    );
    prompt
}

pub fn clarify_topic(username: &str, draft: &str, asked: &[String]) -> String {
    let mut prompt = format!(
        "You and {username} are shaping a new topic to follow in future sessions. \
         Draft so far:\n{draft}\n\nAsk {username} one short, friendly question that helps \
         describe this topic better, and mention they can confirm it or decline it at any time.",
    );
    if !asked.is_empty() {
        prompt.push_str("\nDo not repeat these questions:\n");
        for question in asked {
            let _ = writeln!(prompt, "- {question}");
        }
    }
    prompt
}

pub fn extract_topic(draft: &str) -> String {
    format!(
        "Turn this draft into a topic to track. `name` is a short title of two to four words, \
         `text` describes the topic in one to three sentences.\n\nDraft:\n{draft}"
    )
}

pub fn session_topics(transcript: &str, known: &[TopicCandidate], character: &str) -> String {
    let mut prompt = String::from(
        "Review this journaling session. List the topics that were actually discussed, \
         each with a short `name` and an updated `text` description. Reuse the exact name of a \
         known topic when the conversation was about it. Also return `character`: an updated \
         short description of the person, keeping what is still true.\n",
    );
    if !known.is_empty() {
        prompt.push_str("\nKnown topics:\n");
        for topic in known {
            let _ = writeln!(prompt, "- {}: {}", topic.name, topic.description);
        }
    }
    if !character.trim().is_empty() {
        let _ = write!(prompt, "\nCurrent description of the person:\n{}\n", character.trim());
    }
    let _ = write!(prompt, "\nTranscript:\n{}", transcript.trim());
    prompt
}

pub fn session_log(transcript: &str, topics: &[TopicRecord]) -> String {
    let names: Vec<&str> = topics.iter().map(|t| t.name.as_str()).collect();
    format!(
        "Write one journal log entry for this session. `topic_name` must be one of: {}. \
         `text` summarises what was said about it in two to four sentences, in the second person.\
         \n\nTranscript:\n{}",
        names.join(", "),
        transcript.trim()
    )
}

pub fn goodbye(username: &str, summary: &str) -> String {
    format!(
        "The journaling session with {username} has ended. In two or three sentences, thank \
         them and say goodbye, briefly reflecting on what was covered:\n{summary}"
    )
}
