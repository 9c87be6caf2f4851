//! Structured extraction with bounded retries.
//!
//! The shapes the session engine asks the model for, and [`run_until_json`],
//! which never fails: after the last attempt it hands back `T::default()`,
//! whose empty strings callers read as "nothing extracted".

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{InvokeConfig, LanguageModel, ResponseSchema, StructuredMode};

/// A topic with a short name and a description of what it covers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TopicJson {
    pub name: String,
    pub text: String,
}

/// A possible new topic spotted in the recent conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TopicDraftJson {
    /// Empty when the conversation does not introduce a new recurring theme.
    pub topic_name: String,
    pub text: String,
}

/// Topics discussed over a whole session plus an updated persona.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SessionTopicsJson {
    pub topics: Vec<TopicJson>,
    #[serde(default)]
    pub character: String,
}

/// The single log entry written for a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LogJson {
    pub topic_name: String,
    pub text: String,
}

const PLACEHOLDER_NAMES: &[&str] = &[
    "na", "n/a", "none", "null", "unknown", "topic", "topic name", "untitled", "name",
];

/// Empty names and filler like "N/A" or "Topic name".
pub fn is_placeholder_name(name: &str) -> bool {
    let name = name.trim().to_lowercase();
    name.is_empty() || PLACEHOLDER_NAMES.contains(&name.as_str())
}

impl TopicJson {
    pub fn is_valid(&self) -> bool {
        !is_placeholder_name(&self.name) && !self.text.trim().is_empty()
    }
}

impl TopicDraftJson {
    pub fn is_valid(&self) -> bool {
        !is_placeholder_name(&self.topic_name) && !self.text.trim().is_empty()
    }
}

/// Pull the outermost JSON object out of a reply (tolerates code fences and chatter).
pub fn parse_json_object<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let start = raw.find('{').context("no JSON object in reply")?;
    let end = raw.rfind('}').context("unterminated JSON object in reply")?;
    anyhow::ensure!(end > start, "no JSON object in reply");
    serde_json::from_str(&raw[start..=end]).context("reply does not match schema")
}

fn retry_prompt(prompt: &str, schema: &ResponseSchema, failed_attempts: usize) -> String {
    if failed_attempts == 1 {
        format!("Please respond with valid JSON only. Original prompt: {prompt}")
    } else {
        format!(
            "Your previous replies were not valid. Respond with exactly one JSON object, \
             no prose and no code fences, that validates against this schema:\n{}\n\nOriginal prompt: {prompt}",
            schema.schema
        )
    }
}

/// Ask for `T` up to `max_attempts` times, alternating function-calling and
/// JSON mode, and fall back to `T::default()`.
pub async fn run_until_json<T>(
    model: &dyn LanguageModel,
    prompt: &str,
    config: &InvokeConfig,
    max_attempts: usize,
) -> T
where
    T: DeserializeOwned + JsonSchema + Default,
{
    let schema = ResponseSchema::of::<T>();
    let mut current = prompt.to_string();

    for attempt in 0..max_attempts {
        let mode = if attempt % 2 == 0 {
            StructuredMode::FunctionCall
        } else {
            StructuredMode::JsonMode
        };
        match model.invoke_structured(&current, config, &schema, mode).await {
            Ok(raw) => match parse_json_object::<T>(&raw) {
                Ok(value) => {
                    tracing::debug!(schema = %schema.name, attempt = attempt + 1, "structured output parsed");
                    return value;
                }
                Err(e) => {
                    tracing::warn!(schema = %schema.name, attempt = attempt + 1, error = %e, "structured output rejected")
                }
            },
            Err(e) => {
                tracing::warn!(schema = %schema.name, attempt = attempt + 1, ?mode, error = %e, "structured call failed")
            }
        }
        current = retry_prompt(prompt, &schema, attempt + 1);
    }

    tracing::error!(schema = %schema.name, attempts = max_attempts, "structured extraction gave up, using empty value");
    T::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Returns scripted structured replies in order; `Err` entries simulate call failures.
    struct Scripted {
        replies: Mutex<Vec<Result<String, String>>>,
        calls: Mutex<Vec<(String, StructuredMode)>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<&str, &str>>) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .rev()
                        .map(|r| r.map(str::to_owned).map_err(str::to_owned))
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for Scripted {
        async fn invoke(&self, _prompt: &str, _config: &InvokeConfig) -> Result<String> {
            anyhow::bail!("free text not scripted")
        }

        async fn invoke_structured(
            &self,
            prompt: &str,
            _config: &InvokeConfig,
            _schema: &ResponseSchema,
            mode: StructuredMode,
        ) -> Result<String> {
            self.calls.lock().unwrap().push((prompt.to_string(), mode));
            match self.replies.lock().unwrap().pop() {
                Some(Ok(text)) => Ok(text),
                Some(Err(e)) => Err(anyhow::anyhow!(e)),
                None => anyhow::bail!("script exhausted"),
            }
        }
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let model = Scripted::new(vec![
            Err("timeout"),
            Ok("sorry, I cannot do that"),
            Ok("```json\n{\"name\": \"Career Growth\", \"text\": \"Wants a promotion\"}\n```"),
        ]);

        let topic: TopicJson =
            run_until_json(&model, "extract the topic", &InvokeConfig::default(), 3).await;

        assert_eq!(topic.name, "Career Growth");
        let calls = model.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].1, StructuredMode::FunctionCall);
        assert_eq!(calls[1].1, StructuredMode::JsonMode);
        assert!(calls[1].0.starts_with("Please respond with valid JSON only."));
        assert!(calls[2].0.contains("validates against this schema"));
    }

    #[tokio::test]
    async fn returns_default_after_exhausting_attempts() {
        let model = Scripted::new(vec![Ok("nope"), Ok("{\"title\": 1}"), Err("500")]);

        let topic: TopicJson = run_until_json(&model, "extract", &InvokeConfig::default(), 3).await;

        assert_eq!(topic, TopicJson::default());
        assert!(!topic.is_valid());
        assert_eq!(model.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn first_good_reply_stops_retrying() {
        let model = Scripted::new(vec![Ok("{\"topic_name\": \"\", \"text\": \"\"}")]);
        let draft: TopicDraftJson = run_until_json(&model, "detect", &InvokeConfig::default(), 3).await;
        assert!(!draft.is_valid());
        assert_eq!(model.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn placeholder_names_are_invalid() {
        for name in ["", "  ", "N/A", "Topic Name", "unknown"] {
            assert!(is_placeholder_name(name), "{name:?} should be a placeholder");
        }
        assert!(!is_placeholder_name("Career Growth"));
        assert!(!TopicJson {
            name: "Career".into(),
            text: " ".into()
        }
        .is_valid());
    }

    #[test]
    fn parse_json_object_ignores_surrounding_text() {
        let log: LogJson =
            parse_json_object("Here you go: {\"topic_name\": \"Family\", \"text\": \"Visited mum\"} thanks")
                .unwrap();
        assert_eq!(log.topic_name, "Family");
        assert!(parse_json_object::<LogJson>("no braces").is_err());
    }

    #[test]
    fn session_topics_character_is_optional() {
        let parsed: SessionTopicsJson =
            parse_json_object("{\"topics\": [{\"name\": \"Work\", \"text\": \"Deadlines\"}]}").unwrap();
        assert_eq!(parsed.topics.len(), 1);
        assert!(parsed.character.is_empty());
    }
}
