//! OpenAI-compatible `/chat/completions` client over plain reqwest.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{InvokeConfig, LanguageModel, ModelError, ResponseSchema, StructuredMode};
use crate::config::LlmConfig;

pub struct OpenAiChatModel {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    arguments: String,
}

impl OpenAiChatModel {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| ModelError::MissingApiKey(config.api_key_env.clone()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        })
    }

    fn request_body(
        &self,
        prompt: &str,
        config: &InvokeConfig,
        structured: Option<(&ResponseSchema, StructuredMode)>,
    ) -> Value {
        let mut messages = Vec::new();
        if let Some((schema, StructuredMode::JsonMode)) = structured {
            messages.push(json!({
                "role": "system",
                "content": format!(
                    "Reply with one JSON object that validates against this JSON schema:\n{}",
                    schema.schema
                ),
            }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": config.temperature,
            "max_tokens": config.max_tokens,
        });
        match structured {
            Some((schema, StructuredMode::FunctionCall)) => {
                body["tools"] = json!([{
                    "type": "function",
                    "function": {
                        "name": schema.name,
                        "description": format!("Record the {} extracted from the conversation", schema.name),
                        "parameters": schema.schema,
                    }
                }]);
                body["tool_choice"] = json!({
                    "type": "function",
                    "function": { "name": schema.name },
                });
            }
            Some((_, StructuredMode::JsonMode)) => {
                body["response_format"] = json!({ "type": "json_object" });
            }
            None => {}
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.api_base);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        resp.json().await.context("malformed chat completion response")
    }
}

fn reply_text(response: ChatResponse, mode: Option<StructuredMode>) -> Result<String, ModelError> {
    let message = response
        .choices
        .into_iter()
        .next()
        .ok_or(ModelError::MissingContent("choices"))?
        .message;
    match mode {
        Some(StructuredMode::FunctionCall) => message
            .tool_calls
            .into_iter()
            .next()
            .map(|call| call.function.arguments)
            .ok_or(ModelError::MissingContent("tool call")),
        _ => message.content.ok_or(ModelError::MissingContent("message content")),
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    async fn invoke(&self, prompt: &str, config: &InvokeConfig) -> Result<String> {
        let response = self.post(&self.request_body(prompt, config, None)).await?;
        let text = reply_text(response, None)?;
        tracing::debug!(model = %self.model, chars = text.len(), "completion received");
        Ok(text)
    }

    async fn invoke_structured(
        &self,
        prompt: &str,
        config: &InvokeConfig,
        schema: &ResponseSchema,
        mode: StructuredMode,
    ) -> Result<String> {
        let body = self.request_body(prompt, config, Some((schema, mode)));
        let response = self.post(&body).await?;
        Ok(reply_text(response, Some(mode))?)
    }
}
