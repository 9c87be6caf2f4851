//! Language model seam.
//!
//! [`LanguageModel`] covers the two kinds of calls the session engine makes:
//! free-text replies and schema-constrained output. Structured calls come in
//! two styles ([`StructuredMode`]) because OpenAI-compatible servers differ in
//! which one they honour; [`extract::run_until_json`] alternates between them.

pub mod extract;
pub mod openai;

use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde_json::Value;

pub use extract::run_until_json;
pub use openai::OpenAiChatModel;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvokeConfig {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl InvokeConfig {
    pub fn from_config(config: &crate::config::LlmConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    /// Same limits at a low temperature, for extraction calls.
    pub fn precise(self) -> Self {
        Self {
            temperature: 0.2,
            ..self
        }
    }
}

impl Default for InvokeConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            max_tokens: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuredMode {
    /// Force a single function call whose arguments follow the schema.
    FunctionCall,
    /// Ask for a bare JSON object (`response_format: json_object`).
    JsonMode,
}

/// A named JSON schema for structured output.
#[derive(Debug, Clone)]
pub struct ResponseSchema {
    pub name: String,
    pub schema: Value,
}

impl ResponseSchema {
    pub fn of<T: JsonSchema>() -> Self {
        let mut schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null);
        if let Some(obj) = schema.as_object_mut() {
            obj.remove("$schema");
        }
        Self {
            name: T::schema_name().into_owned(),
            schema,
        }
    }
}

/// Errors from the HTTP model client.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("API key variable {0} is not set")]
    MissingApiKey(String),
    #[error("model endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model response had no {0}")]
    MissingContent(&'static str),
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Free-text completion.
    async fn invoke(&self, prompt: &str, config: &InvokeConfig) -> Result<String>;

    /// Schema-constrained completion. Returns the raw JSON text; callers validate it.
    async fn invoke_structured(
        &self,
        prompt: &str,
        config: &InvokeConfig,
        schema: &ResponseSchema,
        mode: StructuredMode,
    ) -> Result<String>;
}
