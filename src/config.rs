use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MomentsConfig {
    pub general: GeneralConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub session: SessionConfig,
    pub topics: TopicConfig,
    pub logs: LogConfig,
    pub scoring: ScoringConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `local` (ONNX, all-MiniLM-L6-v2) or `openai` (any OpenAI-compatible `/embeddings`).
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
    pub api_base: String,
    pub api_key_env: String,
}

/// Chat-completions endpoint used for replies and structured extraction.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key_env: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    pub extraction_attempts: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub default_minutes: u32,
    pub tick_seconds: u64,
    pub warning_minutes: u32,
    /// Characters of whole transcript messages kept in the reply prompt.
    pub history_window_chars: usize,
    /// Trailing transcript characters embedded for retrieval.
    pub retrieval_window_chars: usize,
    pub opening_topic_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TopicConfig {
    pub char_threshold: usize,
    pub message_char_threshold: usize,
    pub similarity_threshold: f64,
    pub blend_weight: f64,
    pub decay_factor: f64,
    pub new_topic_confidence: f64,
    pub recency_days: i64,
    pub base_threshold: f64,
    pub final_threshold: f64,
    pub max_results: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub recency_days: i64,
    pub base_threshold: f64,
    pub final_threshold: f64,
    pub max_results: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScoringConfig {
    pub half_life_days: f64,
    pub decay_floor: f64,
    pub similarity_weight: f64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_moments_dir()
            .join("moments.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_moments_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
            api_base: "https://api.openai.com/v1".into(),
            api_key_env: "OPENAI_API_KEY".into(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.8,
            max_tokens: 600,
            request_timeout_secs: 60,
            extraction_attempts: 3,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_minutes: 30,
            tick_seconds: 60,
            warning_minutes: 5,
            history_window_chars: 10_000,
            retrieval_window_chars: 1_000,
            opening_topic_limit: 5,
        }
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            char_threshold: 2_000,
            message_char_threshold: 500,
            similarity_threshold: 0.7,
            blend_weight: 0.7,
            decay_factor: 0.9,
            new_topic_confidence: 0.85,
            recency_days: 90,
            base_threshold: 0.3,
            final_threshold: 0.5,
            max_results: 3,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            recency_days: 90,
            base_threshold: 0.4,
            final_threshold: 0.5,
            max_results: 3,
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            half_life_days: 30.0,
            decay_floor: 0.1,
            similarity_weight: 0.7,
        }
    }
}

/// Returns `~/.moments/`
pub fn default_moments_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".moments")
}

/// Returns the default config file path: `~/.moments/config.toml`
pub fn default_config_path() -> PathBuf {
    default_moments_dir().join("config.toml")
}

impl MomentsConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MomentsConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (MOMENTS_DB, MOMENTS_LOG_LEVEL,
    /// MOMENTS_LLM_MODEL, MOMENTS_SESSION_MINUTES).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MOMENTS_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("MOMENTS_LOG_LEVEL") {
            self.general.log_level = val;
        }
        if let Ok(val) = std::env::var("MOMENTS_LLM_MODEL") {
            self.llm.model = val;
        }
        if let Ok(val) = std::env::var("MOMENTS_SESSION_MINUTES") {
            match val.parse() {
                Ok(minutes) => self.session.default_minutes = minutes,
                Err(_) => tracing::warn!(value = %val, "ignoring invalid MOMENTS_SESSION_MINUTES"),
            }
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = MomentsConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.session.tick_seconds, 60);
        assert_eq!(config.session.warning_minutes, 5);
        assert_eq!(config.topics.similarity_threshold, 0.7);
        assert_eq!(config.logs.base_threshold, 0.4);
        assert_eq!(config.llm.extraction_attempts, 3);
        assert!(config.storage.db_path.ends_with("moments.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[general]
log_level = "debug"

[storage]
db_path = "/tmp/test.db"

[session]
default_minutes = 45

[topics]
char_threshold = 1200
"#;
        let config: MomentsConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.session.default_minutes, 45);
        assert_eq!(config.topics.char_threshold, 1200);
        // defaults still apply for unset fields
        assert_eq!(config.session.warning_minutes, 5);
        assert_eq!(config.topics.new_topic_confidence, 0.85);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = MomentsConfig::default();
        std::env::set_var("MOMENTS_DB", "/tmp/override.db");
        std::env::set_var("MOMENTS_LOG_LEVEL", "trace");
        std::env::set_var("MOMENTS_LLM_MODEL", "local-llama");
        std::env::set_var("MOMENTS_SESSION_MINUTES", "not-a-number");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.general.log_level, "trace");
        assert_eq!(config.llm.model, "local-llama");
        assert_eq!(config.session.default_minutes, 30);

        // Clean up
        std::env::remove_var("MOMENTS_DB");
        std::env::remove_var("MOMENTS_LOG_LEVEL");
        std::env::remove_var("MOMENTS_LLM_MODEL");
        std::env::remove_var("MOMENTS_SESSION_MINUTES");
    }
}
