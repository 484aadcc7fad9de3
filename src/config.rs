//! Configuration for the invoice insight evaluator.
//!
//! Supports both environment variables and YAML config file.
//! Environment variables take precedence over config file values.

use crate::error::{InsightEvalError, Result};
use crate::eval::JudgeKind;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// LLM configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL for the LLM API (e.g., "https://api.openai.com")
    pub api_base: String,

    /// API key for authentication
    pub api_key: String,

    /// Model name (e.g., "gpt-4o", "gemini-1.5-flash")
    pub model: String,

    /// Maximum tokens for response (optional)
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Temperature for generation (optional)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.0
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Pipeline stage that talks to a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extraction,
    Generation,
    Evaluation,
}

/// Per-stage model overrides. Unset stages use `llm.model`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelOverrides {
    pub extraction: Option<String>,
    pub generation: Option<String>,
    pub evaluation: Option<String>,
}

/// Judge panel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    /// Judges to run, in panel order.
    pub judges: Vec<JudgeKind>,
    /// Per-judge call timeout in seconds.
    pub judge_timeout_secs: u64,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            judges: JudgeKind::DEFAULT_PANEL.to_vec(),
            judge_timeout_secs: 60,
        }
    }
}

impl PanelConfig {
    pub fn judge_timeout(&self) -> Duration {
        Duration::from_secs(self.judge_timeout_secs)
    }
}

/// Pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound for the extraction and generation calls, in seconds.
    pub stage_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: 120,
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

/// Batch runner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum number of invoices processed at once.
    pub concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { concurrency: 2 }
    }
}

/// Full application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// LLM settings
    pub llm: LlmConfig,
    /// Per-stage model names
    pub models: ModelOverrides,
    /// Judge panel settings
    pub panel: PanelConfig,
    /// Pipeline settings
    pub pipeline: PipelineConfig,
    /// Batch settings
    pub batch: BatchConfig,
}

/// Configuration file structure (YAML format).
#[derive(Debug, Deserialize)]
struct ConfigFile {
    llm: Option<LlmFileSection>,
    models: Option<ModelOverrides>,
    panel: Option<PanelFileSection>,
    pipeline: Option<PipelineFileSection>,
    batch: Option<BatchFileSection>,
}

#[derive(Debug, Deserialize)]
struct LlmFileSection {
    api_base: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PanelFileSection {
    judges: Option<Vec<JudgeKind>>,
    judge_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PipelineFileSection {
    stage_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BatchFileSection {
    concurrency: Option<usize>,
}

impl Config {
    /// Load configuration from environment variables and optional config file.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (LLM_API_BASE, LLM_API_KEY, LLM_MODEL, ...)
    /// 2. Config file (~/.config/invoice-insight-eval/config.yaml)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                config = Self::load_from_file(&config_path)?;
            }
        }

        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(api_base) = env::var("LLM_API_BASE") {
            self.llm.api_base = api_base;
        }

        if let Ok(api_key) = env::var("LLM_API_KEY") {
            self.llm.api_key = api_key;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm.model = model;
        }

        if let Some(tokens) = parse_env("LLM_MAX_TOKENS") {
            self.llm.max_tokens = tokens;
        }

        if let Some(temp) = parse_env("LLM_TEMPERATURE") {
            self.llm.temperature = temp;
        }

        if let Some(secs) = parse_env("LLM_REQUEST_TIMEOUT_SECS") {
            self.llm.request_timeout_secs = secs;
        }

        if let Ok(model) = env::var("EXTRACTION_MODEL") {
            self.models.extraction = Some(model);
        }

        if let Ok(model) = env::var("GENERATION_MODEL") {
            self.models.generation = Some(model);
        }

        if let Ok(model) = env::var("EVALUATION_MODEL") {
            self.models.evaluation = Some(model);
        }

        if let Some(secs) = parse_env("JUDGE_TIMEOUT_SECS") {
            self.panel.judge_timeout_secs = secs;
        }

        if let Some(secs) = parse_env("STAGE_TIMEOUT_SECS") {
            self.pipeline.stage_timeout_secs = secs;
        }

        if let Some(concurrency) = parse_env("BATCH_CONCURRENCY") {
            self.batch.concurrency = concurrency;
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| InsightEvalError::io(path, e))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, filling unset values with defaults.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let file_config: ConfigFile = serde_yaml::from_str(content)
            .map_err(|e| InsightEvalError::Config(format!("Failed to parse config file: {}", e)))?;

        let mut config = Config::default();

        if let Some(llm) = file_config.llm {
            if let Some(api_base) = llm.api_base {
                config.llm.api_base = api_base;
            }
            if let Some(api_key) = llm.api_key {
                config.llm.api_key = api_key;
            }
            if let Some(model) = llm.model {
                config.llm.model = model;
            }
            if let Some(max_tokens) = llm.max_tokens {
                config.llm.max_tokens = max_tokens;
            }
            if let Some(temperature) = llm.temperature {
                config.llm.temperature = temperature;
            }
            if let Some(secs) = llm.request_timeout_secs {
                config.llm.request_timeout_secs = secs;
            }
        }

        if let Some(models) = file_config.models {
            config.models = models;
        }

        if let Some(panel) = file_config.panel {
            if let Some(judges) = panel.judges {
                config.panel.judges = judges;
            }
            if let Some(secs) = panel.judge_timeout_secs {
                config.panel.judge_timeout_secs = secs;
            }
        }

        if let Some(secs) = file_config.pipeline.and_then(|p| p.stage_timeout_secs) {
            config.pipeline.stage_timeout_secs = secs;
        }

        if let Some(concurrency) = file_config.batch.and_then(|b| b.concurrency) {
            config.batch.concurrency = concurrency;
        }

        Ok(config)
    }

    /// Get the default config file path.
    pub fn config_file_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "invoice-insight-eval")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    /// LLM settings for one stage, with the stage's model override applied.
    pub fn llm_for(&self, stage: Stage) -> LlmConfig {
        let model = match stage {
            Stage::Extraction => self.models.extraction.as_ref(),
            Stage::Generation => self.models.generation.as_ref(),
            Stage::Evaluation => self.models.evaluation.as_ref(),
        };

        let mut llm = self.llm.clone();
        if let Some(model) = model {
            llm.model = model.clone();
        }
        llm
    }

    /// Validate that required configuration is present.
    pub fn validate(&self) -> Result<()> {
        if self.llm.api_base.is_empty() {
            return Err(InsightEvalError::Config(
                "LLM API base URL is required. Set LLM_API_BASE environment variable or add to config file.".to_string()
            ));
        }

        if self.llm.api_key.is_empty() {
            return Err(InsightEvalError::Config(
                "LLM API key is required. Set LLM_API_KEY environment variable or add to config file.".to_string()
            ));
        }

        if self.llm.model.is_empty() {
            return Err(InsightEvalError::Config(
                "LLM model is required. Set LLM_MODEL environment variable or add to config file."
                    .to_string(),
            ));
        }

        if self.panel.judges.is_empty() {
            return Err(InsightEvalError::InvalidConfig(
                "panel.judges must name at least one judge".to_string(),
            ));
        }

        if self.panel.judge_timeout_secs == 0 || self.pipeline.stage_timeout_secs == 0 {
            return Err(InsightEvalError::InvalidConfig(
                "timeouts must be greater than zero".to_string(),
            ));
        }

        if self.batch.concurrency == 0 {
            return Err(InsightEvalError::InvalidConfig(
                "batch.concurrency must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Create a config from explicit values (useful for testing).
    pub fn with_llm(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            llm: LlmConfig {
                api_base: api_base.into(),
                api_key: api_key.into(),
                model: model.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.llm.api_base.is_empty());
        assert!(config.llm.api_key.is_empty());
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.llm.max_tokens, 4096);
        assert_eq!(config.llm.temperature, 0.0);
        assert_eq!(
            config.panel.judges,
            vec![JudgeKind::Accuracy, JudgeKind::Completeness, JudgeKind::Clarity]
        );
        assert_eq!(config.panel.judge_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_validate_fails_without_required_fields() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_panel() {
        let mut config = Config::with_llm("https://api.example.com", "key", "gpt-4o");
        assert!(config.validate().is_ok());

        config.panel.judges.clear();
        assert!(matches!(
            config.validate(),
            Err(InsightEvalError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_with_llm() {
        let config = Config::with_llm("https://api.example.com", "test-key", "gpt-4o");
        assert_eq!(config.llm.api_base, "https://api.example.com");
        assert_eq!(config.llm.api_key, "test-key");
        assert_eq!(config.llm.model, "gpt-4o");
    }

    #[test]
    fn test_llm_for_applies_stage_override() {
        let mut config = Config::with_llm("https://api.example.com", "key", "base-model");
        config.models.evaluation = Some("judge-model".to_string());

        assert_eq!(config.llm_for(Stage::Evaluation).model, "judge-model");
        assert_eq!(config.llm_for(Stage::Generation).model, "base-model");
    }

    #[test]
    fn test_from_yaml_partial_sections() {
        let yaml = r#"
llm:
  api_base: https://proxy.example.com
  model: vision-model
panel:
  judges: [accuracy, consistency]
  judge_timeout_secs: 15
batch:
  concurrency: 4
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.llm.api_base, "https://proxy.example.com");
        assert_eq!(config.llm.model, "vision-model");
        assert_eq!(config.llm.max_tokens, 4096);
        assert_eq!(
            config.panel.judges,
            vec![JudgeKind::Accuracy, JudgeKind::Consistency]
        );
        assert_eq!(config.panel.judge_timeout_secs, 15);
        assert_eq!(config.pipeline.stage_timeout_secs, 120);
        assert_eq!(config.batch.concurrency, 4);
    }
}
