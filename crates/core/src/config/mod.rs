use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::provider::GenerationOptions;

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_timeout() -> u64 {
    120
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Backends the gateway can be built for. `Mock` needs no credential.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Anthropic,
    Openai,
    Gemini,
    Openrouter,
    Groq,
    Custom,
    Mock,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 7] = [
        Self::Anthropic,
        Self::Openai,
        Self::Gemini,
        Self::Openrouter,
        Self::Groq,
        Self::Custom,
        Self::Mock,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Openai => "openai",
            Self::Gemini => "gemini",
            Self::Openrouter => "openrouter",
            Self::Groq => "groq",
            Self::Custom => "custom",
            Self::Mock => "mock",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4.5",
            Self::Openai => "gpt-4-turbo",
            Self::Gemini => "gemini-1.5-pro",
            Self::Openrouter => "gpt-4o-mini",
            Self::Groq => "llama-3.1-70b-versatile",
            Self::Custom => "gpt-4o-mini",
            Self::Mock => "mock",
        }
    }

    /// Environment variables consulted, in order, when a profile has no key.
    pub fn api_key_env_vars(&self) -> &'static [&'static str] {
        match self {
            Self::Anthropic => &["ANTHROPIC_API_KEY"],
            Self::Openai => &["OPENAI_API_KEY"],
            Self::Gemini => &["GOOGLE_API_KEY", "GEMINI_API_KEY"],
            Self::Openrouter => &["OPENROUTER_API_KEY"],
            Self::Groq => &["GROQ_API_KEY"],
            Self::Custom => &["CUSTOM_LLM_API_KEY"],
            Self::Mock => &[],
        }
    }

    pub fn base_url_env_var(&self) -> Option<&'static str> {
        match self {
            Self::Custom => Some("CUSTOM_LLM_BASE_URL"),
            _ => None,
        }
    }

    pub fn requires_api_key(&self) -> bool {
        !matches!(self, Self::Mock)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
#[error("unknown provider `{0}`")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderKind {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        let wanted = match wanted.as_str() {
            "claude" => "anthropic",
            "google" => "gemini",
            other => other,
        };
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == wanted)
            .ok_or_else(|| UnknownProvider(s.to_string()))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self::for_provider(ProviderKind::default())
    }
}

impl LlmConfig {
    pub fn for_provider(provider: ProviderKind) -> Self {
        Self {
            provider,
            api_key: String::new(),
            base_url: String::new(),
            model_name: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout: default_timeout(),
        }
    }

    pub fn model(&self) -> &str {
        if self.model_name.trim().is_empty() {
            self.provider.default_model()
        } else {
            self.model_name.trim()
        }
    }

    /// Explicit key first, then the provider's environment variables.
    pub fn resolve_api_key_with<F>(&self, lookup: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if !self.api_key.trim().is_empty() {
            return Some(self.api_key.trim().to_string());
        }
        self.provider
            .api_key_env_vars()
            .iter()
            .filter_map(|name| lookup(name))
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty())
    }

    pub fn resolve_api_key(&self) -> Option<String> {
        self.resolve_api_key_with(|name| std::env::var(name).ok())
    }

    pub fn resolve_base_url_with<F>(&self, lookup: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if !self.base_url.trim().is_empty() {
            return Some(self.base_url.trim().to_string());
        }
        self.provider
            .base_url_env_var()
            .and_then(lookup)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    pub fn resolve_base_url(&self) -> Option<String> {
        self.resolve_base_url_with(|name| std::env::var(name).ok())
    }

    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
        }
    }
}

fn default_stage_retries() -> usize {
    2
}

fn default_provider_attempts() -> usize {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_completion_timeout_secs() -> u64 {
    120
}

fn default_stream_ceiling_secs() -> u64 {
    600
}

fn default_max_parallel_chapters() -> usize {
    3
}

fn default_stream() -> bool {
    true
}

/// Knobs of the stage runner and the provider gateway.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PipelineSettings {
    /// Extra invocations of a stage whose output fails validation.
    #[serde(default = "default_stage_retries")]
    pub stage_retries: usize,
    /// Total provider attempts per call, including the first.
    #[serde(default = "default_provider_attempts")]
    pub provider_attempts: usize,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,
    #[serde(default = "default_stream_ceiling_secs")]
    pub stream_ceiling_secs: u64,
    #[serde(default = "default_max_parallel_chapters")]
    pub max_parallel_chapters: usize,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stage_retries: default_stage_retries(),
            provider_attempts: default_provider_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            completion_timeout_secs: default_completion_timeout_secs(),
            stream_ceiling_secs: default_stream_ceiling_secs(),
            max_parallel_chapters: default_max_parallel_chapters(),
            stream: default_stream(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PromptConfig {
    #[serde(default)]
    pub custom_directories: Vec<PathBuf>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RecentUsage {
    #[serde(default)]
    pub last_llm_profile: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub llm_profiles: BTreeMap<String, LlmConfig>,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub prompts: PromptConfig,
    #[serde(default)]
    pub recent: RecentUsage,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_llm_profile(&self, name: &str) -> Option<&LlmConfig> {
        self.llm_profiles.get(name)
    }

    pub fn upsert_llm_profile<S: Into<String>>(&mut self, name: S, profile: LlmConfig) {
        self.llm_profiles.insert(name.into(), profile);
    }

    pub fn remove_llm_profile(&mut self, name: &str) -> Option<LlmConfig> {
        self.llm_profiles.remove(name)
    }

    pub fn primary_llm_profile(&self) -> Option<(&String, &LlmConfig)> {
        self.llm_profiles.iter().next()
    }

    /// Profile named `name`, else the most recently used one, else the first.
    pub fn select_llm_profile(&self, name: Option<&str>) -> Option<(&String, &LlmConfig)> {
        if let Some(name) = name {
            return self.llm_profiles.get_key_value(name);
        }
        self.recent
            .last_llm_profile
            .as_deref()
            .and_then(|last| self.llm_profiles.get_key_value(last))
            .or_else(|| self.primary_llm_profile())
    }

    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(input)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn to_path(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    config: Config,
}

impl ConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = if path.exists() {
            Config::from_path(&path)?
        } else {
            Config::default()
        };

        Ok(Self { path, config })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        Config::from_path(path.as_ref())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn reload(&mut self) -> Result<(), ConfigError> {
        if self.path.exists() {
            self.config = Config::from_path(&self.path)?;
        } else {
            self.config = Config::default();
        }
        Ok(())
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.to_path(&self.path)
    }

    pub fn touch_llm_profile<S: Into<String>>(&mut self, name: S) {
        self.config.recent.last_llm_profile = Some(name.into());
    }

    pub fn last_llm_profile(&self) -> Option<&str> {
        self.config
            .recent
            .last_llm_profile
            .as_deref()
            .and_then(|name| self.config.llm_profiles.get(name).map(|_| name))
    }

    pub fn ensure_recent_defaults(&mut self) {
        if self
            .config
            .recent
            .last_llm_profile
            .as_ref()
            .map(|name| self.config.llm_profiles.contains_key(name))
            != Some(true)
        {
            let next = self.config.llm_profiles.keys().next().cloned();
            self.config.recent.last_llm_profile = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_profiles_and_pipeline_defaults() {
        let json = r#"{
            "llm_profiles": {
                "fast": {
                    "provider": "groq",
                    "model_name": "",
                    "temperature": 0.4
                }
            },
            "pipeline": { "max_parallel_chapters": 1 },
            "recent": { "last_llm_profile": "fast" }
        }"#;

        let config = Config::from_json_str(json).unwrap();
        let profile = config.get_llm_profile("fast").unwrap();
        assert_eq!(profile.provider, ProviderKind::Groq);
        assert_eq!(profile.model(), "llama-3.1-70b-versatile");
        assert_eq!(profile.max_tokens, 4096);
        assert_eq!(config.pipeline.max_parallel_chapters, 1);
        assert_eq!(config.pipeline.stage_retries, 2);
        assert_eq!(config.pipeline.provider_attempts, 3);
        assert!(config.pipeline.stream);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            Config::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
        assert_eq!(Config::from_json_str("  ").unwrap(), Config::default());
    }

    #[test]
    fn api_key_falls_back_to_environment() {
        let profile = LlmConfig::for_provider(ProviderKind::Gemini);
        let key = profile.resolve_api_key_with(|name| {
            (name == "GEMINI_API_KEY").then(|| "from-env".to_string())
        });
        assert_eq!(key.as_deref(), Some("from-env"));

        let explicit = LlmConfig {
            api_key: "explicit".into(),
            ..profile.clone()
        };
        assert_eq!(
            explicit
                .resolve_api_key_with(|_| Some("ignored".into()))
                .as_deref(),
            Some("explicit")
        );
        assert!(profile.resolve_api_key_with(|_| None).is_none());
        assert!(LlmConfig::for_provider(ProviderKind::Mock)
            .resolve_api_key_with(|_| Some("x".into()))
            .is_none());
    }

    #[test]
    fn provider_names_parse() {
        assert_eq!("Claude".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        assert_eq!("openrouter".parse::<ProviderKind>().unwrap(), ProviderKind::Openrouter);
        assert!("bard".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn store_persists_config() {
        let temp = tempdir().unwrap();
        let config_path = temp.path().join("config.json");

        let mut store = ConfigStore::open(config_path.clone()).unwrap();
        store
            .config_mut()
            .upsert_llm_profile("openai", LlmConfig::for_provider(ProviderKind::Openai));
        store.touch_llm_profile("openai");
        store.save().unwrap();

        let store = ConfigStore::open(config_path).unwrap();
        assert_eq!(store.last_llm_profile(), Some("openai"));
        let (name, _) = store.config().select_llm_profile(None).unwrap();
        assert_eq!(name, "openai");
    }

    #[test]
    fn ensure_recent_defaults_backfills_missing_profiles() {
        let mut store = ConfigStore::open(PathBuf::from("/nonexistent/config.json")).unwrap();
        store
            .config_mut()
            .upsert_llm_profile("mock", LlmConfig::for_provider(ProviderKind::Mock));
        store.ensure_recent_defaults();
        assert_eq!(store.last_llm_profile(), Some("mock"));
    }
}
