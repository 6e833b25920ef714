use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::orchestrator::Stage;

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_timeout() -> u64 {
    600
}

fn default_store_directory() -> PathBuf {
    PathBuf::from("projects")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no LLM profile is configured")]
    NoProfiles,
    #[error("LLM profile `{0}` not found")]
    ProfileNotFound(String),
}

/// Connection parameters for one OpenAI-compatible endpoint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EndpointConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default, alias = "model")]
    pub model_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: String::new(),
            model_name: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout: default_timeout(),
        }
    }
}

impl EndpointConfig {
    pub fn is_meaningful(&self) -> bool {
        !(self.api_key.is_empty() && self.base_url.is_empty() && self.model_name.is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_name = model.into();
        self
    }
}

/// Optional per-stage model overrides. Empty or missing entries fall back to
/// the endpoint's default model.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct StageModels {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blueprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrich: Option<String>,
    #[serde(default, alias = "qualityCheck", skip_serializing_if = "Option::is_none")]
    pub quality_check: Option<String>,
}

impl StageModels {
    pub fn model_for(&self, stage: Stage) -> Option<&str> {
        let slot = match stage {
            Stage::Architecture => &self.architecture,
            Stage::Blueprint => &self.blueprint,
            Stage::Draft | Stage::Repair => &self.chapter,
            Stage::QualityCheck => &self.quality_check,
            Stage::Finalize => &self.finalize,
            Stage::Enrich => &self.enrich,
        };
        slot.as_deref()
            .map(str::trim)
            .filter(|model| !model.is_empty())
    }
}

/// Resolved settings a generation run works with.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GenerationSettings {
    pub endpoint: EndpointConfig,
    pub stage_models: StageModels,
}

impl GenerationSettings {
    pub fn new(endpoint: EndpointConfig) -> Self {
        Self {
            endpoint,
            stage_models: StageModels::default(),
        }
    }

    pub fn with_stage_models(mut self, stage_models: StageModels) -> Self {
        self.stage_models = stage_models;
        self
    }

    pub fn endpoint_for(&self, stage: Stage) -> EndpointConfig {
        match self.stage_models.model_for(stage) {
            Some(model) => self.endpoint.clone().with_model(model),
            None => self.endpoint.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PromptConfig {
    #[serde(default)]
    pub custom_directories: Vec<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    #[serde(default = "default_store_directory")]
    pub directory: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: default_store_directory(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RecentUsage {
    #[serde(default)]
    pub last_llm_profile: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub llm_profiles: BTreeMap<String, EndpointConfig>,
    #[serde(default)]
    pub stage_models: StageModels,
    #[serde(default)]
    pub prompts: PromptConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub recent: RecentUsage,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_llm_profile(&self, name: &str) -> Option<&EndpointConfig> {
        self.llm_profiles.get(name)
    }

    pub fn upsert_llm_profile<S: Into<String>>(&mut self, name: S, profile: EndpointConfig) {
        self.llm_profiles.insert(name.into(), profile);
    }

    pub fn remove_llm_profile(&mut self, name: &str) -> Option<EndpointConfig> {
        self.llm_profiles.remove(name)
    }

    pub fn primary_llm_profile(&self) -> Option<(&String, &EndpointConfig)> {
        self.llm_profiles.iter().next()
    }

    /// Picks the named profile, else the most recently used one, else the
    /// first configured one.
    pub fn generation_settings(&self, profile: Option<&str>) -> Result<GenerationSettings, ConfigError> {
        let endpoint = match profile {
            Some(name) => self
                .llm_profiles
                .get(name)
                .ok_or_else(|| ConfigError::ProfileNotFound(name.to_string()))?,
            None => self
                .recent
                .last_llm_profile
                .as_deref()
                .and_then(|name| self.llm_profiles.get(name))
                .or_else(|| self.primary_llm_profile().map(|(_, profile)| profile))
                .ok_or(ConfigError::NoProfiles)?,
        };

        Ok(GenerationSettings::new(endpoint.clone()).with_stage_models(self.stage_models.clone()))
    }

    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }

        let value: Value = serde_json::from_str(input)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        if value.get("apiConfig").is_some() {
            let legacy: LegacySettings = serde_json::from_value(value)?;
            Ok(Self::from_legacy(legacy))
        } else {
            Ok(serde_json::from_value(value)?)
        }
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

    fn from_legacy(legacy: LegacySettings) -> Self {
        let mut config = Self::default();
        let api = legacy.api_config;
        config.llm_profiles.insert(
            "default".to_string(),
            EndpointConfig {
                api_key: api.api_key.unwrap_or_default(),
                base_url: api.base_url.unwrap_or_default(),
                model_name: api.model.unwrap_or_default(),
                temperature: api.temperature.unwrap_or_else(default_temperature),
                max_tokens: api.max_tokens.unwrap_or_else(default_max_tokens),
                timeout: api.timeout.unwrap_or_else(default_timeout),
            },
        );
        config.recent.last_llm_profile = Some("default".to_string());
        config.stage_models = legacy.stage_models;
        config
    }
}

/// Settings blob written by the browser front end: one endpoint under
/// `apiConfig` plus `stageModels`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacySettings {
    #[serde(default)]
    api_config: LegacyApiConfig,
    #[serde(default)]
    stage_models: StageModels,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyApiConfig {
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    timeout: Option<u64>,
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
        self.config = if self.path.exists() {
            Config::from_path(&self.path)?
        } else {
            Config::default()
        };
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
            .filter(|name| self.config.llm_profiles.contains_key(*name))
    }

    pub fn ensure_recent_defaults(&mut self) {
        if self.last_llm_profile().is_none() {
            let next = self.config.llm_profiles.keys().next().cloned();
            self.config.recent.last_llm_profile = next;
        }
    }
}
