//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::routing::{
    CapabilityProfile, ScoringWeights, SelectorConfig, SemanticCacheConfig, default_profiles,
};

/// Inferoute configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub router: RouterSettings,
    pub cache: CacheSettings,
    pub adaptation: AdaptationSettings,
    pub llm: LlmConfig,
    /// Capability profiles; empty means the built-in table
    pub backends: Vec<CapabilityProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    pub default_backend: String,
    pub baseline_backend: String,
    pub max_alternates: usize,
    /// Per-call timeout for every backend in the chain
    pub call_timeout_ms: u64,
    pub weights: ScoringWeights,
    pub response_log_capacity: usize,
    pub event_capacity: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        let selector = SelectorConfig::default();
        Self {
            default_backend: selector.default_backend,
            baseline_backend: selector.baseline_backend,
            max_alternates: selector.max_alternates,
            call_timeout_ms: 30_000,
            weights: selector.weights,
            response_log_capacity: crate::routing::DEFAULT_RESPONSE_LOG_CAPACITY,
            event_capacity: crate::routing::DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub capacity: usize,
    pub similarity_threshold: f32,
    pub embedding_dimensions: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let cache = SemanticCacheConfig::default();
        Self {
            enabled: true,
            capacity: cache.capacity,
            similarity_threshold: cache.similarity_threshold,
            embedding_dimensions: crate::routing::DEFAULT_DIMENSIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationSettings {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for AdaptationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: crate::routing::DEFAULT_ADAPTATION_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    #[serde(skip)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://openrouter.ai/api/v1".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            timeout_secs: 120,
        }
    }
}

impl LlmConfig {
    pub fn resolved_api_key(&self) -> anyhow::Result<Option<String>> {
        self.enforce_env_only()?;

        Ok(env::var("INFEROUTE_API_KEY")
            .or_else(|_| env::var("OPENROUTER_API_KEY"))
            .ok()
            .filter(|key| !key.trim().is_empty()))
    }

    pub fn redacted_api_key(&self) -> anyhow::Result<Option<String>> {
        self.resolved_api_key().map(|opt| opt.map(|key| redact(&key)))
    }

    pub fn enforce_env_only(&self) -> anyhow::Result<()> {
        if self.api_key.is_some() {
            return Err(anyhow!(
                "API keys must be provided via environment variables, not stored in configuration"
            ));
        }
        Ok(())
    }
}

fn redact(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 4 {
        "***".to_string()
    } else {
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("***{}", suffix)
    }
}

const KEYS: &[&str] = &[
    "router.default_backend",
    "router.baseline_backend",
    "router.max_alternates",
    "router.call_timeout_ms",
    "router.weights.speed",
    "router.weights.cost",
    "router.weights.quality",
    "router.weights.suitability",
    "router.response_log_capacity",
    "router.event_capacity",
    "cache.enabled",
    "cache.capacity",
    "cache.similarity_threshold",
    "cache.embedding_dimensions",
    "adaptation.enabled",
    "adaptation.interval_secs",
    "llm.base_url",
    "llm.temperature",
    "llm.max_tokens",
    "llm.timeout_secs",
    "llm.api_key",
];

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {} value: {}", key, value))
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("INFEROUTE_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("inferoute")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location, or defaults if absent
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a file, or defaults if it doesn't exist
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a file
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.llm.enforce_env_only()?;

        self.router
            .weights
            .validate()
            .map_err(|e| anyhow!("router.weights: {}", e))?;
        if self.router.default_backend.trim().is_empty() {
            return Err(anyhow!("router.default_backend must not be empty"));
        }
        if self.router.baseline_backend.trim().is_empty() {
            return Err(anyhow!("router.baseline_backend must not be empty"));
        }
        if self.router.call_timeout_ms == 0 {
            return Err(anyhow!("router.call_timeout_ms must be positive"));
        }
        if self.cache.capacity == 0 {
            return Err(anyhow!("cache.capacity must be positive"));
        }
        if !(0.0..=1.0).contains(&self.cache.similarity_threshold) {
            return Err(anyhow!("cache.similarity_threshold must be between 0.0 and 1.0"));
        }
        if self.cache.embedding_dimensions == 0 {
            return Err(anyhow!("cache.embedding_dimensions must be positive"));
        }
        if self.adaptation.interval_secs == 0 {
            return Err(anyhow!("adaptation.interval_secs must be positive"));
        }
        for profile in &self.backends {
            profile
                .validate()
                .map_err(|e| anyhow!("backends: {}", e))?;
        }
        Ok(())
    }

    /// Capability profiles to register
    pub fn profiles(&self) -> Vec<CapabilityProfile> {
        if self.backends.is_empty() {
            default_profiles()
        } else {
            self.backends.clone()
        }
    }

    /// Selector settings
    pub fn selector_config(&self) -> SelectorConfig {
        SelectorConfig {
            default_backend: self.router.default_backend.clone(),
            baseline_backend: self.router.baseline_backend.clone(),
            max_alternates: self.router.max_alternates,
            weights: self.router.weights,
        }
    }

    /// Semantic cache settings
    pub fn cache_config(&self) -> SemanticCacheConfig {
        SemanticCacheConfig {
            capacity: self.cache.capacity,
            similarity_threshold: self.cache.similarity_threshold,
        }
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            // Router settings
            "router.default_backend" => Ok(self.router.default_backend.clone()),
            "router.baseline_backend" => Ok(self.router.baseline_backend.clone()),
            "router.max_alternates" => Ok(self.router.max_alternates.to_string()),
            "router.call_timeout_ms" => Ok(self.router.call_timeout_ms.to_string()),
            "router.weights.speed" => Ok(self.router.weights.speed.to_string()),
            "router.weights.cost" => Ok(self.router.weights.cost.to_string()),
            "router.weights.quality" => Ok(self.router.weights.quality.to_string()),
            "router.weights.suitability" => Ok(self.router.weights.suitability.to_string()),
            "router.response_log_capacity" => Ok(self.router.response_log_capacity.to_string()),
            "router.event_capacity" => Ok(self.router.event_capacity.to_string()),

            // Cache settings
            "cache.enabled" => Ok(self.cache.enabled.to_string()),
            "cache.capacity" => Ok(self.cache.capacity.to_string()),
            "cache.similarity_threshold" => Ok(self.cache.similarity_threshold.to_string()),
            "cache.embedding_dimensions" => Ok(self.cache.embedding_dimensions.to_string()),

            // Adaptation settings
            "adaptation.enabled" => Ok(self.adaptation.enabled.to_string()),
            "adaptation.interval_secs" => Ok(self.adaptation.interval_secs.to_string()),

            // LLM settings
            "llm.base_url" => Ok(self.llm.base_url.clone()),
            "llm.temperature" => Ok(self.llm.temperature.to_string()),
            "llm.max_tokens" => Ok(self.llm.max_tokens.to_string()),
            "llm.timeout_secs" => Ok(self.llm.timeout_secs.to_string()),

            // API key (special handling - show redacted)
            "llm.api_key" | "api_key" => match self.llm.redacted_api_key()? {
                Some(redacted) => Ok(redacted),
                None => Ok(
                    "(not set - use INFEROUTE_API_KEY or OPENROUTER_API_KEY env var)".to_string(),
                ),
            },

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `inferoute config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key; the result is validated before it is kept
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut next = self.clone();

        match key {
            "router.default_backend" => next.router.default_backend = value.trim().to_string(),
            "router.baseline_backend" => next.router.baseline_backend = value.trim().to_string(),
            "router.max_alternates" => next.router.max_alternates = parse(key, value)?,
            "router.call_timeout_ms" => next.router.call_timeout_ms = parse(key, value)?,
            "router.weights.speed" => next.router.weights.speed = parse(key, value)?,
            "router.weights.cost" => next.router.weights.cost = parse(key, value)?,
            "router.weights.quality" => next.router.weights.quality = parse(key, value)?,
            "router.weights.suitability" => next.router.weights.suitability = parse(key, value)?,
            "router.response_log_capacity" => {
                next.router.response_log_capacity = parse(key, value)?
            }
            "router.event_capacity" => next.router.event_capacity = parse(key, value)?,

            "cache.enabled" => next.cache.enabled = parse(key, value)?,
            "cache.capacity" => next.cache.capacity = parse(key, value)?,
            "cache.similarity_threshold" => next.cache.similarity_threshold = parse(key, value)?,
            "cache.embedding_dimensions" => next.cache.embedding_dimensions = parse(key, value)?,

            "adaptation.enabled" => next.adaptation.enabled = parse(key, value)?,
            "adaptation.interval_secs" => next.adaptation.interval_secs = parse(key, value)?,

            "llm.base_url" => next.llm.base_url = value.trim().trim_end_matches('/').to_string(),
            "llm.temperature" => {
                let temp: f32 = parse(key, value)?;
                if !(0.0..=2.0).contains(&temp) {
                    return Err(anyhow!("Temperature must be between 0.0 and 2.0"));
                }
                next.llm.temperature = temp;
            }
            "llm.max_tokens" => next.llm.max_tokens = parse(key, value)?,
            "llm.timeout_secs" => next.llm.timeout_secs = parse(key, value)?,

            // API key cannot be set via config
            "llm.api_key" | "api_key" => {
                return Err(anyhow!(
                    "API keys cannot be stored in configuration for security. \
                     Set the INFEROUTE_API_KEY or OPENROUTER_API_KEY environment variable instead."
                ));
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `inferoute config list` to see available keys.",
                    key
                ));
            }
        }

        next.validate()?;
        *self = next;
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.router.weights, ScoringWeights::default());
        assert_eq!(config.cache.capacity, 1000);
        assert_eq!(config.adaptation.interval_secs, 300);
        assert_eq!(config.profiles().len(), 5);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.set("router.max_alternates", "3").unwrap();
        config.set("cache.similarity_threshold", "0.9").unwrap();
        config.backends = vec![CapabilityProfile::new("local/model")];
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.profiles().len(), 1);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[cache]\ncapacity = 5\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.cache.capacity, 5);
        assert_eq!(config.router, RouterSettings::default());
    }

    #[test]
    fn test_set_rejects_invalid_values() {
        let mut config = Config::default();
        assert!(config.set("llm.temperature", "3.5").is_err());
        assert!(config.set("cache.capacity", "0").is_err());
        assert!(config.set("cache.capacity", "many").is_err());
        assert!(config.set("router.weights.speed", "-1").is_err());
        assert!(config.set("no.such.key", "1").is_err());
        assert!(config.set("llm.api_key", "sk-123").is_err());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_get_and_list() {
        let mut config = Config::default();
        config.set("router.default_backend", " local/model ").unwrap();
        assert_eq!(config.get("router.default_backend").unwrap(), "local/model");

        let listed = config.list().unwrap();
        assert_eq!(listed.len(), KEYS.len());
        assert!(listed.iter().any(|(k, _)| k == "llm.api_key"));
    }

    #[test]
    fn test_stored_api_key_rejected() {
        let config = Config {
            llm: LlmConfig {
                api_key: Some("sk-secret".to_string()),
                ..LlmConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redact() {
        assert_eq!(redact("abc"), "***");
        assert_eq!(redact("sk-abcdef1234"), "***1234");
    }
}
