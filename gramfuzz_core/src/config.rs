use crate::oracle::{
    AskOptions, DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_MODEL, OracleMode, OracleTransport,
    RetryingOracle,
};
use crate::range::RangeTagging;
use crate::subset::EnrichmentPlanner;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OracleSettings {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_consensus_samples")]
    pub consensus_samples: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

pub fn default_consensus_samples() -> u32 {
    5
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_temperature() -> f32 {
    0.5
}

fn default_max_output_tokens() -> u32 {
    DEFAULT_MAX_OUTPUT_TOKENS
}

impl OracleSettings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn ask_options(&self, mode: OracleMode) -> AskOptions {
        AskOptions {
            mode,
            max_retries: self.max_retries,
            temperature: self.temperature,
            response_format: None,
        }
    }

    /// Wraps `transport` in a retrying oracle using the configured model, token cap
    /// and backoff.
    pub fn oracle<T: OracleTransport>(&self, transport: T) -> RetryingOracle<T> {
        RetryingOracle::new(transport, self.retry_backoff())
            .with_model(self.model.clone(), self.max_output_tokens)
    }
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            consensus_samples: default_consensus_samples(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GrammarSettings {
    #[serde(default = "default_template_samples")]
    pub template_samples: u32,
    #[serde(default)]
    pub range_tagging: RangeTagging,
}

pub fn default_template_samples() -> u32 {
    5
}

impl Default for GrammarSettings {
    fn default() -> Self {
        Self {
            template_samples: default_template_samples(),
            range_tagging: RangeTagging::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EnrichmentSettings {
    #[serde(default = "default_max_message_types")]
    pub max_message_types: usize,
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
}

fn default_max_message_types() -> usize {
    2
}

fn default_max_requests() -> usize {
    10
}

impl EnrichmentSettings {
    pub fn planner(&self) -> EnrichmentPlanner {
        EnrichmentPlanner::new(self.max_message_types, self.max_requests)
    }
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            max_message_types: default_max_message_types(),
            max_requests: default_max_requests(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SeedSettings {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("./.gramfuzz_seeds")
}

impl Default for SeedSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GramfuzzConfig {
    #[serde(default)]
    pub oracle: OracleSettings,
    #[serde(default)]
    pub grammar: GrammarSettings,
    #[serde(default)]
    pub enrichment: EnrichmentSettings,
    #[serde(default)]
    pub seeds: SeedSettings,
}

impl GramfuzzConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: GramfuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}
