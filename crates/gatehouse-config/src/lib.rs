use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub registry: Registry,
    #[serde(default)]
    pub rate_limit: RateLimit,
    pub audit: Audit,
    #[serde(default)]
    pub retrieval: Retrieval,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(default = "default_rate_limit")]
    pub limit: usize,
    #[serde(default = "default_window_sec")]
    pub window_sec: u64,
    /// How often idle caller windows are swept; 0 disables the sweep.
    #[serde(default = "default_purge_interval_ms")]
    pub purge_interval_ms: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            limit: default_rate_limit(),
            window_sec: default_window_sec(),
            purge_interval_ms: default_purge_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub sink: String,
    #[serde(default)]
    pub jsonl_path: Option<String>,
    #[serde(default = "default_hash_chain")]
    pub hash_chain: bool,
    #[serde(default)]
    pub sqlite_path: Option<String>,
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Retrieval {
    #[serde(default = "default_min_score_threshold")]
    pub min_score_threshold: f64,
    #[serde(default = "default_status")]
    pub default_status: String,
    #[serde(default)]
    pub corpus_path: Option<String>,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
}

impl Default for Retrieval {
    fn default() -> Self {
        Self {
            min_score_threshold: default_min_score_threshold(),
            default_status: default_status(),
            corpus_path: None,
            default_top_k: default_top_k(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_rate_limit() -> usize {
    10
}

fn default_window_sec() -> u64 {
    60
}

fn default_purge_interval_ms() -> u64 {
    30_000
}

fn default_memory_capacity() -> usize {
    10_000
}

fn default_hash_chain() -> bool {
    true
}

fn default_min_score_threshold() -> f64 {
    0.4
}

fn default_status() -> String {
    "active".to_string()
}

fn default_top_k() -> usize {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.registry.path.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "registry.path must not be empty".to_string(),
        ));
    }
    if cfg.rate_limit.limit == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "rate_limit.limit must be >= 1".to_string(),
        ));
    }
    if cfg.rate_limit.window_sec == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "rate_limit.window_sec must be >= 1".to_string(),
        ));
    }
    if cfg.audit.sink == "memory" && cfg.audit.memory_capacity == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "audit.memory_capacity must be >= 1".to_string(),
        ));
    }
    match cfg.audit.sink.as_str() {
        "memory" | "stdout" => {
            if cfg.audit.sqlite_path.is_some() {
                return Err(ConfigError::UnsupportedConfig(format!(
                    "audit.sqlite_path is only supported when audit.sink=jsonl, got {}",
                    cfg.audit.sink
                )));
            }
        }
        "jsonl" => {
            if cfg
                .audit
                .jsonl_path
                .as_ref()
                .map(|v| v.trim().is_empty())
                .unwrap_or(true)
            {
                return Err(ConfigError::UnsupportedConfig(
                    "audit.jsonl_path is required when audit.sink=jsonl".to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "audit.sink={other} is not implemented; supported: memory, stdout, jsonl"
            )));
        }
    }
    if !(0.0..=1.0).contains(&cfg.retrieval.min_score_threshold) {
        return Err(ConfigError::UnsupportedConfig(
            "retrieval.min_score_threshold must be within [0, 1]".to_string(),
        ));
    }
    if cfg.retrieval.default_top_k == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "retrieval.default_top_k must be >= 1".to_string(),
        ));
    }
    if cfg.logging.format != "text" && cfg.logging.format != "json" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "logging.format={} is not implemented; supported: text, json",
            cfg.logging.format
        )));
    }
    Ok(())
}
