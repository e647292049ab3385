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
    pub sheets: Sheets,
    pub whatsapp: WhatsApp,
    pub assistant: Assistant,
    pub dedup: Dedup,
    pub loyalty: Loyalty,
    pub event_log: EventLog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

/// Tabular store backing the customer directory and invoice ledger.
/// `memory` keeps everything in-process (tests, dry runs); `http` speaks a
/// Sheets-style values API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sheets {
    pub backend: String,
    pub api_base: Option<String>,
    pub access_token: Option<String>,
    pub customer_sheet_id: Option<String>,
    pub invoice_sheet_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsApp {
    /// "graph" sends through the Cloud API; "log" records outbound sends in
    /// the event log only.
    pub outbound: String,
    #[serde(default = "default_graph_api_base")]
    pub api_base: String,
    pub phone_number_id: Option<String>,
    pub access_token: Option<String>,
    pub verify_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assistant {
    /// "remote" polls the orchestrator API; "builtin" answers locally with a
    /// deterministic thread handle and canned reply.
    pub mode: String,
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    pub assistant_id: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dedup {
    pub capacity: usize,
    pub retention_minutes: i64,
    #[serde(default = "default_purge_interval_minutes")]
    pub purge_interval_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loyalty {
    #[serde(default = "default_stamp_threshold")]
    pub stamp_threshold: i64,
    #[serde(default = "default_readback_attempts")]
    pub readback_attempts: usize,
    #[serde(default = "default_readback_delay_ms")]
    pub readback_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLog {
    pub jsonl_path: String,
}

fn default_graph_api_base() -> String {
    "https://graph.facebook.com/v22.0".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_run_timeout_ms() -> u64 {
    300_000
}

fn default_purge_interval_minutes() -> u64 {
    5
}

fn default_stamp_threshold() -> i64 {
    50_000
}

fn default_readback_attempts() -> usize {
    3
}

fn default_readback_delay_ms() -> u64 {
    1_000
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

fn require(value: &Option<String>, what: &str) -> Result<(), ConfigError> {
    if value.as_ref().map(|v| v.trim().is_empty()).unwrap_or(true) {
        return Err(ConfigError::UnsupportedConfig(format!(
            "{what} is required"
        )));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    match cfg.sheets.backend.as_str() {
        "memory" => {
            if cfg.sheets.api_base.is_some() {
                return Err(ConfigError::UnsupportedConfig(
                    "sheets.api_base is not supported when sheets.backend=memory".to_string(),
                ));
            }
        }
        "http" => {
            require(&cfg.sheets.api_base, "sheets.api_base (backend=http)")?;
            require(&cfg.sheets.access_token, "sheets.access_token (backend=http)")?;
            require(
                &cfg.sheets.customer_sheet_id,
                "sheets.customer_sheet_id (backend=http)",
            )?;
            require(
                &cfg.sheets.invoice_sheet_id,
                "sheets.invoice_sheet_id (backend=http)",
            )?;
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "sheets.backend={other} is not implemented; supported: memory, http"
            )));
        }
    }

    match cfg.whatsapp.outbound.as_str() {
        "log" => {}
        "graph" => {
            require(
                &cfg.whatsapp.phone_number_id,
                "whatsapp.phone_number_id (outbound=graph)",
            )?;
            require(
                &cfg.whatsapp.access_token,
                "whatsapp.access_token (outbound=graph)",
            )?;
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "whatsapp.outbound={other} is not implemented; supported: graph, log"
            )));
        }
    }
    if cfg.whatsapp.verify_token.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "whatsapp.verify_token must not be empty".to_string(),
        ));
    }

    match cfg.assistant.mode.as_str() {
        "builtin" => {}
        "remote" => {
            require(&cfg.assistant.api_base, "assistant.api_base (mode=remote)")?;
            require(&cfg.assistant.api_key, "assistant.api_key (mode=remote)")?;
            require(
                &cfg.assistant.assistant_id,
                "assistant.assistant_id (mode=remote)",
            )?;
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "assistant.mode={other} is not implemented; supported: builtin, remote"
            )));
        }
    }
    if cfg.assistant.run_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "assistant.run_timeout_ms must be >= 1".to_string(),
        ));
    }

    if cfg.dedup.capacity == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "dedup.capacity must be >= 1".to_string(),
        ));
    }
    if cfg.dedup.retention_minutes <= 0 {
        return Err(ConfigError::UnsupportedConfig(
            "dedup.retention_minutes must be >= 1".to_string(),
        ));
    }

    if cfg.loyalty.stamp_threshold <= 0 {
        return Err(ConfigError::UnsupportedConfig(
            "loyalty.stamp_threshold must be >= 1".to_string(),
        ));
    }
    if cfg.loyalty.readback_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "loyalty.readback_attempts must be >= 1".to_string(),
        ));
    }

    if cfg.event_log.jsonl_path.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "event_log.jsonl_path must not be empty".to_string(),
        ));
    }
    Ok(())
}
