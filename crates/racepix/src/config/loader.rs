use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let errors: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !errors.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: errors.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let storage = &config.storage;
    match (&storage.base_url, &storage.local_root) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::Validation {
                message: "storage.base_url and storage.local_root are mutually exclusive"
                    .to_string(),
            })
        }
        (None, None) => {
            return Err(ConfigError::Validation {
                message: "storage needs either base_url or local_root".to_string(),
            })
        }
        _ => {}
    }

    if storage.resumable_endpoint.is_some() && storage.base_url.is_none() {
        return Err(ConfigError::Validation {
            message: "storage.resumable_endpoint requires storage.base_url".to_string(),
        });
    }

    if config.transport.chunk_size_bytes == 0 {
        return Err(ConfigError::Validation {
            message: "transport.chunk_size_bytes must be positive".to_string(),
        });
    }

    if config.transport.retry_delays_ms.is_empty() {
        return Err(ConfigError::Validation {
            message: "transport.retry_delays_ms needs at least one entry".to_string(),
        });
    }

    if config.worker.attempts == 0 {
        return Err(ConfigError::Validation {
            message: "worker.attempts must be at least 1".to_string(),
        });
    }

    Ok(())
}
