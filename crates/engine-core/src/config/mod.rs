use std::path::Path;

use thiserror::Error;

mod schema;

pub use schema::{CleanupConfig, DispatcherConfig, EngineConfig, SchedulerConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),

    #[error("config validation error: {message}")]
    Validation { message: String },
}

/// Load and validate an `EngineConfig` from a TOML file path.
///
/// Returns the default config if the file does not exist.
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(EngineConfig::default());
    }

    let data = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.display().to_string(),
        source: e,
    })?;

    parse_config(&data)
}

/// Parse and validate an `EngineConfig` from a TOML string.
pub fn parse_config(data: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml::from_str(data)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.dispatcher.worker_pool_size == 0 {
        return Err(ConfigError::Validation {
            message: "dispatcher.worker_pool_size must be > 0".to_string(),
        });
    }

    if config.dispatcher.agent_call_timeout_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "dispatcher.agent_call_timeout_seconds must be > 0".to_string(),
        });
    }

    if config.dispatcher.agent_call_timeout_tool_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "dispatcher.agent_call_timeout_tool_seconds must be > 0".to_string(),
        });
    }

    if config.scheduler.monitor_interval_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "scheduler.monitor_interval_seconds must be > 0".to_string(),
        });
    }

    if let Some(capacity) = config.scheduler.instance_capacity {
        if capacity == 0 {
            return Err(ConfigError::Validation {
                message: "scheduler.instance_capacity must be > 0 when set".to_string(),
            });
        }
    }

    if config.cleanup.sweep_interval_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "cleanup.sweep_interval_seconds must be > 0".to_string(),
        });
    }

    Ok(())
}
