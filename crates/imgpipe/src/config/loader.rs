use std::net::SocketAddr;
use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let url = &config.broker.url;
    if !(url.starts_with("amqp://") || url.starts_with("amqps://") || url.starts_with("memory://")) {
        return Err(ConfigError::Validation {
            message: format!("broker.url must be an amqp://, amqps:// or memory:// URL, got '{}'", url),
        });
    }

    if config.broker.reconnect_delay_ms == 0 {
        return Err(ConfigError::Validation {
            message: "broker.reconnect_delay_ms must be positive".to_string(),
        });
    }

    if config.broker.publish_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "broker.publish_attempts must be at least 1".to_string(),
        });
    }

    if config.broker.max_reconnect_attempts == Some(0) {
        return Err(ConfigError::Validation {
            message: "broker.max_reconnect_attempts must be at least 1 when set".to_string(),
        });
    }

    if config.ingress.bind.parse::<SocketAddr>().is_err() {
        return Err(ConfigError::Validation {
            message: format!("ingress.bind is not a socket address: '{}'", config.ingress.bind),
        });
    }

    if config.ingress.upload_directory.as_os_str().is_empty() {
        return Err(ConfigError::Validation {
            message: "ingress.upload_directory must not be empty".to_string(),
        });
    }

    if config.ingress.max_upload_bytes == 0 {
        return Err(ConfigError::Validation {
            message: "ingress.max_upload_bytes must be greater than 0".to_string(),
        });
    }

    config.pipeline.validate()?;

    for stage in &config.pipeline.stages {
        if let Err(e) = stage.transform.build() {
            return Err(ConfigError::Validation {
                message: format!("Stage '{}': {}", stage.name, e),
            });
        }
        if stage.output_directory.as_os_str().is_empty() {
            return Err(ConfigError::Validation {
                message: format!("Stage '{}' has an empty output_directory", stage.name),
            });
        }
    }

    Ok(())
}
