use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::ReconnectPolicy;
use crate::topology::Topology;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub pipeline: Topology,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            broker: BrokerConfig::default(),
            ingress: IngressConfig::default(),
            pipeline: Topology::default_pipeline(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// `amqp://`, `amqps://` or `memory://`.
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Stage workers retry forever when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<u32>,
    /// Tries ingress makes before answering 503.
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,
}

fn default_broker_url() -> String {
    "amqp://127.0.0.1:5672/%2f".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_publish_attempts() -> u32 {
    3
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: None,
            publish_attempts: default_publish_attempts(),
        }
    }
}

impl BrokerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let policy = ReconnectPolicy::fixed(self.reconnect_delay());
        match self.max_reconnect_attempts {
            Some(attempts) => policy.with_max_attempts(attempts),
            None => policy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_upload_directory")]
    pub upload_directory: PathBuf,
    /// Largest accepted image in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_bind() -> String {
    "0.0.0.0:5001".to_string()
}

fn default_upload_directory() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_max_upload_bytes() -> usize {
    crate::ingress::DEFAULT_MAX_UPLOAD_BYTES
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            upload_directory: default_upload_directory(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}
