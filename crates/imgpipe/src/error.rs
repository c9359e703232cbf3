use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImgpipeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Ingress error: {0}")]
    Ingress(#[from] IngressError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid pipeline topology: {0}")]
    Topology(#[from] TopologyError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Pipeline has no stages")]
    Empty,

    #[error("Head queue name is empty")]
    EmptyHeadQueue,

    #[error("Duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("Queue '{queue}' is consumed by both '{first}' and '{second}'")]
    SharedInputQueue {
        queue: String,
        first: String,
        second: String,
    },

    #[error("Stage '{stage}' cannot write to '{key}': only stage output keys are writable")]
    InvalidOutputKey { stage: String, key: String },

    #[error("Stage '{0}' has a concurrency limit of zero")]
    ZeroConcurrency(String),

    #[error("No stage consumes the head queue '{0}'")]
    HeadNotConsumed(String),

    #[error("Stage '{stage}' publishes to '{queue}' which no stage consumes")]
    DanglingOutput { stage: String, queue: String },

    #[error("Queue wiring loops back into stage '{0}'")]
    Cycle(String),

    #[error("Stage '{0}' is not reachable from the head queue")]
    Unreachable(String),

    #[error("Dead-letter queue '{0}' is also a stage queue")]
    DeadLetterCollision(String),

    #[error("Unknown stage '{0}'")]
    UnknownStage(String),
}

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Malformed envelope body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid envelope field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Failed to read image '{path}': {source}")]
    ReadImage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode image '{path}': {message}")]
    Decode { path: PathBuf, message: String },

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to encode image '{path}': {message}")]
    Encode { path: PathBuf, message: String },

    #[error("Failed to write output '{path}': {source}")]
    WriteOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid transform parameters: {0}")]
    InvalidParameters(String),

    #[error("Failed to load font '{path}': {reason}")]
    LoadFont { path: PathBuf, reason: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove file '{path}': {source}")]
    RemoveFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid image id '{0}'")]
    InvalidImageId(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Broker connection lost")]
    ConnectionLost,

    #[error("Queue '{0}' does not exist")]
    QueueNotFound(String),

    #[error("Unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("Publish to '{0}' was not confirmed by the broker")]
    PublishNotConfirmed(String),

    #[error("Unsupported broker URL '{0}'")]
    UnsupportedUrl(String),

    #[error("Broker transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Returns true if the error came from the connection rather than from
    /// a request the broker understood and refused.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BrokerError::Unavailable(_)
                | BrokerError::ConnectionLost
                | BrokerError::PublishNotConfirmed(_)
                | BrokerError::Transport(_)
        )
    }
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        BrokerError::Transport(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum IngressError {
    #[error("No file found")]
    MissingFile,

    #[error("No selected file")]
    NoSelectedFile,

    #[error("Uploaded file '{0}' is empty")]
    EmptyFile(String),

    #[error("Unsupported upload type for '{0}'")]
    UnsupportedType(String),

    #[error("Upload exceeds the {limit} byte limit")]
    TooLarge { limit: usize },

    #[error("Failed to store upload: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to encode envelope: {0}")]
    Encode(#[from] EnvelopeError),

    #[error("Failed to connect to the message broker: {0}")]
    BrokerUnavailable(#[source] BrokerError),
}

impl IngressError {
    /// Client-side problems that a retry with the same input will not fix.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            IngressError::MissingFile
                | IngressError::NoSelectedFile
                | IngressError::EmptyFile(_)
                | IngressError::UnsupportedType(_)
                | IngressError::TooLarge { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Stage pool needs at least one replica")]
    NoReplicas,

    #[error("Gave up reconnecting to the broker after {attempts} attempts: {source}")]
    ReconnectExhausted {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error("Worker task failed: {0}")]
    Join(String),

    #[error("Unknown stage '{0}'")]
    UnknownStage(String),
}

pub type Result<T> = std::result::Result<T, ImgpipeError>;
