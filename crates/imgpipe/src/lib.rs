pub mod broker;
pub mod config;
pub mod envelope;
pub mod error;
pub mod ingress;
pub mod pipeline;
pub mod stage;
pub mod storage;
pub mod topology;
pub mod transform;

pub use broker::{connect_from_url, Broker, MemoryBroker, ReconnectPolicy};
pub use config::{load_config, load_config_from_str, Config};
pub use envelope::{Envelope, EnvelopeKey};
pub use error::{ImgpipeError, Result};
pub use ingress::Ingress;
pub use pipeline::{Pipeline, PipelineOptions};
pub use stage::{StageEvent, StageEventBroadcaster, StagePhase, StagePool, StageWorker};
pub use topology::{StageSpec, Topology};
pub use transform::{Transform, TransformSpec};
