//! Runs replica pools for the stages of a topology inside one process.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, ReconnectPolicy};
use crate::error::{ImgpipeError, WorkerError};
use crate::stage::{StageEventBroadcaster, StagePool, StageStatsSnapshot, StageWorker};
use crate::topology::Topology;

#[derive(Clone)]
pub struct PipelineOptions {
    /// Replicas per stage unless overridden.
    pub replicas: usize,
    pub replica_overrides: HashMap<String, usize>,
    pub reconnect: ReconnectPolicy,
    pub events: Option<StageEventBroadcaster>,
    pub shutdown: CancellationToken,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            replicas: 1,
            replica_overrides: HashMap::new(),
            reconnect: ReconnectPolicy::default(),
            events: None,
            shutdown: CancellationToken::new(),
        }
    }
}

impl PipelineOptions {
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_replicas_for(mut self, stage: impl Into<String>, replicas: usize) -> Self {
        self.replica_overrides.insert(stage.into(), replicas);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_events(mut self, events: StageEventBroadcaster) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn replicas_for(&self, stage: &str) -> usize {
        self.replica_overrides
            .get(stage)
            .copied()
            .unwrap_or(self.replicas)
    }
}

/// Starts the pool for one named stage of `topology`.
pub fn start_stage(
    topology: &Topology,
    stage: &str,
    broker: Arc<dyn Broker>,
    options: &PipelineOptions,
) -> Result<StagePool, ImgpipeError> {
    let spec = topology
        .stage(stage)
        .cloned()
        .ok_or_else(|| WorkerError::UnknownStage(stage.to_string()))?;

    let mut worker = StageWorker::new(spec, broker)?
        .with_dead_letter_queue(topology.dead_letter_queue.clone())
        .with_reconnect(options.reconnect);
    if let Some(events) = &options.events {
        worker = worker.with_events(events.clone());
    }

    let pool = StagePool::with_shutdown(worker, options.replicas_for(stage), options.shutdown.clone())?;
    Ok(pool)
}

pub struct Pipeline {
    pools: Vec<StagePool>,
    shutdown: CancellationToken,
}

impl Pipeline {
    /// Validates `topology` and starts every stage, in chain order.
    pub fn start(
        topology: &Topology,
        broker: Arc<dyn Broker>,
        options: PipelineOptions,
    ) -> Result<Self, ImgpipeError> {
        topology.validate()?;

        let mut pools = Vec::with_capacity(topology.stages.len());
        for spec in topology.ordered()? {
            match start_stage(topology, &spec.name, Arc::clone(&broker), &options) {
                Ok(pool) => pools.push(pool),
                Err(e) => {
                    options.shutdown.cancel();
                    return Err(e);
                }
            }
        }

        info!(
            "Pipeline running with stages: {}",
            pools
                .iter()
                .map(|p| p.stage().to_string())
                .collect::<Vec<_>>()
                .join(" -> ")
        );

        Ok(Self {
            pools,
            shutdown: options.shutdown,
        })
    }

    pub fn pool(&self, stage: &str) -> Option<&StagePool> {
        self.pools.iter().find(|p| p.stage() == stage)
    }

    pub fn pool_mut(&mut self, stage: &str) -> Option<&mut StagePool> {
        self.pools.iter_mut().find(|p| p.stage() == stage)
    }

    pub fn stats(&self) -> Vec<(String, StageStatsSnapshot)> {
        self.pools
            .iter()
            .map(|p| (p.stage().to_string(), p.stats()))
            .collect()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn wait(self) -> Result<(), WorkerError> {
        let mut result = Ok(());
        for pool in self.pools {
            if let Err(e) = pool.wait().await {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}
