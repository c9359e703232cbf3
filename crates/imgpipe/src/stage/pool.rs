use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::worker::StageWorker;
use super::{StageStats, StageStatsSnapshot};
use crate::error::WorkerError;

/// N interchangeable replicas of one stage competing on its input queue.
pub struct StagePool {
    stage: String,
    workers: Vec<Option<JoinHandle<Result<(), WorkerError>>>>,
    shutdown: CancellationToken,
    stats: Arc<StageStats>,
}

impl StagePool {
    pub fn start(worker: StageWorker, replicas: usize) -> Result<Self, WorkerError> {
        Self::with_shutdown(worker, replicas, CancellationToken::new())
    }

    /// Starts the replicas on the current tokio runtime. Cancelling
    /// `shutdown` stops them the same way [`StagePool::shutdown`] does.
    pub fn with_shutdown(
        worker: StageWorker,
        replicas: usize,
        shutdown: CancellationToken,
    ) -> Result<Self, WorkerError> {
        if replicas == 0 {
            return Err(WorkerError::NoReplicas);
        }

        let stage = worker.spec().name.clone();
        let stats = worker.stats();
        let mut workers = Vec::with_capacity(replicas);

        for replica in 0..replicas {
            let replica_worker = worker.clone().with_replica(replica);
            let token = shutdown.clone();
            let handle = tokio::spawn(async move { replica_worker.run(token).await });
            workers.push(Some(handle));
        }

        info!("Started {} replicas of stage '{}'", replicas, stage);

        Ok(Self {
            stage,
            workers,
            shutdown,
            stats,
        })
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Replicas still running.
    pub fn live_replicas(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.as_ref().map(|h| !h.is_finished()).unwrap_or(false))
            .count()
    }

    pub fn stats(&self) -> StageStatsSnapshot {
        self.stats.snapshot()
    }

    /// Terminates a replica without letting it finish or settle anything,
    /// the in-process equivalent of killing its process.
    pub fn kill_replica(&mut self, replica: usize) -> bool {
        match self.workers.get_mut(replica).and_then(Option::take) {
            Some(handle) => {
                handle.abort();
                warn!("Killed replica {} of stage '{}'", replica, self.stage);
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&self) {
        info!("Shutting down stage '{}'...", self.stage);
        self.shutdown.cancel();
    }

    /// Waits for every replica to stop. Returns the first replica error.
    pub async fn wait(self) -> Result<(), WorkerError> {
        let mut first_error = None;

        for (replica, handle) in self.workers.into_iter().enumerate() {
            let Some(handle) = handle else { continue };
            match handle.await {
                Ok(Ok(())) => debug!("Replica {} of '{}' finished", replica, self.stage),
                Ok(Err(e)) => {
                    error!("Replica {} of '{}' failed: {}", replica, self.stage, e);
                    first_error.get_or_insert(e);
                }
                Err(e) if e.is_cancelled() => {
                    debug!("Replica {} of '{}' was aborted", replica, self.stage)
                }
                Err(e) => {
                    error!("Replica {} of '{}' panicked: {}", replica, self.stage, e);
                    first_error.get_or_insert(WorkerError::Join(e.to_string()));
                }
            }
        }

        info!("All replicas of '{}' have stopped", self.stage);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
