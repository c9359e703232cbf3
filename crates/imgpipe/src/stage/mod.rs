pub mod dead_letter;
pub mod events;
pub mod pool;
pub mod worker;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub use dead_letter::DeadLetter;
pub use events::{StageEvent, StageEventBroadcaster, StagePhase};
pub use pool::StagePool;
pub use worker::{Outcome, StageWorker};

/// Counters shared by every replica of one stage.
#[derive(Debug, Default)]
pub struct StageStats {
    received: AtomicU64,
    redelivered: AtomicU64,
    forwarded: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageStatsSnapshot {
    pub received: u64,
    pub redelivered: u64,
    pub forwarded: u64,
    pub completed: u64,
    pub rejected: u64,
}

impl StageStats {
    pub fn record_received(&self, redelivered: bool) {
        self.received.fetch_add(1, Ordering::Relaxed);
        if redelivered {
            self.redelivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_outcome(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Forwarded => &self.forwarded,
            Outcome::Completed => &self.completed,
            Outcome::Rejected { .. } => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StageStatsSnapshot {
        StageStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl StageStatsSnapshot {
    /// Messages that reached a final decision.
    pub fn settled(&self) -> u64 {
        self.forwarded + self.completed + self.rejected
    }
}
