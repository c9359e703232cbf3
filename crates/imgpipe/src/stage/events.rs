//! Stage event broadcaster for observing envelopes as they move.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::envelope::Envelope;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    Connected,
    Received,
    Forwarded,
    Completed,
    Rejected,
    Disconnected,
}

impl std::fmt::Display for StagePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StagePhase::Connected => write!(f, "Connected"),
            StagePhase::Received => write!(f, "Received"),
            StagePhase::Forwarded => write!(f, "Forwarded"),
            StagePhase::Completed => write!(f, "Completed"),
            StagePhase::Rejected => write!(f, "Rejected"),
            StagePhase::Disconnected => write!(f, "Disconnected"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageEvent {
    pub stage: String,
    pub replica: usize,
    /// Absent for connection events and unparseable bodies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    pub phase: StagePhase,
    pub message: String,
    /// The envelope as forwarded or completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Envelope>,
    pub timestamp: DateTime<Utc>,
}

impl StageEvent {
    pub fn new(stage: &str, replica: usize, phase: StagePhase, message: impl Into<String>) -> Self {
        Self {
            stage: stage.to_string(),
            replica,
            image_id: None,
            phase,
            message: message.into(),
            envelope: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_image_id(mut self, image_id: impl Into<String>) -> Self {
        self.image_id = Some(image_id.into());
        self
    }

    pub fn with_envelope(mut self, envelope: Envelope) -> Self {
        self.image_id = Some(envelope.image_id.clone());
        self.envelope = Some(envelope);
        self
    }
}

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct StageEventBroadcaster {
    sender: Arc<broadcast::Sender<StageEvent>>,
}

impl StageEventBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.sender.subscribe()
    }

    /// Events sent with no subscriber are dropped.
    pub fn send(&self, event: StageEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for StageEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
