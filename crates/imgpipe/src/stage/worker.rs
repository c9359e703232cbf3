use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use super::dead_letter::DeadLetter;
use super::events::{StageEvent, StageEventBroadcaster, StagePhase};
use super::StageStats;
use crate::broker::{Broker, Delivery, ReconnectPolicy, Session};
use crate::envelope::Envelope;
use crate::error::{BrokerError, TransformError, WorkerError};
use crate::storage::OutputStore;
use crate::topology::StageSpec;
use crate::transform::Transform;

/// How one delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Forwarded,
    Completed,
    Rejected {
        image_id: Option<String>,
        reason: String,
    },
}

#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Disconnected(BrokerError),
}

/// One replica's consumption loop for a stage.
///
/// Cloning is cheap and clones share stats and events, which is how a
/// [`StagePool`](super::StagePool) fans one worker out into replicas.
#[derive(Clone)]
pub struct StageWorker {
    spec: Arc<StageSpec>,
    transform: Arc<dyn Transform>,
    broker: Arc<dyn Broker>,
    store: OutputStore,
    dead_letter_queue: Option<String>,
    reconnect: ReconnectPolicy,
    replica: usize,
    events: Option<StageEventBroadcaster>,
    stats: Arc<StageStats>,
}

impl StageWorker {
    pub fn new(spec: StageSpec, broker: Arc<dyn Broker>) -> Result<Self, TransformError> {
        let transform = spec.transform.build()?;
        Ok(Self::with_transform(spec, transform, broker))
    }

    /// Uses `transform` instead of building the one `spec.transform` names.
    pub fn with_transform(
        spec: StageSpec,
        transform: Arc<dyn Transform>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        let store = OutputStore::new(&spec.output_directory);
        Self {
            spec: Arc::new(spec),
            transform,
            broker,
            store,
            dead_letter_queue: None,
            reconnect: ReconnectPolicy::default(),
            replica: 0,
            events: None,
            stats: Arc::new(StageStats::default()),
        }
    }

    pub fn with_dead_letter_queue(mut self, queue: Option<String>) -> Self {
        self.dead_letter_queue = queue;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_events(mut self, events: StageEventBroadcaster) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_stats(mut self, stats: Arc<StageStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_replica(mut self, replica: usize) -> Self {
        self.replica = replica;
        self
    }

    pub fn spec(&self) -> &StageSpec {
        &self.spec
    }

    pub fn replica(&self) -> usize {
        self.replica
    }

    pub fn stats(&self) -> Arc<StageStats> {
        Arc::clone(&self.stats)
    }

    /// Consumes until `shutdown` fires, reconnecting after every lost
    /// session. Only returns an error when the reconnect policy has a cap
    /// and it is reached.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let mut failed_attempts: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            match self.run_session(&shutdown).await {
                Ok(SessionEnd::Shutdown) => {
                    info!(stage = %self.spec.name, replica = self.replica, "Stage worker stopped");
                    return Ok(());
                }
                Ok(SessionEnd::Disconnected(e)) => {
                    failed_attempts = 0;
                    warn!(
                        stage = %self.spec.name,
                        replica = self.replica,
                        "Lost broker session: {}", e
                    );
                    self.emit(StageEvent::new(
                        &self.spec.name,
                        self.replica,
                        StagePhase::Disconnected,
                        e.to_string(),
                    ));
                }
                Err(e) => {
                    failed_attempts += 1;
                    if self.reconnect.exhausted(failed_attempts) {
                        return Err(WorkerError::ReconnectExhausted {
                            attempts: failed_attempts,
                            source: e,
                        });
                    }
                    warn!(
                        stage = %self.spec.name,
                        replica = self.replica,
                        attempt = failed_attempts,
                        "Failed to connect to broker: {}", e
                    );
                }
            }

            debug!(
                stage = %self.spec.name,
                "Reconnecting in {:?}", self.reconnect.delay
            );
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.reconnect.delay) => {}
            }
        }
    }

    /// `Err` means the session never started consuming.
    async fn run_session(&self, shutdown: &CancellationToken) -> Result<SessionEnd, BrokerError> {
        let session: Arc<dyn Session> = Arc::from(self.broker.connect().await?);

        session.declare_durable(&self.spec.input_queue).await?;
        if let Some(queue) = &self.spec.output_queue {
            session.declare_durable(queue).await?;
        }
        if let Some(queue) = &self.dead_letter_queue {
            session.declare_durable(queue).await?;
        }

        let limit = self.spec.concurrency_limit.max(1);
        let mut subscription = session.subscribe(&self.spec.input_queue, limit).await?;

        info!(
            stage = %self.spec.name,
            replica = self.replica,
            queue = %self.spec.input_queue,
            "Waiting for messages"
        );
        self.emit(StageEvent::new(
            &self.spec.name,
            self.replica,
            StagePhase::Connected,
            format!("Consuming from {}", self.spec.input_queue),
        ));

        let mut in_flight: FuturesUnordered<BoxFuture<'_, Result<Outcome, BrokerError>>> =
            FuturesUnordered::new();
        let end = loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break SessionEnd::Shutdown,

                Some(result) = in_flight.next(), if !in_flight.is_empty() => {
                    if let Err(e) = result {
                        break SessionEnd::Disconnected(e);
                    }
                }

                delivery = subscription.next_delivery(), if in_flight.len() < limit as usize => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            in_flight.push(self.process(Arc::clone(&session), delivery).boxed());
                        }
                        Some(Err(e)) => break SessionEnd::Disconnected(e),
                        None => break SessionEnd::Disconnected(BrokerError::ConnectionLost),
                    }
                }
            }
        };

        match end {
            SessionEnd::Shutdown => {
                // Stop intake, finish what was already received.
                drop(subscription);
                while let Some(result) = in_flight.next().await {
                    if let Err(e) = result {
                        warn!(stage = %self.spec.name, "Message left unacknowledged at shutdown: {}", e);
                    }
                }
                if let Err(e) = session.close().await {
                    debug!(stage = %self.spec.name, "Error closing session: {}", e);
                }
            }
            SessionEnd::Disconnected(_) => {
                // Unsettled messages come back through redelivery.
                drop(in_flight);
            }
        }

        Ok(end)
    }

    /// Drives one delivery from RECEIVED to forwarded, completed or rejected.
    ///
    /// Transport errors are returned without settling the delivery so the
    /// broker redelivers it.
    async fn process(
        &self,
        session: Arc<dyn Session>,
        delivery: Delivery,
    ) -> Result<Outcome, BrokerError> {
        self.stats.record_received(delivery.redelivered);

        let span = info_span!(
            "stage_message",
            stage = %self.spec.name,
            replica = self.replica,
            tag = delivery.tag,
            redelivered = delivery.redelivered,
            image_id = tracing::field::Empty,
        );

        async move {
            let envelope = match Envelope::from_slice(&delivery.body) {
                Ok(envelope) => envelope,
                Err(e) => return self.reject(&session, &delivery, None, e.to_string()).await,
            };
            Span::current().record("image_id", envelope.image_id.as_str());
            debug!("Received");
            self.emit(
                StageEvent::new(&self.spec.name, self.replica, StagePhase::Received, "Received")
                    .with_image_id(envelope.image_id.clone()),
            );

            let source = match envelope.locator(self.spec.source_key) {
                Some(path) => path.to_path_buf(),
                None => {
                    let reason = format!("envelope has no {}", self.spec.source_key);
                    return self.reject(&session, &delivery, Some(envelope), reason).await;
                }
            };
            let dest = match self.store.output_path(&envelope.image_id) {
                Ok(path) => path,
                Err(e) => {
                    return self
                        .reject(&session, &delivery, Some(envelope), e.to_string())
                        .await
                }
            };

            if let Err(reason) = self.apply_transform(source, dest.clone()).await {
                return self.reject(&session, &delivery, Some(envelope), reason).await;
            }

            let derived = envelope.derive(self.spec.output_key, &dest);
            let outcome = match &self.spec.output_queue {
                Some(queue) => {
                    let body = match derived.to_vec() {
                        Ok(body) => body,
                        Err(e) => {
                            return self
                                .reject(&session, &delivery, Some(envelope), e.to_string())
                                .await
                        }
                    };
                    session.publish_persistent(queue, body).await?;
                    delivery.ack().await?;
                    info!(queue = %queue, "Forwarded {}", dest.display());
                    Outcome::Forwarded
                }
                None => {
                    delivery.ack().await?;
                    info!("Completed {}", dest.display());
                    Outcome::Completed
                }
            };

            let phase = match outcome {
                Outcome::Forwarded => StagePhase::Forwarded,
                _ => StagePhase::Completed,
            };
            self.stats.record_outcome(&outcome);
            self.emit(
                StageEvent::new(
                    &self.spec.name,
                    self.replica,
                    phase,
                    dest.display().to_string(),
                )
                .with_envelope(derived),
            );
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    async fn apply_transform(&self, source: PathBuf, dest: PathBuf) -> Result<(), String> {
        let transform = Arc::clone(&self.transform);
        let handle = tokio::task::spawn_blocking(move || transform.apply(&source, &dest));

        match handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) if e.is_panic() => Err(format!("{} transform panicked", self.transform.name())),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn reject(
        &self,
        session: &Arc<dyn Session>,
        delivery: &Delivery,
        envelope: Option<Envelope>,
        reason: String,
    ) -> Result<Outcome, BrokerError> {
        warn!("Rejecting message: {}", reason);
        let image_id = envelope.as_ref().map(|e| e.image_id.clone());

        if let Some(queue) = &self.dead_letter_queue {
            let letter = DeadLetter::new(&self.spec.name, reason.clone(), envelope, &delivery.body);
            match letter.to_vec() {
                Ok(body) => session.publish_persistent(queue, body).await?,
                Err(e) => warn!("Could not encode dead letter: {}", e),
            }
        }

        delivery.reject().await?;

        let mut event = StageEvent::new(
            &self.spec.name,
            self.replica,
            StagePhase::Rejected,
            reason.clone(),
        );
        if let Some(id) = &image_id {
            event = event.with_image_id(id.clone());
        }
        self.emit(event);

        let outcome = Outcome::Rejected { image_id, reason };
        self.stats.record_outcome(&outcome);
        Ok(outcome)
    }

    fn emit(&self, event: StageEvent) {
        if let Some(events) = &self.events {
            events.send(event);
        }
    }
}
