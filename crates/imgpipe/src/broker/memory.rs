//! In-process broker with the same delivery contract as RabbitMQ.
//!
//! Used by the single-process runner and by tests, which also use the
//! outage and publish-failure hooks to exercise the recovery paths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::Notify;

use super::{Acknowledger, Broker, Delivery, Session, Subscription};
use crate::error::BrokerError;

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    message: StoredMessage,
    session: u64,
    subscription: u64,
}

#[derive(Debug)]
struct State {
    available: bool,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    unacked: HashMap<u64, Unacked>,
    sessions: HashSet<u64>,
    next_tag: u64,
    next_id: u64,
    publish_failures: u32,
}

impl Default for State {
    fn default() -> Self {
        Self {
            available: true,
            queues: HashMap::new(),
            unacked: HashMap::new(),
            sessions: HashSet::new(),
            next_tag: 1,
            next_id: 1,
            publish_failures: 0,
        }
    }
}

impl State {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn ensure_open(&self, session: u64) -> Result<(), BrokerError> {
        if self.sessions.contains(&session) {
            Ok(())
        } else {
            Err(BrokerError::ConnectionLost)
        }
    }

    /// Returns everything the session still holds to the head of its queue,
    /// keeping the original delivery order.
    fn close_session(&mut self, session: u64) -> usize {
        if !self.sessions.remove(&session) {
            return 0;
        }

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.session == session)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));

        let requeued = tags.len();
        for tag in tags {
            if let Some(mut held) = self.unacked.remove(&tag) {
                held.message.redelivered = true;
                self.queues
                    .entry(held.queue)
                    .or_default()
                    .push_front(held.message);
            }
        }
        requeued
    }

    fn settle(&mut self, session: u64, tag: u64) -> Result<Unacked, BrokerError> {
        self.ensure_open(session)?;
        match self.unacked.get(&tag) {
            Some(held) if held.session == session => {}
            _ => return Err(BrokerError::UnknownDeliveryTag(tag)),
        }
        self.unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    changed: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // Every critical section leaves the maps consistent; poisoning is ignored.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn close_session(&self, session: u64) {
        let requeued = self.lock().close_session(session);
        if requeued > 0 {
            debug!("Session {} closed, requeued {} messages", session, requeued);
        }
        self.changed.notify_waiters();
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a broker outage or recovery. Going down drops every open
    /// session, so whatever they held is redelivered after recovery.
    pub fn set_available(&self, available: bool) {
        {
            let mut state = self.inner.lock();
            state.available = available;
            if !available {
                let sessions: Vec<u64> = state.sessions.iter().copied().collect();
                for session in sessions {
                    state.close_session(session);
                }
                warn!("Memory broker is now unavailable");
            }
        }
        self.inner.changed.notify_waiters();
    }

    /// The next `count` publishes fail and tear down the publishing session.
    pub fn inject_publish_failures(&self, count: u32) {
        self.inner.lock().publish_failures = count;
    }

    /// Ready messages, or `None` for an undeclared queue.
    pub fn depth(&self, queue: &str) -> Option<usize> {
        self.inner.lock().queues.get(queue).map(VecDeque::len)
    }

    pub fn unacked_count(&self) -> usize {
        self.inner.lock().unacked.len()
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Bodies of ready messages in queue order, without consuming them.
    pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn Session>, BrokerError> {
        let id = {
            let mut state = self.inner.lock();
            if !state.available {
                return Err(BrokerError::Unavailable("memory broker is down".to_string()));
            }
            let id = state.next_id();
            state.sessions.insert(id);
            id
        };

        Ok(Box::new(MemorySession {
            inner: Arc::clone(&self.inner),
            acker: Arc::new(MemoryAcker {
                inner: Arc::clone(&self.inner),
                session: id,
            }),
            id,
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemorySession {
    inner: Arc<Inner>,
    acker: Arc<MemoryAcker>,
    id: u64,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.inner.close_session(self.id);
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn declare_durable(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.inner.lock();
        state.ensure_open(self.id)?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<u32, BrokerError> {
        let state = self.inner.lock();
        state.ensure_open(self.id)?;
        state
            .queues
            .get(queue)
            .map(|q| q.len() as u32)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))
    }

    async fn publish_persistent(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        {
            let mut state = self.inner.lock();
            state.ensure_open(self.id)?;

            if state.publish_failures > 0 {
                state.publish_failures -= 1;
                state.close_session(self.id);
                drop(state);
                self.inner.changed.notify_waiters();
                return Err(BrokerError::ConnectionLost);
            }

            let messages = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
            messages.push_back(StoredMessage {
                body,
                redelivered: false,
            });
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let id = {
            let mut state = self.inner.lock();
            state.ensure_open(self.id)?;
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::QueueNotFound(queue.to_string()));
            }
            state.next_id()
        };

        let acker: Arc<dyn Acknowledger> = self.acker.clone();
        Ok(Box::new(MemorySubscription {
            inner: Arc::clone(&self.inner),
            acker,
            queue: queue.to_string(),
            session: self.id,
            id,
            prefetch,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close_session(self.id);
        Ok(())
    }
}

struct MemorySubscription {
    inner: Arc<Inner>,
    acker: Arc<dyn Acknowledger>,
    queue: String,
    session: u64,
    id: u64,
    prefetch: u16,
}

impl MemorySubscription {
    fn try_take(&self) -> Option<Option<Delivery>> {
        let mut state = self.inner.lock();
        if state.ensure_open(self.session).is_err() {
            return None;
        }

        let held = state
            .unacked
            .values()
            .filter(|u| u.subscription == self.id)
            .count();
        if self.prefetch != 0 && held >= self.prefetch as usize {
            return Some(None);
        }

        let message = match state.queues.get_mut(&self.queue).and_then(VecDeque::pop_front) {
            Some(message) => message,
            None => return Some(None),
        };

        let tag = state.next_tag;
        state.next_tag += 1;
        state.unacked.insert(
            tag,
            Unacked {
                queue: self.queue.clone(),
                message: message.clone(),
                session: self.session,
                subscription: self.id,
            },
        );

        Some(Some(Delivery::new(
            tag,
            message.body,
            message.redelivered,
            Arc::clone(&self.acker),
        )))
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            // Register before looking so a change between the check and the
            // await still wakes us.
            notified.as_mut().enable();

            match self.try_take() {
                None => return None,
                Some(Some(delivery)) => return Some(Ok(delivery)),
                Some(None) => notified.await,
            }
        }
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    session: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, tag: u64) -> Result<(), BrokerError> {
        self.inner.lock().settle(self.session, tag)?;
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn reject(&self, tag: u64) -> Result<(), BrokerError> {
        let dropped = self.inner.lock().settle(self.session, tag)?;
        debug!("Rejected delivery {} from '{}'", tag, dropped.queue);
        self.inner.changed.notify_waiters();
        Ok(())
    }
}
