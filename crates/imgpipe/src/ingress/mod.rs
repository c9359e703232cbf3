//! Accepts uploaded images and hands them to the head of the pipeline.

pub mod http;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use image::ImageFormat;
use log::{info, warn};
use tokio::sync::Mutex;

use crate::broker::{Broker, Session};
use crate::envelope::Envelope;
use crate::error::{BrokerError, IngressError};
use crate::storage::UploadStore;

pub const DEFAULT_PUBLISH_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

pub struct Ingress {
    broker: Arc<dyn Broker>,
    head_queue: String,
    uploads: UploadStore,
    publish_attempts: u32,
    retry_delay: Duration,
    max_upload_bytes: usize,
    /// Shared by concurrent uploads, replaced after a transport failure.
    session: Mutex<Option<Arc<dyn Session>>>,
}

impl Ingress {
    pub fn new(broker: Arc<dyn Broker>, head_queue: impl Into<String>, uploads: UploadStore) -> Self {
        Self {
            broker,
            head_queue: head_queue.into(),
            uploads,
            publish_attempts: DEFAULT_PUBLISH_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            session: Mutex::new(None),
        }
    }

    pub fn with_publish_attempts(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.publish_attempts = attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_max_upload_bytes(mut self, limit: usize) -> Self {
        self.max_upload_bytes = limit;
        self
    }

    pub fn head_queue(&self) -> &str {
        &self.head_queue
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    /// Validates, stores and enqueues one upload.
    ///
    /// The bytes are on disk before the envelope is published. If the
    /// broker cannot be reached the stored file is removed again, so a
    /// failed request leaves nothing behind.
    pub async fn accept(&self, filename: Option<&str>, bytes: &[u8]) -> Result<Envelope, IngressError> {
        let filename = filename.ok_or(IngressError::MissingFile)?;
        if filename.trim().is_empty() {
            return Err(IngressError::NoSelectedFile);
        }
        if bytes.is_empty() {
            return Err(IngressError::EmptyFile(filename.to_string()));
        }
        if bytes.len() > self.max_upload_bytes {
            return Err(IngressError::TooLarge {
                limit: self.max_upload_bytes,
            });
        }
        if !is_processable_image(filename) {
            return Err(IngressError::UnsupportedType(filename.to_string()));
        }

        let (image_id, path) = self.uploads.save(filename, bytes)?;
        let envelope = Envelope::new(image_id, path);

        if let Err(e) = self.publish(&envelope).await {
            if let Err(cleanup) = self.uploads.remove(&envelope.original_path) {
                warn!("Failed to remove unpublished upload: {}", cleanup);
            }
            return Err(e);
        }

        info!("Sent {} to {}", envelope.image_id, self.head_queue);
        Ok(envelope)
    }

    /// Publishes to the head queue, reconnecting up to the configured
    /// number of attempts.
    pub async fn publish(&self, envelope: &Envelope) -> Result<(), IngressError> {
        let body = envelope.to_vec()?;
        let mut last_error = BrokerError::ConnectionLost;

        for attempt in 1..=self.publish_attempts {
            match self.try_publish(body.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => last_error = e,
            }

            warn!(
                "Publish attempt {}/{} failed: {}",
                attempt, self.publish_attempts, last_error
            );
            if attempt < self.publish_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(IngressError::BrokerUnavailable(last_error))
    }

    async fn try_publish(&self, body: Vec<u8>) -> Result<(), BrokerError> {
        let session = self.session().await?;
        match session.publish_persistent(&self.head_queue, body).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.discard(&session).await;
                Err(e)
            }
        }
    }

    /// The lock covers only taking or opening the session, never a publish
    /// or a retry delay.
    async fn session(&self) -> Result<Arc<dyn Session>, BrokerError> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok(Arc::clone(session));
        }

        let session: Arc<dyn Session> = Arc::from(self.broker.connect().await?);
        session.declare_durable(&self.head_queue).await?;
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Drops `failed` unless another upload already replaced it.
    async fn discard(&self, failed: &Arc<dyn Session>) {
        let mut slot = self.session.lock().await;
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, failed)) {
            *slot = None;
        }
    }
}

/// An image type every stage can decode and write back under the same
/// extension.
fn is_processable_image(filename: &str) -> bool {
    let is_image = mime_guess::from_path(filename)
        .first()
        .map(|mime| mime.type_() == mime_guess::mime::IMAGE)
        .unwrap_or(false);

    is_image
        && Path::new(filename)
            .extension()
            .and_then(ImageFormat::from_extension)
            .is_some_and(|format| format.reading_enabled() && format.writing_enabled())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use tempfile::TempDir;

    fn ingress(broker: &MemoryBroker, dir: &std::path::Path) -> Ingress {
        Ingress::new(
            Arc::new(broker.clone()),
            "upload_queue",
            UploadStore::new(dir.join("uploads")),
        )
        .with_publish_attempts(2, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_accept_stores_then_publishes() {
        let temp = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        let ingress = ingress(&broker, temp.path());

        let envelope = ingress.accept(Some("cat.png"), b"png bytes").await.unwrap();

        assert!(envelope.image_id.ends_with(".png"));
        assert_eq!(std::fs::read(&envelope.original_path).unwrap(), b"png bytes");
        let queued = Envelope::from_slice(&broker.messages("upload_queue")[0]).unwrap();
        assert_eq!(queued, envelope);
    }

    #[tokio::test]
    async fn test_validation_errors_never_reach_the_queue() {
        let temp = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        let ingress = ingress(&broker, temp.path());

        let cases = [
            ingress.accept(None, b"x").await,
            ingress.accept(Some(""), b"x").await,
            ingress.accept(Some("a.png"), b"").await,
            ingress.accept(Some("notes.txt"), b"x").await,
        ];

        for result in cases {
            let err = result.unwrap_err();
            assert!(err.is_client_error(), "{} should be a client error", err);
        }
        assert_eq!(broker.depth("upload_queue"), None);
    }

    #[tokio::test]
    async fn test_only_formats_stages_can_process_are_accepted() {
        let temp = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        let ingress = ingress(&broker, temp.path());

        for name in ["a.png", "b.JPG", "c.jpeg", "d.gif", "e.bmp", "f.tiff", "g.webp"] {
            ingress.accept(Some(name), b"x").await.unwrap();
        }
        for name in ["logo.svg", "photo.heic", "photo.avif", "icon.ico"] {
            let err = ingress.accept(Some(name), b"x").await.unwrap_err();
            assert!(
                matches!(err, IngressError::UnsupportedType(_)),
                "{} gave {}",
                name,
                err
            );
        }
        assert_eq!(broker.depth("upload_queue"), Some(7));
    }

    #[tokio::test]
    async fn test_oversized_upload_is_refused_before_storing() {
        let temp = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        let ingress = ingress(&broker, temp.path()).with_max_upload_bytes(16);

        let err = ingress.accept(Some("big.png"), &[7u8; 17]).await.unwrap_err();

        assert!(matches!(err, IngressError::TooLarge { limit: 16 }));
        assert!(err.is_client_error());
        assert_eq!(broker.depth("upload_queue"), None);
        ingress.accept(Some("small.png"), &[7u8; 16]).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_uploads_back_off_in_parallel() {
        let temp = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let ingress = Arc::new(
            Ingress::new(
                Arc::new(broker.clone()),
                "upload_queue",
                UploadStore::new(temp.path().join("uploads")),
            )
            .with_publish_attempts(3, Duration::from_millis(200)),
        );

        let started = std::time::Instant::now();
        let uploads = (0..4).map(|i| {
            let ingress = Arc::clone(&ingress);
            tokio::spawn(async move {
                let name = format!("{}.png", i);
                ingress.accept(Some(name.as_str()), b"x").await
            })
        });
        for result in futures_util::future::join_all(uploads).await {
            assert!(matches!(
                result.unwrap(),
                Err(IngressError::BrokerUnavailable(_))
            ));
        }

        // One upload spends 400ms backing off; four in a row would take 1.6s.
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_millis(1200), "took {:?}", elapsed);
    }

    #[test]
    fn test_error_messages_match_http_contract() {
        assert_eq!(IngressError::MissingFile.to_string(), "No file found");
        assert_eq!(IngressError::NoSelectedFile.to_string(), "No selected file");
    }

    #[tokio::test]
    async fn test_unavailable_broker_removes_upload() {
        let temp = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let ingress = ingress(&broker, temp.path());

        let err = ingress.accept(Some("dog.jpg"), b"jpeg").await.unwrap_err();

        assert!(matches!(err, IngressError::BrokerUnavailable(_)));
        assert!(!err.is_client_error());
        let leftovers = std::fs::read_dir(temp.path().join("uploads")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_publish_recovers_from_a_dropped_session() {
        let temp = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        let ingress = ingress(&broker, temp.path());
        ingress.accept(Some("one.png"), b"1").await.unwrap();

        broker.inject_publish_failures(1);
        ingress.accept(Some("two.png"), b"2").await.unwrap();

        assert_eq!(broker.depth("upload_queue"), Some(2));
    }
}
