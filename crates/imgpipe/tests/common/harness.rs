//! Test harness for isolated pipeline runs.
//!
//! Each `TestHarness` owns a temp directory and an in-process broker, and
//! rewrites topologies so every stage writes inside that directory.

#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};
use tempfile::TempDir;

use imgpipe::broker::{Broker, MemoryBroker, ReconnectPolicy, Session};
use imgpipe::storage::UploadStore;
use imgpipe::{Envelope, Ingress, StageSpec, Topology, TransformSpec};

pub const FAST_RECONNECT: Duration = Duration::from_millis(20);

pub struct TestHarness {
    temp_dir: TempDir,
    pub broker: MemoryBroker,
    pub uploads_dir: PathBuf,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let uploads_dir = temp_dir.path().join("uploads");
        std::fs::create_dir_all(&uploads_dir).expect("Failed to create uploads directory");

        Self {
            temp_dir,
            broker: MemoryBroker::new(),
            uploads_dir,
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::new(self.broker.clone())
    }

    pub fn reconnect(&self) -> ReconnectPolicy {
        ReconnectPolicy::fixed(FAST_RECONNECT)
    }

    /// The default pipeline, writing under this harness and resizing to a
    /// small width so the real transforms stay quick.
    pub fn topology(&self) -> Topology {
        let mut topology = Topology::default_pipeline();
        for stage in &mut topology.stages {
            self.relocate(stage);
            if let TransformSpec::Resize { width } = &mut stage.transform {
                *width = 48;
            }
        }
        topology
    }

    pub fn relocate(&self, stage: &mut StageSpec) {
        stage.output_directory = self.root().join(&stage.output_directory);
    }

    pub fn dir(&self, name: &str) -> PathBuf {
        self.root().join(name)
    }

    /// Writes a small gradient PNG and returns its path.
    pub fn write_png(&self, name: &str, width: u32, height: u32) -> PathBuf {
        let image = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) % 256) as u8])
        });
        let path = self.uploads_dir.join(name);
        image.save(&path).expect("Failed to write test image");
        path
    }

    pub fn png_bytes(&self, width: u32, height: u32) -> Vec<u8> {
        let path = self.write_png("scratch.png", width, height);
        let bytes = std::fs::read(&path).expect("Failed to read test image");
        std::fs::remove_file(&path).expect("Failed to remove scratch image");
        bytes
    }

    /// Publishes envelopes for `count` fresh images straight to `queue`.
    pub async fn enqueue_images(&self, queue: &str, count: usize) -> Vec<String> {
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let id = format!("job-{}.png", i);
            let path = self.write_png(&id, 16, 12);
            self.publish(queue, Envelope::new(id.clone(), path).to_vec().unwrap())
                .await;
            ids.push(id);
        }
        ids
    }

    pub async fn publish(&self, queue: &str, body: Vec<u8>) {
        let session = self.broker.connect().await.expect("broker is up");
        session.declare_durable(queue).await.unwrap();
        session.publish_persistent(queue, body).await.unwrap();
        session.close().await.unwrap();
    }

    pub fn ingress(&self, head_queue: &str) -> Ingress {
        Ingress::new(self.broker(), head_queue, UploadStore::new(&self.uploads_dir))
            .with_publish_attempts(2, Duration::from_millis(5))
    }

    /// File names in `dir`, sorted.
    pub fn files_in(&self, dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub async fn timed<F: Future>(future: F) -> (F::Output, Duration) {
    let start = Instant::now();
    let output = future.await;
    (output, start.elapsed())
}
