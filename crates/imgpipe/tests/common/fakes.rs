//! Transforms that copy bytes instead of decoding pixels.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use imgpipe::error::TransformError;
use imgpipe::Transform;

fn copy(source: &Path, dest: &Path) -> Result<(), TransformError> {
    std::fs::copy(source, dest)
        .map(|_| ())
        .map_err(|e| TransformError::ReadImage {
            path: source.to_path_buf(),
            source: e,
        })
}

/// Copies the source after sleeping, counting calls.
pub struct SlowCopy {
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl SlowCopy {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn instant() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Transform for SlowCopy {
    fn name(&self) -> &str {
        "slow-copy"
    }

    fn apply(&self, source: &Path, dest: &Path) -> Result<(), TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        copy(source, dest)
    }
}

/// Fails every call.
pub struct FailingTransform;

impl Transform for FailingTransform {
    fn name(&self) -> &str {
        "failing"
    }

    fn apply(&self, _source: &Path, _dest: &Path) -> Result<(), TransformError> {
        Err(TransformError::UnsupportedFormat("fake".to_string()))
    }
}
