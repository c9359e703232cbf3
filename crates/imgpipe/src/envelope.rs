use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;

/// Envelope fields a stage can read from or write to.
///
/// The serialized names are the wire field names, so a topology file says
/// `"source_key": "current_path"` exactly as the key appears in a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKey {
    OriginalPath,
    ResizedPath,
    BlurredPath,
    WatermarkedPath,
    /// Most recent stage output, or the original when no stage has run.
    CurrentPath,
}

impl EnvelopeKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKey::OriginalPath => "original_path",
            EnvelopeKey::ResizedPath => "resized_path",
            EnvelopeKey::BlurredPath => "blurred_path",
            EnvelopeKey::WatermarkedPath => "watermarked_path",
            EnvelopeKey::CurrentPath => "current_path",
        }
    }

    /// Keys owned by a stage. `original_path` belongs to ingress and
    /// `current_path` is maintained by [`Envelope::derive`].
    pub fn is_stage_output(&self) -> bool {
        matches!(
            self,
            EnvelopeKey::ResizedPath | EnvelopeKey::BlurredPath | EnvelopeKey::WatermarkedPath
        )
    }
}

impl fmt::Display for EnvelopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of work that travels through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub image_id: String,
    pub original_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resized_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blurred_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermarked_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_path: Option<PathBuf>,
    /// Keys written by producers this version does not know about.
    /// Carried forward untouched so no hop ever drops a key.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Envelope {
    pub fn new(image_id: impl Into<String>, original_path: impl Into<PathBuf>) -> Self {
        Self {
            image_id: image_id.into(),
            original_path: original_path.into(),
            resized_path: None,
            blurred_path: None,
            watermarked_path: None,
            current_path: None,
            extra: BTreeMap::new(),
        }
    }

    /// Parses and validates a message body.
    pub fn from_slice(body: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_slice(body)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        validate_image_id(&self.image_id)?;

        if self.original_path.as_os_str().is_empty() {
            return Err(EnvelopeError::InvalidField {
                field: "original_path",
                reason: "must not be empty".to_string(),
            });
        }

        Ok(())
    }

    /// Resolves the locator stored under `key`.
    pub fn locator(&self, key: EnvelopeKey) -> Option<&Path> {
        match key {
            EnvelopeKey::OriginalPath => Some(self.original_path.as_path()),
            EnvelopeKey::ResizedPath => self.resized_path.as_deref(),
            EnvelopeKey::BlurredPath => self.blurred_path.as_deref(),
            EnvelopeKey::WatermarkedPath => self.watermarked_path.as_deref(),
            EnvelopeKey::CurrentPath => self
                .current_path
                .as_deref()
                .or(Some(self.original_path.as_path())),
        }
    }

    /// Builds the successor envelope a stage forwards after writing `dest`.
    ///
    /// The receiver is left untouched. `original_path` is never overwritten;
    /// asking to write it only moves `current_path`.
    pub fn derive(&self, key: EnvelopeKey, dest: impl Into<PathBuf>) -> Envelope {
        let dest = dest.into();
        let mut next = self.clone();

        match key {
            EnvelopeKey::ResizedPath => next.resized_path = Some(dest.clone()),
            EnvelopeKey::BlurredPath => next.blurred_path = Some(dest.clone()),
            EnvelopeKey::WatermarkedPath => next.watermarked_path = Some(dest.clone()),
            EnvelopeKey::OriginalPath | EnvelopeKey::CurrentPath => {}
        }

        next.current_path = Some(dest);
        next
    }

    /// Locators written by stages so far, in pipeline field order.
    pub fn stage_outputs(&self) -> Vec<(EnvelopeKey, &Path)> {
        [
            EnvelopeKey::ResizedPath,
            EnvelopeKey::BlurredPath,
            EnvelopeKey::WatermarkedPath,
        ]
        .into_iter()
        .filter_map(|key| self.locator(key).map(|path| (key, path)))
        .collect()
    }
}

/// An image id doubles as the output filename of every stage, so it has to
/// be a single plain path component.
pub fn validate_image_id(image_id: &str) -> Result<(), EnvelopeError> {
    let reason = if image_id.is_empty() {
        Some("must not be empty")
    } else if image_id == "." || image_id == ".." {
        Some("must not be a relative directory")
    } else if image_id.contains(['/', '\\']) {
        Some("must not contain path separators")
    } else if image_id.contains('\0') {
        Some("must not contain NUL bytes")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(EnvelopeError::InvalidField {
            field: "image_id",
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}
