use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::envelope::validate_image_id;
use crate::error::StorageError;

fn ensure_directory(path: &Path) -> Result<(), StorageError> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!("Created directory {}", path.display());
    }
    Ok(())
}

/// Where a stage writes its outputs, one file per image id.
#[derive(Debug, Clone)]
pub struct OutputStore {
    directory: PathBuf,
}

impl OutputStore {
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Resolves the output location for `image_id`, creating the directory
    /// on first use. A redelivered job resolves to the same path and
    /// overwrites its earlier attempt.
    pub fn output_path(&self, image_id: &str) -> Result<PathBuf, StorageError> {
        validate_image_id(image_id).map_err(|_| StorageError::InvalidImageId(image_id.to_string()))?;
        ensure_directory(&self.directory)?;
        Ok(self.directory.join(image_id))
    }
}

/// Persists uploaded bytes under freshly minted image ids.
#[derive(Debug, Clone)]
pub struct UploadStore {
    directory: PathBuf,
}

impl UploadStore {
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Writes `content` as `<uuid>.<ext>`, taking the extension from the
    /// client's filename. Returns the new image id and its stored path.
    pub fn save(&self, filename: &str, content: &[u8]) -> Result<(String, PathBuf), StorageError> {
        ensure_directory(&self.directory)?;

        let extension = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        let image_id = match extension {
            Some(ext) if !ext.is_empty() => format!("{}.{}", uuid::Uuid::new_v4(), ext),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        let path = self.directory.join(&image_id);

        // create_new: a collision must never clobber another upload.
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| StorageError::WriteFile {
                path: path.clone(),
                source: e,
            })?;

        if let Err(e) = file.write_all(content).and_then(|_| file.sync_all()) {
            drop(file);
            if let Err(cleanup) = std::fs::remove_file(&path) {
                warn!("Failed to clean up partial upload {}: {}", path.display(), cleanup);
            }
            return Err(StorageError::WriteFile { path, source: e });
        }

        debug!("Stored upload {} ({} bytes)", path.display(), content.len());
        Ok((image_id, path))
    }

    pub fn remove(&self, path: &Path) -> Result<(), StorageError> {
        std::fs::remove_file(path).map_err(|e| StorageError::RemoveFile {
            path: path.to_path_buf(),
            source: e,
        })
    }
}
