//! Checkpoint stores.
//!
//! [`MemoryRecoveryStore`] suits hosts that persist through some other
//! channel (or tests). [`JsonFileRecoveryStore`] keeps the checkpoint in a
//! single JSON file that is replaced atomically: the new content goes to a
//! temporary sibling which is then renamed over the target.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::adapters::{Checkpoint, RecoveryStore};
use crate::error::{OtaError, OtaResult};

/// Volatile checkpoint store.
#[derive(Debug, Default, Clone)]
pub struct MemoryRecoveryStore {
    checkpoint: Option<Checkpoint>,
}

impl MemoryRecoveryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store already holding `checkpoint`.
    #[must_use]
    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            checkpoint: Some(checkpoint),
        }
    }
}

impl RecoveryStore for MemoryRecoveryStore {
    fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> OtaResult<()> {
        self.checkpoint = Some(*checkpoint);
        Ok(())
    }

    fn load_checkpoint(&self) -> OtaResult<Option<Checkpoint>> {
        Ok(self.checkpoint)
    }

    fn clear_checkpoint(&mut self) -> OtaResult<()> {
        self.checkpoint = None;
        Ok(())
    }
}

/// Checkpoint store backed by a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileRecoveryStore {
    path: PathBuf,
}

impl JsonFileRecoveryStore {
    /// Store the checkpoint at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the checkpoint file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }
}

impl RecoveryStore for JsonFileRecoveryStore {
    fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> OtaResult<()> {
        let content = serde_json::to_vec_pretty(checkpoint)?;
        let temp_path = self.temp_path();

        fs::write(&temp_path, content).map_err(|e| {
            OtaError::recovery(format!("failed to write {}: {e}", temp_path.display()))
        })?;
        fs::rename(&temp_path, &self.path).map_err(|e| {
            OtaError::recovery(format!("failed to replace {}: {e}", self.path.display()))
        })?;

        debug!(path = ?self.path, offset = checkpoint.offset, "Checkpoint saved");
        Ok(())
    }

    fn load_checkpoint(&self) -> OtaResult<Option<Checkpoint>> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| OtaError::corrupt_checkpoint(format!("{}: {e}", self.path.display())))
    }

    fn clear_checkpoint(&mut self) -> OtaResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = ?self.path, "Checkpoint cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
