use chrono::{DateTime, Utc};
use escrow_core::PendingRelease;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("release queue IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("release queue serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct QueueData {
    saved_at: Option<DateTime<Utc>>,
    entries: BTreeMap<String, PendingRelease>,
}

/// File-backed snapshot of the release retry queue.
///
/// Attempt counts and escalation flags survive service restarts; approved milestones
/// themselves are re-queued from storage on startup either way.
#[derive(Debug)]
pub struct PersistedReleaseQueue {
    path: PathBuf,
    data: QueueData,
}

impl PersistedReleaseQueue {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let path = path.into();
        let data = if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.is_empty() {
                QueueData::default()
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            QueueData::default()
        };

        Ok(Self { path, data })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> Vec<PendingRelease> {
        let mut values: Vec<PendingRelease> = self.data.entries.values().cloned().collect();
        values.sort_by_key(|entry| entry.queued_at);
        values
    }

    pub fn len(&self) -> usize {
        self.data.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.entries.is_empty()
    }

    /// Replace the snapshot with the live queue. Skips the write when nothing changed.
    pub fn replace(&mut self, entries: Vec<PendingRelease>) -> Result<(), QueueError> {
        let next: BTreeMap<String, PendingRelease> = entries
            .into_iter()
            .map(|entry| (entry.milestone_id.clone(), entry))
            .collect();
        if next == self.data.entries && self.path.exists() {
            return Ok(());
        }

        self.data.entries = next;
        self.data.saved_at = Some(Utc::now());
        self.persist()
    }

    fn persist(&self) -> Result<(), QueueError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes = serde_json::to_vec_pretty(&self.data)?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, bytes)?;
        fs::rename(tmp_path, &self.path)?;
        Ok(())
    }
}
