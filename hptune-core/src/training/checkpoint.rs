//! Checkpoint files and per-trial checkpoint retention.

use super::backend::SessionState;
use crate::error::TuneError;
use crate::persistence::{atomic_write, atomic_write_json, load_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of a checkpoint inside its step directory.
pub const CHECKPOINT_FILE: &str = "checkpoint";

const MANIFEST_FILE: &str = "checkpoints.json";

/// On-disk checkpoint: model weights, optimizer state and step counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointFile {
    #[serde(flatten)]
    pub state: SessionState,
    pub step: usize,
}

/// Write a checkpoint file, returning its sha256 and size.
pub fn write_checkpoint_file(
    path: &Path,
    state: &SessionState,
    step: usize,
) -> Result<(String, u64), TuneError> {
    let file = CheckpointFile {
        state: state.clone(),
        step,
    };
    let bytes = serde_json::to_vec(&file)?;
    atomic_write(path, &bytes)?;
    Ok((sha256_hex(&bytes), bytes.len() as u64))
}

pub fn read_checkpoint_file(path: &Path) -> Result<CheckpointFile, TuneError> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Manifest entry for one saved checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: String,
    pub trial_id: String,
    pub step: usize,
    pub valid_loss: f64,
    pub path: PathBuf,
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Saves checkpoints under `<base_dir>/<trial_id>/checkpoint_<step>/` and
/// keeps only the `keep_best` lowest-loss ones plus the most recent.
pub struct CheckpointManager {
    base_dir: PathBuf,
    keep_best: usize,
}

impl CheckpointManager {
    pub fn new(base_dir: PathBuf, keep_best: usize) -> Self {
        Self {
            base_dir,
            keep_best,
        }
    }

    pub fn trial_dir(&self, trial_id: &str) -> PathBuf {
        self.base_dir.join(trial_id)
    }

    /// List retained checkpoints for a trial, oldest first.
    pub fn list(&self, trial_id: &str) -> Result<Vec<CheckpointRecord>, TuneError> {
        let manifest = self.trial_dir(trial_id).join(MANIFEST_FILE);
        Ok(load_json(&manifest)?.unwrap_or_default())
    }

    /// Lowest validation loss.
    pub fn best(&self, trial_id: &str) -> Result<Option<CheckpointRecord>, TuneError> {
        Ok(self
            .list(trial_id)?
            .into_iter()
            .min_by(|a, b| a.valid_loss.total_cmp(&b.valid_loss)))
    }

    /// Highest step.
    pub fn latest(&self, trial_id: &str) -> Result<Option<CheckpointRecord>, TuneError> {
        Ok(self.list(trial_id)?.into_iter().max_by_key(|c| c.step))
    }

    pub fn save(
        &self,
        trial_id: &str,
        step: usize,
        valid_loss: f64,
        state: &SessionState,
    ) -> Result<CheckpointRecord, TuneError> {
        let dir = self
            .trial_dir(trial_id)
            .join(format!("checkpoint_{step:06}"));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(CHECKPOINT_FILE);
        let (hash, size_bytes) = write_checkpoint_file(&path, state, step)?;

        let record = CheckpointRecord {
            id: uuid::Uuid::new_v4().to_string(),
            trial_id: trial_id.to_string(),
            step,
            valid_loss,
            path,
            hash,
            size_bytes,
            created_at: Utc::now(),
        };

        let mut records = self.list(trial_id)?;
        records.retain(|c| c.step != step);
        records.push(record.clone());
        let (kept, evicted) = self.partition_retained(records);

        for old in &evicted {
            if let Some(step_dir) = old.path.parent() {
                if step_dir.exists() {
                    std::fs::remove_dir_all(step_dir)?;
                }
            }
            debug!(trial = %trial_id, step = old.step, "Evicted checkpoint");
        }

        atomic_write_json(&self.trial_dir(trial_id).join(MANIFEST_FILE), &kept)?;
        Ok(record)
    }

    /// Split into (kept, evicted): the `keep_best` lowest losses survive, and
    /// so does the latest step, which is what a restarted trial resumes from.
    fn partition_retained(
        &self,
        records: Vec<CheckpointRecord>,
    ) -> (Vec<CheckpointRecord>, Vec<CheckpointRecord>) {
        let latest_step = records.iter().map(|c| c.step).max();

        let mut by_loss: Vec<&CheckpointRecord> = records.iter().collect();
        by_loss.sort_by(|a, b| a.valid_loss.total_cmp(&b.valid_loss));
        let best_steps: Vec<usize> = by_loss
            .iter()
            .take(self.keep_best.max(1))
            .map(|c| c.step)
            .collect();

        records
            .into_iter()
            .partition(|c| best_steps.contains(&c.step) || Some(c.step) == latest_step)
    }

    /// Load a checkpoint, verifying its hash against the manifest.
    pub fn load(&self, record: &CheckpointRecord) -> Result<CheckpointFile, TuneError> {
        let bytes = std::fs::read(&record.path)?;
        let actual = sha256_hex(&bytes);
        if actual != record.hash {
            return Err(TuneError::checkpoint(format!(
                "hash mismatch for {} (expected {}, got {actual})",
                record.path.display(),
                record.hash
            )));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state(tag: u8) -> SessionState {
        SessionState {
            model: vec![tag; 4],
            optim: vec![tag],
        }
    }

    #[test]
    fn test_checkpoint_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt").join(CHECKPOINT_FILE);
        let (hash, size) = write_checkpoint_file(&path, &state(7), 3).unwrap();
        assert_eq!(hash.len(), 64);
        assert!(size > 0);

        let file = read_checkpoint_file(&path).unwrap();
        assert_eq!(file.step, 3);
        assert_eq!(file.state, state(7));

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(raw.get("model").is_some());
        assert!(raw.get("optim").is_some());
        assert_eq!(raw["step"], 3);
    }

    #[test]
    fn test_keeps_best_three_by_loss_and_latest() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path().to_path_buf(), 3);
        let losses = [0.9, 0.5, 0.7, 0.4, 0.8, 0.95];
        for (i, loss) in losses.iter().enumerate() {
            manager.save("trial_0", i + 1, *loss, &state(i as u8)).unwrap();
        }

        let mut steps: Vec<usize> = manager
            .list("trial_0")
            .unwrap()
            .iter()
            .map(|c| c.step)
            .collect();
        steps.sort_unstable();
        // Best three: steps 4 (0.4), 2 (0.5), 3 (0.7); plus latest step 6.
        assert_eq!(steps, vec![2, 3, 4, 6]);

        assert!(!dir.path().join("trial_0/checkpoint_000001").exists());
        assert!(!dir.path().join("trial_0/checkpoint_000005").exists());
        assert!(dir.path().join("trial_0/checkpoint_000004").exists());

        assert_eq!(manager.best("trial_0").unwrap().unwrap().step, 4);
        assert_eq!(manager.latest("trial_0").unwrap().unwrap().step, 6);
    }

    #[test]
    fn test_load_verifies_hash() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path().to_path_buf(), 3);
        let record = manager.save("t", 1, 0.3, &state(1)).unwrap();

        let loaded = manager.load(&record).unwrap();
        assert_eq!(loaded.state, state(1));
        assert_eq!(loaded.step, 1);

        std::fs::write(&record.path, b"{\"model\":\"\",\"optim\":\"\",\"step\":1}").unwrap();
        let err = manager.load(&record).unwrap_err();
        assert!(matches!(err, TuneError::Checkpoint(_)));
    }

    #[test]
    fn test_empty_trial() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path().to_path_buf(), 3);
        assert!(manager.list("nobody").unwrap().is_empty());
        assert!(manager.latest("nobody").unwrap().is_none());
    }
}
