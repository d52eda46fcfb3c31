//! Early stopping on validation loss, with optional best-model snapshots.

use super::backend::TrainingSession;
use super::checkpoint::{CHECKPOINT_FILE, write_checkpoint_file};
use crate::error::TuneError;
use crate::persistence::atomic_write_json;
use crate::run_config::RunConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File written next to the best snapshot describing its scores.
pub const BEST_SCORE_FILE: &str = "best_score.json";

/// Directory, under the snapshot dir, holding the best model checkpoint.
pub const BEST_MODEL_DIR: &str = "best_model";

/// Outcome of one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EarlyStopDecision {
    NewBest,
    NoImprovement { count: usize, remaining: usize },
    Stop,
}

/// Scores of the best epoch seen so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestScore {
    pub epoch: usize,
    pub train_loss: f64,
    pub valid_loss: f64,
    pub valid_acc: f64,
    pub snapshot: Option<PathBuf>,
    pub recorded_at: DateTime<Utc>,
}

/// Tracks the best validation loss of one run.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    snapshot_dir: Option<PathBuf>,
    epoch: usize,
    counter: usize,
    best: Option<BestScore>,
    early_stop: bool,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            snapshot_dir: None,
            epoch: 0,
            counter: 0,
            best: None,
            early_stop: false,
        }
    }

    /// Patience and delta from the run config; snapshots go to its save path.
    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.patience, config.min_delta).with_snapshot_dir(config.save_path.clone())
    }

    pub fn with_snapshot_dir(mut self, dir: PathBuf) -> Self {
        self.snapshot_dir = Some(dir);
        self
    }

    /// Set once patience is exhausted; never cleared.
    pub fn early_stop(&self) -> bool {
        self.early_stop
    }

    pub fn best(&self) -> Option<&BestScore> {
        self.best.as_ref()
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best.as_ref().map(|b| b.valid_loss)
    }

    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn epochs_seen(&self) -> usize {
        self.epoch
    }

    /// Bookkeeping for one epoch, without touching the model.
    ///
    /// A non-finite loss is never an improvement.
    pub fn record(&mut self, train_loss: f64, valid_loss: f64, valid_acc: f64) -> EarlyStopDecision {
        self.epoch += 1;

        let improved = valid_loss.is_finite()
            && match self.best_loss() {
                None => true,
                Some(best) => valid_loss < best - self.min_delta,
            };

        if improved {
            self.best = Some(BestScore {
                epoch: self.epoch,
                train_loss,
                valid_loss,
                valid_acc,
                snapshot: None,
                recorded_at: Utc::now(),
            });
            self.counter = 0;
            return EarlyStopDecision::NewBest;
        }

        self.counter += 1;
        debug!(
            counter = self.counter,
            patience = self.patience,
            "EarlyStopping counter"
        );
        if self.counter >= self.patience {
            self.early_stop = true;
            EarlyStopDecision::Stop
        } else {
            EarlyStopDecision::NoImprovement {
                count: self.counter,
                remaining: self.patience - self.counter,
            }
        }
    }

    /// Record an epoch and, on a new best, snapshot the model.
    pub async fn observe(
        &mut self,
        train_loss: f64,
        valid_loss: f64,
        valid_acc: f64,
        session: &mut dyn TrainingSession,
    ) -> Result<EarlyStopDecision, TuneError> {
        let previous = self.best_loss();
        let decision = self.record(train_loss, valid_loss, valid_acc);

        if decision == EarlyStopDecision::NewBest {
            info!(
                epoch = self.epoch,
                previous = ?previous,
                valid_loss,
                valid_acc,
                "Validation loss improved"
            );
            if let Some(dir) = self.snapshot_dir.clone() {
                self.snapshot(&dir, session).await?;
            }
        } else if decision == EarlyStopDecision::Stop {
            info!(
                epoch = self.epoch,
                best = ?self.best_loss(),
                "Early stopping triggered"
            );
        }

        Ok(decision)
    }

    async fn snapshot(
        &mut self,
        dir: &Path,
        session: &mut dyn TrainingSession,
    ) -> Result<(), TuneError> {
        let state = session.state_dict().await?;
        let path = dir.join(BEST_MODEL_DIR).join(CHECKPOINT_FILE);
        write_checkpoint_file(&path, &state, self.epoch)?;

        if let Some(best) = self.best.as_mut() {
            best.snapshot = Some(path);
            atomic_write_json(&dir.join(BEST_SCORE_FILE), &*best)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::backend::{EvalReport, SessionState, TrainReport};
    use async_trait::async_trait;
    use tempfile::TempDir;

    #[test]
    fn test_stops_after_patience() {
        // Improvement through epoch 2, then flat: patience 2 stops at epoch 4.
        let mut es = EarlyStopping::new(2, 0.0);
        assert_eq!(es.record(1.0, 0.9, 0.5), EarlyStopDecision::NewBest);
        assert_eq!(es.record(0.8, 0.6, 0.6), EarlyStopDecision::NewBest);
        assert_eq!(
            es.record(0.7, 0.65, 0.6),
            EarlyStopDecision::NoImprovement {
                count: 1,
                remaining: 1
            }
        );
        assert!(!es.early_stop());
        assert_eq!(es.record(0.6, 0.7, 0.6), EarlyStopDecision::Stop);
        assert!(es.early_stop());
        assert_eq!(es.epochs_seen(), 4);
        assert_eq!(es.best().unwrap().epoch, 2);
    }

    #[test]
    fn test_min_delta() {
        let mut es = EarlyStopping::new(3, 0.01);
        es.record(1.0, 0.5, 0.5);
        assert_ne!(es.record(1.0, 0.495, 0.5), EarlyStopDecision::NewBest);
        assert_eq!(es.best_loss(), Some(0.5));
        assert_eq!(es.record(1.0, 0.48, 0.5), EarlyStopDecision::NewBest);
        assert_eq!(es.counter(), 0);
    }

    #[test]
    fn test_nan_is_never_best() {
        let mut es = EarlyStopping::new(1, 0.0);
        assert_eq!(es.record(f64::NAN, f64::NAN, 0.0), EarlyStopDecision::Stop);
        assert!(es.best_loss().is_none());
    }

    struct FixedSession;

    #[async_trait]
    impl TrainingSession for FixedSession {
        async fn train_epoch(&mut self) -> Result<TrainReport, TuneError> {
            Ok(TrainReport {
                loss: 0.0,
                learning_rate: 0.0,
            })
        }

        async fn evaluate(&mut self) -> Result<EvalReport, TuneError> {
            Ok(EvalReport { loss: 0.0, acc: 0.0 })
        }

        async fn state_dict(&mut self) -> Result<SessionState, TuneError> {
            Ok(SessionState {
                model: b"weights".to_vec(),
                optim: b"adam".to_vec(),
            })
        }

        async fn load_state_dict(&mut self, _state: &SessionState) -> Result<(), TuneError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_observe_writes_snapshot_on_best() {
        let dir = TempDir::new().unwrap();
        let mut es = EarlyStopping::new(2, 0.0).with_snapshot_dir(dir.path().to_path_buf());
        let mut session = FixedSession;

        es.observe(0.9, 0.7, 0.6, &mut session).await.unwrap();
        es.observe(0.8, 0.8, 0.7, &mut session).await.unwrap();

        let score: BestScore = crate::persistence::load_json(&dir.path().join(BEST_SCORE_FILE))
            .unwrap()
            .unwrap();
        assert_eq!(score.epoch, 1);
        assert_eq!(score.valid_loss, 0.7);
        let snapshot = score.snapshot.unwrap();
        assert!(snapshot.exists());
        let file = crate::training::checkpoint::read_checkpoint_file(&snapshot).unwrap();
        assert_eq!(file.state.model, b"weights".to_vec());
    }

    #[tokio::test]
    async fn test_observe_without_snapshot_dir_writes_nothing() {
        let mut es = EarlyStopping::new(2, 0.0);
        let decision = es.observe(0.9, 0.7, 0.6, &mut FixedSession).await.unwrap();
        assert_eq!(decision, EarlyStopDecision::NewBest);
        assert!(es.best().unwrap().snapshot.is_none());
    }
}
