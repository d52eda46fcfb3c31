//! Post-run submission of the best model.
//!
//! A finished run is submitted when its best validation accuracy beats every
//! earlier submission recorded on the local leaderboard.

use crate::config::SubmitConfig;
use crate::error::TuneError;
use crate::persistence::{atomic_write_json, load_json};
use crate::run_config::RunConfig;
use crate::training::early_stopping::{BEST_MODEL_DIR, BEST_SCORE_FILE, BestScore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SubmitOutcome {
    Submitted { path: PathBuf, valid_acc: f64 },
    NotBetter { best: f64, candidate: f64 },
    /// The run never recorded a best score.
    NoScore,
}

#[async_trait]
pub trait Submitter: Send + Sync {
    /// Submit the run saved under `save_path` if it is the best so far.
    async fn submit_if_best(
        &self,
        config: &RunConfig,
        save_path: &Path,
    ) -> Result<SubmitOutcome, TuneError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub base_name: String,
    pub valid_acc: f64,
    pub valid_loss: f64,
    pub path: PathBuf,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Leaderboard {
    pub best: Option<LeaderboardEntry>,
    #[serde(default)]
    pub history: Vec<LeaderboardEntry>,
}

/// Compares against a JSON leaderboard and copies winning snapshots into the
/// submission directory.
pub struct BestScoreSubmitter {
    leaderboard_path: PathBuf,
    submission_dir: PathBuf,
}

impl BestScoreSubmitter {
    pub fn new(leaderboard_path: PathBuf, submission_dir: PathBuf) -> Self {
        Self {
            leaderboard_path,
            submission_dir,
        }
    }

    pub fn from_config(config: &SubmitConfig) -> Self {
        Self::new(
            config.leaderboard_path.clone(),
            config.submission_dir.clone(),
        )
    }

    pub fn leaderboard(&self) -> Result<Leaderboard, TuneError> {
        Ok(load_json(&self.leaderboard_path)?.unwrap_or_default())
    }
}

#[async_trait]
impl Submitter for BestScoreSubmitter {
    async fn submit_if_best(
        &self,
        config: &RunConfig,
        save_path: &Path,
    ) -> Result<SubmitOutcome, TuneError> {
        let Some(score) = load_json::<BestScore>(&save_path.join(BEST_SCORE_FILE))? else {
            info!(run = %config.base_name, "No best score recorded, nothing to submit");
            return Ok(SubmitOutcome::NoScore);
        };

        let mut leaderboard = self.leaderboard()?;
        if let Some(best) = &leaderboard.best {
            if score.valid_acc <= best.valid_acc {
                info!(
                    run = %config.base_name,
                    candidate = score.valid_acc,
                    best = best.valid_acc,
                    "Not better than the current best submission"
                );
                return Ok(SubmitOutcome::NotBetter {
                    best: best.valid_acc,
                    candidate: score.valid_acc,
                });
            }
        }

        let source = save_path.join(BEST_MODEL_DIR);
        if !source.is_dir() {
            return Err(TuneError::submission(format!(
                "best score without a model snapshot at {}",
                source.display()
            )));
        }
        let target = self.submission_dir.join(&config.base_name);
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        copy_dir(&source, &target)?;
        std::fs::copy(
            save_path.join(BEST_SCORE_FILE),
            target.join(BEST_SCORE_FILE),
        )?;

        let entry = LeaderboardEntry {
            base_name: config.base_name.clone(),
            valid_acc: score.valid_acc,
            valid_loss: score.valid_loss,
            path: target.clone(),
            submitted_at: Utc::now(),
        };
        leaderboard.history.push(entry.clone());
        leaderboard.best = Some(entry);
        atomic_write_json(&self.leaderboard_path, &leaderboard)?;

        info!(
            run = %config.base_name,
            valid_acc = score.valid_acc,
            path = %target.display(),
            "Submitted new best model"
        );
        Ok(SubmitOutcome::Submitted {
            path: target,
            valid_acc: score.valid_acc,
        })
    }
}

fn copy_dir(source: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let dest = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), dest)?;
        }
    }
    Ok(())
}
