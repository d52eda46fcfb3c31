//! In-process population-based training.
//!
//! A fixed population of trials trains in lock-step rounds. After each round
//! every trial reports a [`TrialResult`] and saves a checkpoint; the shared
//! [`TrialStopper`] decides which trials are finished. Every
//! `perturbation_interval` rounds the worst trials (by validation loss) are
//! replaced by a perturbed copy of a random top trial, resumed from that
//! trial's latest checkpoint.

use super::latch::StopLatch;
use super::mutation::{Explorer, Perturbation};
use super::stopper::{TrialResult, TrialStopper};
use crate::config::PbtConfig;
use crate::error::TuneError;
use crate::run_config::RunConfig;
use crate::training::backend::{TrainingBackend, TrainingSession};
use crate::training::checkpoint::CheckpointManager;
use crate::training::early_stopping::EarlyStopping;
use crate::training::epoch::run_iteration;
use crate::training::tracker::{MetricsTracker, log_best_effort, start_best_effort};
use futures::future::try_join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

struct Trial {
    id: String,
    config: RunConfig,
    session: Box<dyn TrainingSession>,
    early_stopping: EarlyStopping,
    iteration: usize,
    last: Option<TrialResult>,
    stopped: bool,
    exploits: usize,
}

impl Trial {
    fn new(id: String, config: RunConfig, session: Box<dyn TrainingSession>) -> Self {
        let early_stopping = EarlyStopping::from_config(&config);
        Self {
            id,
            config,
            session,
            early_stopping,
            iteration: 0,
            last: None,
            stopped: false,
            exploits: 0,
        }
    }

    /// One training iteration: train, evaluate, log, checkpoint.
    async fn step(
        &mut self,
        checkpoints: &CheckpointManager,
        tracker: &dyn MetricsTracker,
    ) -> Result<TrialResult, TuneError> {
        self.iteration += 1;
        let metrics = run_iteration(self.session.as_mut(), self.iteration).await?;
        self.early_stopping
            .observe(
                metrics.train_loss,
                metrics.valid_loss,
                metrics.valid_acc,
                self.session.as_mut(),
            )
            .await?;
        log_best_effort(tracker, &self.id, &metrics);

        let state = self.session.state_dict().await?;
        checkpoints.save(&self.id, self.iteration, metrics.valid_loss, &state)?;

        let result = TrialResult {
            trial_id: self.id.clone(),
            training_iteration: self.iteration,
            valid_loss: metrics.valid_loss,
            valid_acc: metrics.valid_acc,
            train_loss: metrics.train_loss,
        };
        debug!(
            trial = %self.id,
            iteration = self.iteration,
            valid_loss = result.valid_loss,
            valid_acc = result.valid_acc,
            "Trial reported"
        );
        self.last = Some(result.clone());
        Ok(result)
    }

    fn last_loss(&self) -> Option<f64> {
        self.last.as_ref().map(|r| r.valid_loss)
    }
}

/// Final state of one trial.
#[derive(Debug, Clone, Serialize)]
pub struct TrialSummary {
    pub trial_id: String,
    pub iterations: usize,
    pub exploits: usize,
    pub last: Option<TrialResult>,
    pub best_valid_loss: Option<f64>,
    pub save_path: PathBuf,
    pub config: RunConfig,
}

/// Outcome of a whole experiment.
#[derive(Debug, Clone, Serialize)]
pub struct TuneSummary {
    pub experiment: String,
    pub rounds: usize,
    pub stopped_all: bool,
    pub trials: Vec<TrialSummary>,
    /// Trial with the lowest final validation loss.
    pub best_trial: Option<String>,
}

impl TuneSummary {
    pub fn best(&self) -> Option<&TrialSummary> {
        let id = self.best_trial.as_deref()?;
        self.trials.iter().find(|t| t.trial_id == id)
    }

    /// Where the best trial wrote its best-model snapshot.
    pub fn best_save_path(&self) -> Option<&PathBuf> {
        self.best().map(|t| &t.save_path)
    }
}

/// Population-based training scheduler.
pub struct PopulationBasedTraining {
    config: PbtConfig,
    latch: Arc<StopLatch>,
}

impl PopulationBasedTraining {
    pub fn new(config: PbtConfig) -> Self {
        Self {
            config,
            latch: Arc::new(StopLatch::new()),
        }
    }

    /// Share an existing stop latch instead of a fresh one.
    pub fn with_latch(mut self, latch: Arc<StopLatch>) -> Self {
        self.latch = latch;
        self
    }

    pub fn latch(&self) -> &Arc<StopLatch> {
        &self.latch
    }

    pub fn config(&self) -> &PbtConfig {
        &self.config
    }

    /// Train a population for `base` until every trial is stopped.
    pub async fn run(
        &self,
        base: &RunConfig,
        backend: &dyn TrainingBackend,
        tracker: &dyn MetricsTracker,
    ) -> Result<TuneSummary, TuneError> {
        if self.config.num_samples == 0 {
            return Err(TuneError::config("pbt.num_samples must be at least 1"));
        }
        let interval = self.config.perturbation_interval.max(1);
        let explorer = Explorer::new(
            self.config.mutations.clone(),
            self.config.resample_probability,
        )?;
        let mut rng = StdRng::seed_from_u64(self.config.seed.unwrap_or(base.seed));
        let checkpoints = CheckpointManager::new(
            self.config
                .checkpoint_dir
                .join(&self.config.experiment_name)
                .join(&base.base_name),
            self.config.keep_checkpoints_num,
        );
        let stopper = TrialStopper::new(Arc::clone(&self.latch), base.epochs)
            .with_accuracy_threshold(self.config.stop_accuracy);

        let mut trials = Vec::with_capacity(self.config.num_samples);
        for index in 0..self.config.num_samples {
            let id = format!("{}_{index:05}", self.config.experiment_name);
            let mut config = explorer.fill_missing(base, &mut rng)?;
            config.save_path = base.save_path.join(&id);
            start_best_effort(tracker, &id, &config);
            let session = backend.prepare(&config).await?;
            trials.push(Trial::new(id, config, session));
        }

        info!(
            experiment = %self.config.experiment_name,
            run = %base.base_name,
            trials = trials.len(),
            epochs = base.epochs,
            "Starting population-based training"
        );

        let checkpoints = &checkpoints;
        let stopper = &stopper;
        let mut rounds = 0;
        loop {
            let active: Vec<&mut Trial> = trials.iter_mut().filter(|t| !t.stopped).collect();
            if active.is_empty() {
                break;
            }
            rounds += 1;

            let results = try_join_all(
                active
                    .into_iter()
                    .map(|trial| async move {
                        let result = trial.step(checkpoints, tracker).await?;
                        if stopper.should_stop(&trial.id, &result) {
                            trial.stopped = true;
                        }
                        Ok::<_, TuneError>(result)
                    }),
            )
            .await?;

            if stopper.stop_all() {
                info!(round = rounds, "Stopping every trial");
                for trial in &mut trials {
                    trial.stopped = true;
                }
                break;
            }

            if rounds % interval == 0 {
                self.perturb(&mut trials, &explorer, checkpoints, backend, &mut rng)
                    .await?;
            }

            debug!(round = rounds, reported = results.len(), "Round finished");
        }

        let summary = summarize(&self.config.experiment_name, rounds, stopper.stop_all(), trials);
        info!(
            experiment = %summary.experiment,
            rounds = summary.rounds,
            best = ?summary.best_trial,
            stopped_all = summary.stopped_all,
            "Population-based training finished"
        );
        Ok(summary)
    }

    /// Exploit and explore: every bottom-quantile trial still running restarts
    /// from a random top-quantile trial with perturbed hyperparameters.
    async fn perturb(
        &self,
        trials: &mut [Trial],
        explorer: &Explorer,
        checkpoints: &CheckpointManager,
        backend: &dyn TrainingBackend,
        rng: &mut StdRng,
    ) -> Result<(), TuneError> {
        let losses: Vec<Option<f64>> = trials.iter().map(Trial::last_loss).collect();
        let (bottom, top) = quantiles(&losses, self.config.quantile_fraction);
        if bottom.is_empty() || top.is_empty() {
            return Ok(());
        }

        for index in bottom {
            if trials[index].stopped {
                continue;
            }
            let donor = top[rng.gen_range(0..top.len())];
            let donor_id = trials[donor].id.clone();
            let Some(record) = checkpoints.latest(&donor_id)? else {
                continue;
            };
            let checkpoint = checkpoints.load(&record)?;
            let (mut config, changes) = explorer.explore(&trials[donor].config, rng)?;

            let trial = &mut trials[index];
            config.save_path = trial.config.save_path.clone();
            let mut session = backend.prepare(&config).await?;
            session.load_state_dict(&checkpoint.state).await?;

            log_perturbation(&trial.id, &donor_id, checkpoint.step, &changes);
            trial.session = session;
            trial.early_stopping = EarlyStopping::from_config(&config);
            trial.config = config;
            trial.iteration = checkpoint.step;
            trial.exploits += 1;
        }
        Ok(())
    }
}

/// Indices of the (bottom, top) quantiles by validation loss. Trials that
/// have not reported yet are not ranked.
///
/// Each quantile holds `ceil(n * fraction)` trials but never more than half
/// of the ranked population.
fn quantiles(losses: &[Option<f64>], fraction: f64) -> (Vec<usize>, Vec<usize>) {
    let mut ranked: Vec<(usize, f64)> = losses
        .iter()
        .enumerate()
        .filter_map(|(i, loss)| loss.map(|loss| (i, loss)))
        .collect();
    // Worst (highest loss) first.
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    let n = ranked.len();
    let mut size = (n as f64 * fraction).ceil() as usize;
    if size > n / 2 {
        size = n / 2;
    }

    let bottom = ranked[..size].iter().map(|(i, _)| *i).collect();
    let top = ranked[n - size..].iter().map(|(i, _)| *i).collect();
    (bottom, top)
}

fn log_perturbation(trial: &str, donor: &str, step: usize, changes: &[Perturbation]) {
    let changes: Vec<String> = changes
        .iter()
        .map(|c| match c.from {
            Some(from) if !c.resampled => format!("{}: {from} -> {}", c.path, c.to),
            _ => format!("{}: resampled {}", c.path, c.to),
        })
        .collect();
    info!(
        trial = %trial,
        donor = %donor,
        step,
        changes = ?changes,
        "Exploited donor checkpoint"
    );
}

fn summarize(experiment: &str, rounds: usize, stopped_all: bool, trials: Vec<Trial>) -> TuneSummary {
    let best_trial = trials
        .iter()
        .filter_map(|t| t.last_loss().map(|loss| (t, loss)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(t, _)| t.id.clone());

    let trials = trials
        .into_iter()
        .map(|t| TrialSummary {
            best_valid_loss: t.early_stopping.best_loss(),
            trial_id: t.id,
            iterations: t.iteration,
            exploits: t.exploits,
            last: t.last,
            save_path: t.config.save_path.clone(),
            config: t.config,
        })
        .collect();

    TuneSummary {
        experiment: experiment.to_string(),
        rounds,
        stopped_all,
        trials,
        best_trial,
    }
}
