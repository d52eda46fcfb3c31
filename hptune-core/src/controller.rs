//! The run controller: sample a strategy, smoke-test or train it, repeat.
//!
//! Each step starts in [`ControllerState::Sampling`]. A strategy that still
//! needs its pipeline check goes through [`ControllerState::Debugging`] and
//! never trains; any other strategy goes through
//! [`ControllerState::Training`] exactly once, directly or under
//! population-based training, before the controller samples again.

use crate::config::{ControllerConfig, PbtConfig, TuneConfig};
use crate::error::TuneError;
use crate::notify::{
    LogNotifier, Notifier, failure_message, finished_message, format_error_chain,
    notifier_from_config, notify_best_effort, started_message,
};
use crate::run_config::RunConfig;
use crate::strategy::store::{SampledStrategy, SqliteStrategyStore, StrategyStore};
use crate::strategy::{Status, StrategySpace, update_args};
use crate::submit::{BestScoreSubmitter, Submitter};
use crate::training::backend::TrainingBackend;
use crate::training::epoch::run_training;
use crate::training::tracker::{JsonlTracker, MetricsTracker, NullTracker, start_best_effort};
use crate::training::worker::WorkerBackend;
use crate::tune::pbt::PopulationBasedTraining;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerState {
    Sampling,
    Debugging,
    Training,
}

/// How many sampling steps the controller may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationSource {
    Unbounded,
    Bounded(usize),
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub iterations: IterationSource,
    /// Wait between polls of an empty store.
    pub idle_poll: Duration,
    /// End the loop instead of polling when nothing is eligible.
    pub stop_when_exhausted: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::from_config(&ControllerConfig::default())
    }
}

impl ControllerOptions {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            iterations: config
                .max_iterations
                .map_or(IterationSource::Unbounded, IterationSource::Bounded),
            idle_poll: Duration::from_secs(config.idle_poll_secs),
            stop_when_exhausted: config.stop_when_exhausted,
        }
    }
}

/// How the training phase runs.
#[derive(Debug, Clone)]
pub enum DriveMode {
    /// One synchronous training loop per strategy.
    Direct,
    /// A fresh population-based training experiment per strategy.
    Scheduled(PbtConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepOutcome {
    Debugged { ok: bool },
    Trained,
    Idle,
    Exhausted,
}

/// Counters over a whole controller run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ControllerReport {
    pub steps: usize,
    pub debugged: usize,
    pub debug_failures: usize,
    pub trained: usize,
    pub idle: usize,
    pub exhausted: bool,
}

impl ControllerReport {
    fn record(&mut self, outcome: StepOutcome) {
        self.steps += 1;
        match outcome {
            StepOutcome::Debugged { ok } => {
                self.debugged += 1;
                if !ok {
                    self.debug_failures += 1;
                }
            }
            StepOutcome::Trained => self.trained += 1,
            StepOutcome::Idle => self.idle += 1,
            StepOutcome::Exhausted => self.exhausted = true,
        }
    }
}

pub struct RunController {
    store: Arc<dyn StrategyStore>,
    backend: Arc<dyn TrainingBackend>,
    notifier: Arc<dyn Notifier>,
    tracker: Arc<dyn MetricsTracker>,
    submitter: Option<Arc<dyn Submitter>>,
    space_path: PathBuf,
    base: RunConfig,
    options: ControllerOptions,
    state: ControllerState,
    steps: usize,
    exhausted: bool,
}

pub struct RunControllerBuilder {
    base: RunConfig,
    space_path: PathBuf,
    store: Option<Arc<dyn StrategyStore>>,
    backend: Option<Arc<dyn TrainingBackend>>,
    notifier: Option<Arc<dyn Notifier>>,
    tracker: Option<Arc<dyn MetricsTracker>>,
    submitter: Option<Arc<dyn Submitter>>,
    options: ControllerOptions,
}

impl RunControllerBuilder {
    pub fn store(mut self, store: Arc<dyn StrategyStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn TrainingBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn tracker(mut self, tracker: Arc<dyn MetricsTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn submitter(mut self, submitter: Arc<dyn Submitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    pub fn options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    /// A store and a backend are required; notifications default to the
    /// log, tracking to nothing, and submission is off unless set.
    pub fn build(self) -> Result<RunController, TuneError> {
        let store = self
            .store
            .ok_or_else(|| TuneError::config("run controller needs a strategy store"))?;
        let backend = self
            .backend
            .ok_or_else(|| TuneError::config("run controller needs a training backend"))?;
        Ok(RunController {
            store,
            backend,
            notifier: self.notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
            tracker: self.tracker.unwrap_or_else(|| Arc::new(NullTracker)),
            submitter: self.submitter,
            space_path: self.space_path,
            base: self.base,
            options: self.options,
            state: ControllerState::Sampling,
            steps: 0,
            exhausted: false,
        })
    }
}

impl RunController {
    pub fn builder(base: RunConfig, space_path: PathBuf) -> RunControllerBuilder {
        RunControllerBuilder {
            base,
            space_path,
            store: None,
            backend: None,
            notifier: None,
            tracker: None,
            submitter: None,
            options: ControllerOptions::default(),
        }
    }

    /// Wire the production collaborators from configuration. Paths are used
    /// as given; see [`TuneConfig::resolve_paths`].
    pub fn from_config(config: &TuneConfig) -> Result<Self, TuneError> {
        let store = SqliteStrategyStore::open(&config.store.path)?;
        let tracker: Arc<dyn MetricsTracker> = if config.tracker.enabled {
            Arc::new(JsonlTracker::new(
                config.tracker.dir.clone(),
                config.tracker.project.clone(),
            ))
        } else {
            Arc::new(NullTracker)
        };

        let mut builder = Self::builder(config.run.clone(), config.space.path.clone())
            .store(Arc::new(store))
            .backend(Arc::new(WorkerBackend::new(config.worker.clone())))
            .notifier(Arc::from(notifier_from_config(&config.notify)?))
            .tracker(tracker)
            .options(ControllerOptions::from_config(&config.controller));
        if config.submit.enabled {
            builder = builder.submitter(Arc::new(BestScoreSubmitter::from_config(&config.submit)));
        }
        builder.build()
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        Arc::clone(&self.notifier)
    }

    /// Whether another sampling step is allowed.
    pub fn should_continue(&self) -> bool {
        if self.exhausted {
            return false;
        }
        match self.options.iterations {
            IterationSource::Unbounded => true,
            IterationSource::Bounded(limit) => self.steps < limit,
        }
    }

    /// One pass through the state machine, from sampling back to sampling.
    pub async fn step(&mut self, mode: &DriveMode) -> Result<StepOutcome, TuneError> {
        self.state = ControllerState::Sampling;
        self.steps += 1;

        let space = StrategySpace::load(&self.space_path)?;
        let Some(sampled) = self.store.sample().await? else {
            if self.options.stop_when_exhausted {
                info!("No eligible strategy left");
                self.exhausted = true;
                return Ok(StepOutcome::Exhausted);
            }
            info!(
                wait_secs = self.options.idle_poll.as_secs(),
                "No eligible strategy, waiting"
            );
            tokio::time::sleep(self.options.idle_poll).await;
            return Ok(StepOutcome::Idle);
        };

        let config = match update_args(&self.base, &sampled.strategy, &space) {
            Ok(config) => config,
            Err(e) => return Err(self.abandon(&sampled, e).await),
        };
        info!(
            strategy = %sampled.strategy.name,
            id = sampled.strategy.id,
            status = %sampled.status,
            attempts = sampled.attempts,
            run = %config.base_name,
            "Sampled strategy"
        );

        let result = if sampled.status.needs_pipeline_check() {
            self.debug_strategy(&sampled, &config).await
        } else {
            self.train_strategy(&sampled, &config, mode).await
        };
        self.state = ControllerState::Sampling;
        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.abandon(&sampled, e).await),
        }
    }

    async fn debug_strategy(
        &mut self,
        sampled: &SampledStrategy,
        config: &RunConfig,
    ) -> Result<StepOutcome, TuneError> {
        self.state = ControllerState::Debugging;
        let id = sampled.strategy.id;

        let ok = match self.backend.debug(config, &sampled.strategy).await {
            Ok(()) => {
                info!(strategy = %sampled.strategy.name, "Pipeline check passed");
                self.store.mark(id, Status::Runnable).await?;
                true
            }
            Err(TuneError::Pipeline(reason)) => {
                warn!(
                    strategy = %sampled.strategy.name,
                    reason = %reason,
                    "Pipeline check failed, moving on"
                );
                self.store.mark(id, Status::Failed).await?;
                false
            }
            Err(e) => {
                self.release_best_effort().await;
                return Err(e);
            }
        };

        self.backend.release_accelerator_memory().await?;
        Ok(StepOutcome::Debugged { ok })
    }

    async fn release_best_effort(&self) {
        if let Err(e) = self.backend.release_accelerator_memory().await {
            warn!(error = %e, "Could not release accelerator memory");
        }
    }

    async fn train_strategy(
        &mut self,
        sampled: &SampledStrategy,
        config: &RunConfig,
        mode: &DriveMode,
    ) -> Result<StepOutcome, TuneError> {
        self.state = ControllerState::Training;
        notify_best_effort(self.notifier.as_ref(), &started_message(&config.base_name)).await;

        let save_path = match mode {
            DriveMode::Direct => {
                start_best_effort(self.tracker.as_ref(), &config.base_name, config);
                let mut session = self.backend.prepare(config).await?;
                let outcome =
                    run_training(config, session.as_mut(), self.tracker.as_ref()).await?;
                info!(
                    run = %config.base_name,
                    epochs = outcome.epochs_run,
                    stopped_early = outcome.stopped_early,
                    best_valid_loss = ?outcome.best.as_ref().map(|b| b.valid_loss),
                    "Training finished"
                );
                config.save_path.clone()
            }
            DriveMode::Scheduled(pbt) => {
                let summary = PopulationBasedTraining::new(pbt.clone())
                    .run(config, self.backend.as_ref(), self.tracker.as_ref())
                    .await?;
                summary
                    .best_save_path()
                    .cloned()
                    .unwrap_or_else(|| config.save_path.clone())
            }
        };

        self.backend.release_accelerator_memory().await?;
        notify_best_effort(self.notifier.as_ref(), &finished_message(&config.base_name)).await;

        if let Some(submitter) = &self.submitter {
            submitter.submit_if_best(config, &save_path).await?;
        }
        self.store.mark(sampled.strategy.id, Status::Done).await?;
        self.backend.release_accelerator_memory().await?;
        Ok(StepOutcome::Trained)
    }

    /// Mark a strategy failed on the way out of a fatal error.
    async fn abandon(&self, sampled: &SampledStrategy, err: TuneError) -> TuneError {
        if let Err(mark_err) = self.store.mark(sampled.strategy.id, Status::Failed).await {
            warn!(
                id = sampled.strategy.id,
                error = %mark_err,
                "Could not mark strategy failed"
            );
        }
        err
    }

    /// Step until [`should_continue`](Self::should_continue) says stop.
    pub async fn run(&mut self, mode: &DriveMode) -> Result<ControllerReport, TuneError> {
        let mut report = ControllerReport::default();
        while self.should_continue() {
            match self.step(mode).await {
                Ok(outcome) => report.record(outcome),
                Err(e) if !e.is_fatal() => {
                    warn!(error = %e, "Recoverable error, continuing");
                    report.steps += 1;
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            steps = report.steps,
            trained = report.trained,
            debugged = report.debugged,
            "Run controller finished"
        );
        Ok(report)
    }

    pub async fn run_without_scheduler(&mut self) -> Result<ControllerReport, TuneError> {
        self.run(&DriveMode::Direct).await
    }

    pub async fn run_with_scheduler(
        &mut self,
        pbt: PbtConfig,
    ) -> Result<ControllerReport, TuneError> {
        self.run(&DriveMode::Scheduled(pbt)).await
    }
}

/// Top-level failure guard for an entry point.
///
/// On error the error chain is printed to stderr, logged and sent as exactly
/// one failure notification; the error is then returned unchanged.
pub async fn run_guarded<T, F>(notifier: &dyn Notifier, fut: F) -> Result<T, TuneError>
where
    F: Future<Output = Result<T, TuneError>>,
{
    match fut.await {
        Ok(value) => Ok(value),
        Err(e) => {
            let trace = format_error_chain(&e);
            eprintln!("{trace}");
            error!(error = %trace, "Run failed");
            notify_best_effort(notifier, &failure_message(&trace)).await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_config() {
        let options = ControllerOptions::from_config(&ControllerConfig {
            max_iterations: Some(3),
            idle_poll_secs: 5,
            stop_when_exhausted: true,
        });
        assert_eq!(options.iterations, IterationSource::Bounded(3));
        assert_eq!(options.idle_poll, Duration::from_secs(5));
        assert_eq!(
            ControllerOptions::default().iterations,
            IterationSource::Unbounded
        );
    }

    #[test]
    fn test_report_counts() {
        let mut report = ControllerReport::default();
        report.record(StepOutcome::Debugged { ok: true });
        report.record(StepOutcome::Debugged { ok: false });
        report.record(StepOutcome::Trained);
        report.record(StepOutcome::Idle);
        report.record(StepOutcome::Exhausted);
        assert_eq!(
            report,
            ControllerReport {
                steps: 5,
                debugged: 2,
                debug_failures: 1,
                trained: 1,
                idle: 1,
                exhausted: true,
            }
        );
    }

    #[test]
    fn test_builder_requires_store_and_backend() {
        let err = RunController::builder(RunConfig::default(), PathBuf::from("space.toml"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, TuneError::Config(_)));
    }
}
