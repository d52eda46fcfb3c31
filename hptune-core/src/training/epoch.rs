//! The training loop: one train epoch plus one evaluation pass per iteration.

use super::backend::TrainingSession;
use super::early_stopping::{BestScore, EarlyStopDecision, EarlyStopping};
use super::tracker::{IterationMetrics, MetricsTracker, log_best_effort};
use crate::error::TuneError;
use crate::run_config::RunConfig;
use serde::Serialize;
use tracing::info;

/// Train for one epoch and evaluate once.
pub async fn run_iteration(
    session: &mut dyn TrainingSession,
    iteration: usize,
) -> Result<IterationMetrics, TuneError> {
    let train = session.train_epoch().await?;
    let eval = session.evaluate().await?;
    Ok(IterationMetrics {
        iteration,
        valid_loss: eval.loss,
        valid_acc: eval.acc,
        train_loss: train.loss,
        learning_rate: train.learning_rate,
    })
}

/// Summary of a direct (non-scheduled) training run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingOutcome {
    pub epochs_run: usize,
    pub stopped_early: bool,
    pub best: Option<BestScore>,
    pub history: Vec<IterationMetrics>,
}

/// Train until early stopping fires or the epoch budget is spent.
pub async fn run_training(
    config: &RunConfig,
    session: &mut dyn TrainingSession,
    tracker: &dyn MetricsTracker,
) -> Result<TrainingOutcome, TuneError> {
    let mut early_stopping = EarlyStopping::from_config(config);
    let mut history = Vec::with_capacity(config.epochs);

    for epoch in 1..=config.epochs {
        let metrics = run_iteration(session, epoch).await?;
        let decision = early_stopping
            .observe(
                metrics.train_loss,
                metrics.valid_loss,
                metrics.valid_acc,
                session,
            )
            .await?;
        log_best_effort(tracker, &config.base_name, &metrics);

        info!(
            run = %config.base_name,
            epoch,
            train_loss = metrics.train_loss,
            valid_loss = metrics.valid_loss,
            valid_acc = metrics.valid_acc,
            "Epoch finished"
        );
        history.push(metrics);

        if decision == EarlyStopDecision::Stop {
            break;
        }
    }

    Ok(TrainingOutcome {
        epochs_run: history.len(),
        stopped_early: early_stopping.early_stop(),
        best: early_stopping.best().cloned(),
        history,
    })
}
