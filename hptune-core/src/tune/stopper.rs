//! Stopping predicate for scheduled trials.

use super::latch::StopLatch;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Accuracy above which the whole experiment stops.
pub const DEFAULT_STOP_ACCURACY: f64 = 0.85;

/// What a trial reports after each iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial_id: String,
    pub training_iteration: usize,
    pub valid_loss: f64,
    pub valid_acc: f64,
    pub train_loss: f64,
}

/// Stops a trial once it has used its epoch budget, and every trial once any
/// of them clears the accuracy threshold.
#[derive(Debug, Clone)]
pub struct TrialStopper {
    latch: Arc<StopLatch>,
    epochs: usize,
    accuracy_threshold: f64,
}

impl TrialStopper {
    pub fn new(latch: Arc<StopLatch>, epochs: usize) -> Self {
        Self {
            latch,
            epochs,
            accuracy_threshold: DEFAULT_STOP_ACCURACY,
        }
    }

    pub fn with_accuracy_threshold(mut self, threshold: f64) -> Self {
        self.accuracy_threshold = threshold;
        self
    }

    pub fn should_stop(&self, trial_id: &str, result: &TrialResult) -> bool {
        if result.valid_acc > self.accuracy_threshold && self.latch.try_latch() {
            info!(
                trial = %trial_id,
                valid_acc = result.valid_acc,
                threshold = self.accuracy_threshold,
                "Accuracy threshold reached, stopping all trials"
            );
        }
        self.latch.is_latched() || result.training_iteration >= self.epochs
    }

    pub fn stop_all(&self) -> bool {
        self.latch.is_latched()
    }
}
