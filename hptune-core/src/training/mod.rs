//! Training infrastructure: the model seam, the worker backend, the epoch
//! loop, early stopping, checkpoints and metric tracking.

pub mod backend;
pub mod checkpoint;
pub mod early_stopping;
pub mod epoch;
pub mod tracker;
pub mod worker;

pub use backend::{EvalReport, SessionState, TrainReport, TrainingBackend, TrainingSession};
pub use checkpoint::CheckpointManager;
pub use early_stopping::{EarlyStopDecision, EarlyStopping};
pub use epoch::{TrainingOutcome, run_iteration, run_training};
pub use tracker::{IterationMetrics, JsonlTracker, MetricsTracker, NullTracker};
pub use worker::WorkerBackend;
