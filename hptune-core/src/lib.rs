//! # hptune-core
//!
//! Hyperparameter search and training-run lifecycle management for a
//! text-classification model. The crate samples candidate strategies from a
//! persistent store, merges them into a run configuration, smoke-tests new
//! strategies, and trains the rest either directly or under in-process
//! population-based training. The model itself lives in an external worker
//! process behind the [`TrainingBackend`] seam.

pub mod config;
pub mod controller;
pub mod error;
pub mod notify;
pub mod persistence;
pub mod run_config;
pub mod strategy;
pub mod submit;
pub mod training;
pub mod tune;

// Re-export commonly used types at the crate root.
pub use config::{TuneConfig, load_config};
pub use controller::{
    ControllerOptions, ControllerReport, ControllerState, DriveMode, IterationSource,
    RunController, StepOutcome, run_guarded,
};
pub use error::TuneError;
pub use notify::{LogNotifier, Notifier, SlackWebhookNotifier};
pub use run_config::RunConfig;
pub use strategy::{Status, Strategy, StrategySpace, StrategyStore, update_args};
pub use submit::{BestScoreSubmitter, SubmitOutcome, Submitter};
pub use training::{
    EarlyStopping, MetricsTracker, TrainingBackend, TrainingSession, WorkerBackend,
};
pub use tune::{PopulationBasedTraining, StopLatch, TrialStopper};
