//! Scheduler-mediated training: population-based training with a shared
//! stopping predicate.

pub mod latch;
pub mod mutation;
pub mod pbt;
pub mod stopper;

pub use latch::StopLatch;
pub use mutation::{Explorer, Perturbation};
pub use pbt::{PopulationBasedTraining, TrialSummary, TuneSummary};
pub use stopper::{TrialResult, TrialStopper};
