//! Hyperparameter strategies: the store they are sampled from, the space that
//! defines them, and the merge that turns one into a run configuration.

pub mod merge;
pub mod space;
pub mod store;

pub use merge::update_args;
pub use space::StrategySpace;
pub use store::{NewStrategy, SampledStrategy, SqliteStrategyStore, StrategyStore};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a strategy in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Newly added; the pipeline has not been checked yet.
    Ready,
    /// Pipeline check in progress.
    Debugging,
    /// Pipeline check passed; eligible for full training.
    Runnable,
    Running,
    Done,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Debugging => "DEBUGGING",
            Self::Runnable => "RUNNABLE",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    /// Whether a sampled strategy with this status only needs a smoke test.
    pub fn needs_pipeline_check(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "READY" => Ok(Self::Ready),
            "DEBUGGING" => Ok(Self::Debugging),
            "RUNNABLE" => Ok(Self::Runnable),
            "RUNNING" => Ok(Self::Running),
            "DONE" => Ok(Self::Done),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown strategy status '{other}'")),
        }
    }
}

/// One concrete hyperparameter assignment to try.
///
/// `name` selects an entry of the strategy space; `params` are per-entry
/// overrides applied on top of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub id: i64,
    pub name: String,
    pub dataset_idx: usize,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_roundtrip() {
        for status in [
            Status::Ready,
            Status::Debugging,
            Status::Runnable,
            Status::Running,
            Status::Done,
            Status::Failed,
        ] {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert_eq!("ready".parse::<Status>().unwrap(), Status::Ready);
        assert!("paused".parse::<Status>().is_err());
    }

    #[test]
    fn test_only_ready_needs_pipeline_check() {
        assert!(Status::Ready.needs_pipeline_check());
        assert!(!Status::Runnable.needs_pipeline_check());
    }
}
