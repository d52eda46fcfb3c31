//! Experiment tracking: a best-effort sink for per-iteration scalars.

use crate::error::TuneError;
use crate::persistence::append_json_line;
use crate::run_config::RunConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// Scalars logged once per training iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationMetrics {
    pub iteration: usize,
    pub valid_loss: f64,
    pub valid_acc: f64,
    pub train_loss: f64,
    pub learning_rate: f64,
}

/// Sink for run metadata and metrics.
pub trait MetricsTracker: Send + Sync {
    fn start_run(&self, run_name: &str, config: &RunConfig) -> Result<(), TuneError>;

    fn log(&self, run_name: &str, metrics: &IterationMetrics) -> Result<(), TuneError>;
}

/// Log to the tracker, downgrading failures to a warning.
pub fn log_best_effort(tracker: &dyn MetricsTracker, run_name: &str, metrics: &IterationMetrics) {
    if let Err(e) = tracker.log(run_name, metrics) {
        warn!(run = %run_name, error = %e, "Experiment tracker rejected metrics");
    }
}

/// Start a tracked run, downgrading failures to a warning.
pub fn start_best_effort(tracker: &dyn MetricsTracker, run_name: &str, config: &RunConfig) {
    if let Err(e) = tracker.start_run(run_name, config) {
        warn!(run = %run_name, error = %e, "Experiment tracker could not start run");
    }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum TrackerEvent<'a> {
    Start {
        project: &'a str,
        run: &'a str,
        config: &'a RunConfig,
        at: DateTime<Utc>,
    },
    Metrics {
        project: &'a str,
        run: &'a str,
        metrics: &'a IterationMetrics,
        at: DateTime<Utc>,
    },
}

/// Appends one JSON line per event to `<dir>/<run_name>.jsonl`.
pub struct JsonlTracker {
    dir: PathBuf,
    project: String,
    write_lock: Mutex<()>,
}

impl JsonlTracker {
    pub fn new(dir: PathBuf, project: impl Into<String>) -> Self {
        Self {
            dir,
            project: project.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn run_file(&self, run_name: &str) -> PathBuf {
        let safe: String = run_name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }

    fn append(&self, run_name: &str, event: &TrackerEvent<'_>) -> Result<(), TuneError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| TuneError::training("tracker lock poisoned"))?;
        append_json_line(&self.run_file(run_name), event)?;
        Ok(())
    }
}

impl MetricsTracker for JsonlTracker {
    fn start_run(&self, run_name: &str, config: &RunConfig) -> Result<(), TuneError> {
        self.append(
            run_name,
            &TrackerEvent::Start {
                project: &self.project,
                run: run_name,
                config,
                at: Utc::now(),
            },
        )
    }

    fn log(&self, run_name: &str, metrics: &IterationMetrics) -> Result<(), TuneError> {
        self.append(
            run_name,
            &TrackerEvent::Metrics {
                project: &self.project,
                run: run_name,
                metrics,
                at: Utc::now(),
            },
        )
    }
}

/// Discards everything.
pub struct NullTracker;

impl MetricsTracker for NullTracker {
    fn start_run(&self, _run_name: &str, _config: &RunConfig) -> Result<(), TuneError> {
        Ok(())
    }

    fn log(&self, _run_name: &str, _metrics: &IterationMetrics) -> Result<(), TuneError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn metrics(iteration: usize) -> IterationMetrics {
        IterationMetrics {
            iteration,
            valid_loss: 0.5,
            valid_acc: 0.8,
            train_loss: 0.6,
            learning_rate: 1e-4,
        }
    }

    #[test]
    fn test_jsonl_tracker_writes_events() {
        let dir = TempDir::new().unwrap();
        let tracker = JsonlTracker::new(dir.path().to_path_buf(), "p-stage-2");
        tracker.start_run("st01_0", &RunConfig::default()).unwrap();
        tracker.log("st01_0", &metrics(1)).unwrap();
        tracker.log("st01_0", &metrics(2)).unwrap();

        let content = std::fs::read_to_string(dir.path().join("st01_0.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event"], "start");
        assert_eq!(lines[0]["config"]["seed"], 42);
        assert_eq!(lines[2]["event"], "metrics");
        assert_eq!(lines[2]["metrics"]["iteration"], 2);
        assert_eq!(lines[2]["metrics"]["valid_acc"], 0.8);
        assert_eq!(lines[2]["project"], "p-stage-2");
    }

    #[test]
    fn test_run_names_are_sanitized() {
        let tracker = JsonlTracker::new(PathBuf::from("/tmp/x"), "p");
        assert_eq!(
            tracker.run_file("klue/bert 1"),
            PathBuf::from("/tmp/x/klue_bert_1.jsonl")
        );
    }

    #[test]
    fn test_best_effort_swallows_errors() {
        struct Broken;
        impl MetricsTracker for Broken {
            fn start_run(&self, _: &str, _: &RunConfig) -> Result<(), TuneError> {
                Err(TuneError::training("offline"))
            }
            fn log(&self, _: &str, _: &IterationMetrics) -> Result<(), TuneError> {
                Err(TuneError::training("offline"))
            }
        }
        start_best_effort(&Broken, "run", &RunConfig::default());
        log_best_effort(&Broken, "run", &metrics(1));
    }
}
