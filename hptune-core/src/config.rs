//! Layered configuration for hptune.
//!
//! Defaults are overlaid by the user config, the workspace config
//! (`.hptune/config.toml`), an optional explicit file and finally `HPTUNE_`
//! environment variables (`HPTUNE_RUN__EPOCHS=3`, `HPTUNE_PBT__NUM_SAMPLES=2`).

use crate::run_config::RunConfig;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TuneConfig {
    /// Base run configuration every strategy is merged into.
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub space: SpaceConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub pbt: PbtConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub submit: SubmitConfig,
}

/// Strategy store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".hptune/strategies.db")
}

/// Strategy space file, re-read on every sampling step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceConfig {
    #[serde(default = "default_space_path")]
    pub path: PathBuf,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            path: default_space_path(),
        }
    }
}

fn default_space_path() -> PathBuf {
    PathBuf::from(".hptune/space.toml")
}

/// Training worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Interpreter or executable (resolved inside `venv_path` when set).
    #[serde(default = "default_worker_program")]
    pub program: PathBuf,
    #[serde(default)]
    pub venv_path: Option<PathBuf>,
    /// Arguments passed before the protocol starts, usually the worker script.
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Timeout for a single protocol request (one epoch can be long).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: default_worker_program(),
            venv_path: None,
            args: default_worker_args(),
            working_dir: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl WorkerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_worker_program() -> PathBuf {
    PathBuf::from("python3")
}

fn default_worker_args() -> Vec<String> {
    vec!["worker.py".to_string()]
}

fn default_request_timeout() -> u64 {
    6 * 3600
}

/// Run controller loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Stop after this many sampling steps. Unbounded when unset.
    #[serde(default)]
    pub max_iterations: Option<usize>,
    /// Sleep between polls when the store has nothing eligible.
    #[serde(default = "default_idle_poll")]
    pub idle_poll_secs: u64,
    /// End the loop instead of polling when the store is exhausted.
    #[serde(default)]
    pub stop_when_exhausted: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_iterations: None,
            idle_poll_secs: default_idle_poll(),
            stop_when_exhausted: false,
        }
    }
}

fn default_idle_poll() -> u64 {
    60
}

/// Population-based training settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PbtConfig {
    #[serde(default = "default_experiment_name")]
    pub experiment_name: String,
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,
    #[serde(default = "default_perturbation_interval")]
    pub perturbation_interval: usize,
    #[serde(default = "default_quantile_fraction")]
    pub quantile_fraction: f64,
    #[serde(default = "default_resample_probability")]
    pub resample_probability: f64,
    /// Checkpoints kept per trial, ranked by validation loss.
    #[serde(default = "default_keep_checkpoints")]
    pub keep_checkpoints_num: usize,
    /// Validation accuracy that stops the whole experiment.
    #[serde(default = "default_stop_accuracy")]
    pub stop_accuracy: f64,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_mutations")]
    pub mutations: Vec<MutationSpec>,
}

impl Default for PbtConfig {
    fn default() -> Self {
        Self {
            experiment_name: default_experiment_name(),
            num_samples: default_num_samples(),
            perturbation_interval: default_perturbation_interval(),
            quantile_fraction: default_quantile_fraction(),
            resample_probability: default_resample_probability(),
            keep_checkpoints_num: default_keep_checkpoints(),
            stop_accuracy: default_stop_accuracy(),
            checkpoint_dir: default_checkpoint_dir(),
            seed: None,
            mutations: default_mutations(),
        }
    }
}

/// A hyperparameter PBT may perturb, addressed by dotted path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationSpec {
    pub path: String,
    pub low: f64,
    pub high: f64,
}

fn default_experiment_name() -> String {
    "pbt_test".to_string()
}

fn default_num_samples() -> usize {
    4
}

fn default_perturbation_interval() -> usize {
    1
}

fn default_quantile_fraction() -> f64 {
    0.25
}

fn default_resample_probability() -> f64 {
    0.25
}

fn default_keep_checkpoints() -> usize {
    3
}

fn default_stop_accuracy() -> f64 {
    0.85
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".hptune/checkpoints")
}

fn default_mutations() -> Vec<MutationSpec> {
    vec![
        MutationSpec {
            path: "optimizer_hp.lr".to_string(),
            low: 0.0001,
            high: 0.0005,
        },
        MutationSpec {
            path: "weight_decay".to_string(),
            low: 0.001,
            high: 0.02,
        },
    ]
}

/// Notification channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Slack incoming-webhook URL. Notifications only go to the log when unset.
    #[serde(default)]
    pub slack_webhook_url: Option<String>,
}

/// Experiment tracker sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tracker_project")]
    pub project: String,
    #[serde(default = "default_tracker_dir")]
    pub dir: PathBuf,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            project: default_tracker_project(),
            dir: default_tracker_dir(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tracker_project() -> String {
    "p-stage-2".to_string()
}

fn default_tracker_dir() -> PathBuf {
    PathBuf::from(".hptune/runs")
}

/// Post-run submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_leaderboard_path")]
    pub leaderboard_path: PathBuf,
    #[serde(default = "default_submission_dir")]
    pub submission_dir: PathBuf,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            leaderboard_path: default_leaderboard_path(),
            submission_dir: default_submission_dir(),
        }
    }
}

fn default_leaderboard_path() -> PathBuf {
    PathBuf::from(".hptune/leaderboard.json")
}

fn default_submission_dir() -> PathBuf {
    PathBuf::from("submissions")
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "hptune", "hptune")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration with the standard layering.
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
) -> Result<TuneConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(TuneConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".hptune").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Box::new(figment::Error::from(format!(
                "config file {} does not exist",
                path.display()
            ))));
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("HPTUNE_").split("__"));

    figment.extract().map_err(Box::new)
}

impl TuneConfig {
    /// Anchor every relative path at `workspace`.
    pub fn resolve_paths(&mut self, workspace: &Path) {
        for path in [
            &mut self.store.path,
            &mut self.space.path,
            &mut self.pbt.checkpoint_dir,
            &mut self.tracker.dir,
            &mut self.submit.leaderboard_path,
            &mut self.submit.submission_dir,
            &mut self.run.output_dir,
            &mut self.run.save_path,
        ] {
            if path.is_relative() {
                *path = workspace.join(&*path);
            }
        }
    }
}

/// Whether a user-level or workspace-level config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if user_config_path().is_some_and(|p| p.exists()) {
        return true;
    }
    workspace.is_some_and(|ws| ws.join(".hptune").join("config.toml").exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = TuneConfig::default();
        assert_eq!(config.pbt.num_samples, 4);
        assert_eq!(config.pbt.keep_checkpoints_num, 3);
        assert!((config.pbt.stop_accuracy - 0.85).abs() < f64::EPSILON);
        assert_eq!(config.pbt.mutations.len(), 2);
        assert_eq!(config.run.epochs, 10);
        assert!(config.controller.max_iterations.is_none());
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = load_config(Some(dir.path()), Some(&dir.path().join("typo.toml"))).unwrap_err();
        assert!(err.to_string().contains("typo.toml"));
    }

    #[test]
    fn test_workspace_config_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg_dir = dir.path().join(".hptune");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            r#"
[run]
epochs = 5
patience = 2

[run.optimizer_hp]
lr = 0.0003

[pbt]
num_samples = 2

[controller]
stop_when_exhausted = true
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.run.epochs, 5);
        assert_eq!(config.run.patience, 2);
        assert_eq!(config.run.learning_rate(), Some(0.0003));
        // Untouched keys keep their defaults.
        assert_eq!(config.run.batch_size, 32);
        assert_eq!(config.pbt.num_samples, 2);
        assert!(config.controller.stop_when_exhausted);
        assert!(config_exists(Some(dir.path())));
    }

    #[test]
    fn test_explicit_file_wins_over_workspace() {
        let dir = TempDir::new().unwrap();
        let explicit = dir.path().join("custom.toml");
        std::fs::write(&explicit, "[pbt]\nnum_samples = 8\n").unwrap();

        let config = load_config(Some(dir.path()), Some(&explicit)).unwrap();
        assert_eq!(config.pbt.num_samples, 8);
    }

    #[test]
    fn test_resolve_paths() {
        let mut config = TuneConfig::default();
        config.submit.submission_dir = PathBuf::from("/srv/submissions");
        config.resolve_paths(Path::new("/work"));
        assert_eq!(config.store.path, PathBuf::from("/work/.hptune/strategies.db"));
        assert_eq!(config.run.output_dir, PathBuf::from("/work/results"));
        assert_eq!(config.submit.submission_dir, PathBuf::from("/srv/submissions"));
    }
}
