//! Training backend that drives a model living in a worker process.
//!
//! The worker reads one JSON request per line on stdin and answers with one
//! JSON line on stdout: `{"ok": true, ...}` or `{"ok": false, "error": "..."}`.
//! Its stderr is inherited so tracebacks show up next to our logs.
//!
//! | op                | payload              | reply fields            |
//! |-------------------|----------------------|-------------------------|
//! | `init`            | `config`             |                         |
//! | `train_epoch`     |                      | `loss`, `learning_rate` |
//! | `evaluate`        |                      | `loss`, `acc`           |
//! | `state_dict`      |                      | `model`, `optim`        |
//! | `load_state_dict` | `state`              |                         |
//! | `debug`           | `config`, `strategy` |                         |
//! | `empty_cache`     |                      |                         |
//! | `shutdown`        |                      |                         |

use super::backend::{EvalReport, SessionState, TrainReport, TrainingBackend, TrainingSession};
use crate::config::WorkerConfig;
use crate::error::TuneError;
use crate::run_config::RunConfig;
use crate::strategy::Strategy;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum WorkerRequest<'a> {
    Init {
        config: &'a RunConfig,
    },
    TrainEpoch,
    Evaluate,
    StateDict,
    LoadStateDict {
        state: &'a SessionState,
    },
    Debug {
        config: &'a RunConfig,
        strategy: &'a Strategy,
    },
    EmptyCache,
    Shutdown,
}

impl WorkerRequest<'_> {
    fn op(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::TrainEpoch => "train_epoch",
            Self::Evaluate => "evaluate",
            Self::StateDict => "state_dict",
            Self::LoadStateDict { .. } => "load_state_dict",
            Self::Debug { .. } => "debug",
            Self::EmptyCache => "empty_cache",
            Self::Shutdown => "shutdown",
        }
    }
}

/// One running worker process.
struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    timeout: Duration,
}

impl WorkerProcess {
    async fn spawn(config: &WorkerConfig) -> Result<Self, TuneError> {
        let program = program_path(config);
        let mut command = Command::new(&program);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            TuneError::worker(format!("failed to spawn {}: {e}", program.display()))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TuneError::worker("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TuneError::worker("worker stdout unavailable"))?;

        debug!(program = %program.display(), pid = ?child.id(), "Spawned training worker");

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            timeout: config.request_timeout(),
        })
    }

    async fn request<T: DeserializeOwned>(
        &mut self,
        request: &WorkerRequest<'_>,
    ) -> Result<T, TuneError> {
        let op = request.op();
        let mut line = serde_json::to_string(request)?;
        line.push('\n');

        let timeout = self.timeout;
        let stdin = &mut self.stdin;
        let stdout = &mut self.stdout;
        let exchange = async move {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await?;
            stdout.next_line().await
        };

        let reply = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(Some(reply))) => reply,
            Ok(Ok(None)) => {
                return Err(TuneError::worker(format!(
                    "worker exited before replying to '{op}'"
                )));
            }
            Ok(Err(e)) => {
                return Err(TuneError::worker(format!("pipe error during '{op}': {e}")));
            }
            Err(_) => {
                return Err(TuneError::Timeout(format!(
                    "worker did not answer '{op}' within {}s",
                    timeout.as_secs()
                )));
            }
        };

        parse_reply(op, &reply)
    }

    async fn shutdown(mut self) {
        if let Err(e) = self.request::<IgnoredAny>(&WorkerRequest::Shutdown).await {
            debug!(error = %e, "Worker did not acknowledge shutdown");
        }
        match tokio::time::timeout(Duration::from_secs(10), self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Training worker exited"),
            _ => {
                warn!("Training worker did not exit, killing it");
                let _ = self.child.kill().await;
            }
        }
    }
}

fn program_path(config: &WorkerConfig) -> PathBuf {
    match &config.venv_path {
        Some(venv) => {
            let bin_dir = if cfg!(windows) { "Scripts" } else { "bin" };
            let name = config
                .program
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| config.program.clone());
            venv.join(bin_dir).join(name)
        }
        None => config.program.clone(),
    }
}

fn parse_reply<T: DeserializeOwned>(op: &str, reply: &str) -> Result<T, TuneError> {
    let value: serde_json::Value = serde_json::from_str(reply.trim())
        .map_err(|e| TuneError::worker(format!("invalid reply to '{op}': {e}")))?;

    if value.get("ok").and_then(serde_json::Value::as_bool) != Some(true) {
        let message = value
            .get("error")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("no error message");
        return Err(TuneError::worker(format!("'{op}' failed: {message}")));
    }

    serde_json::from_value(value)
        .map_err(|e| TuneError::worker(format!("unexpected reply to '{op}': {e}")))
}

/// Backend that starts one worker process per session.
pub struct WorkerBackend {
    config: WorkerConfig,
}

impl WorkerBackend {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TrainingBackend for WorkerBackend {
    async fn prepare(&self, config: &RunConfig) -> Result<Box<dyn TrainingSession>, TuneError> {
        let mut process = WorkerProcess::spawn(&self.config).await?;
        process
            .request::<IgnoredAny>(&WorkerRequest::Init { config })
            .await?;
        Ok(Box::new(WorkerSession { process }))
    }

    async fn debug(&self, config: &RunConfig, strategy: &Strategy) -> Result<(), TuneError> {
        let mut process = WorkerProcess::spawn(&self.config).await?;
        let result = process
            .request::<IgnoredAny>(&WorkerRequest::Debug { config, strategy })
            .await;
        if let Err(e) = process
            .request::<IgnoredAny>(&WorkerRequest::EmptyCache)
            .await
        {
            debug!(error = %e, "empty_cache after debug failed");
        }
        process.shutdown().await;
        // The worker started fine, so anything that went wrong is the pipeline's fault.
        result
            .map(|_| ())
            .map_err(|e| TuneError::pipeline(e.to_string()))
    }

    async fn release_accelerator_memory(&self) -> Result<(), TuneError> {
        // Each session owns its process; its memory goes away with it.
        debug!("No resident worker, nothing to release");
        Ok(())
    }
}

/// Session backed by a dedicated worker process, killed when dropped.
pub struct WorkerSession {
    process: WorkerProcess,
}

#[async_trait]
impl TrainingSession for WorkerSession {
    async fn train_epoch(&mut self) -> Result<TrainReport, TuneError> {
        self.process.request(&WorkerRequest::TrainEpoch).await
    }

    async fn evaluate(&mut self) -> Result<EvalReport, TuneError> {
        self.process.request(&WorkerRequest::Evaluate).await
    }

    async fn state_dict(&mut self) -> Result<SessionState, TuneError> {
        self.process.request(&WorkerRequest::StateDict).await
    }

    async fn load_state_dict(&mut self, state: &SessionState) -> Result<(), TuneError> {
        self.process
            .request::<IgnoredAny>(&WorkerRequest::LoadStateDict { state })
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_encoding() {
        let line = serde_json::to_value(WorkerRequest::TrainEpoch).unwrap();
        assert_eq!(line, json!({"op": "train_epoch"}));

        let state = SessionState {
            model: vec![1],
            optim: vec![],
        };
        let line = serde_json::to_value(WorkerRequest::LoadStateDict { state: &state }).unwrap();
        assert_eq!(
            line,
            json!({"op": "load_state_dict", "state": {"model": "AQ==", "optim": ""}})
        );
    }

    #[test]
    fn test_parse_reply_ok() {
        let report: EvalReport =
            parse_reply("evaluate", r#"{"ok": true, "loss": 0.42, "acc": 0.8}"#).unwrap();
        assert_eq!(report, EvalReport { loss: 0.42, acc: 0.8 });
    }

    #[test]
    fn test_parse_reply_error() {
        let err = parse_reply::<IgnoredAny>("init", r#"{"ok": false, "error": "CUDA OOM"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("CUDA OOM"));
    }

    #[test]
    fn test_parse_reply_garbage() {
        assert!(parse_reply::<IgnoredAny>("init", "Traceback (most recent call last)").is_err());
        assert!(parse_reply::<EvalReport>("evaluate", r#"{"ok": true}"#).is_err());
    }

    #[test]
    fn test_program_path_in_venv() {
        let config = WorkerConfig {
            venv_path: Some(PathBuf::from("/opt/venv")),
            ..Default::default()
        };
        let expected = if cfg!(windows) {
            PathBuf::from("/opt/venv/Scripts/python3")
        } else {
            PathBuf::from("/opt/venv/bin/python3")
        };
        assert_eq!(program_path(&config), expected);
        assert_eq!(
            program_path(&WorkerConfig::default()),
            PathBuf::from("python3")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_is_worker_error() {
        let backend = WorkerBackend::new(WorkerConfig {
            program: PathBuf::from("/nonexistent/hptune-worker"),
            args: vec![],
            ..Default::default()
        });
        let err = match backend.prepare(&RunConfig::default()).await {
            Err(e) => e,
            Ok(_) => panic!("spawn should fail"),
        };
        assert!(matches!(err, TuneError::Worker(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_worker_session() {
        // A tiny line-oriented worker written in sh.
        let script = r#"
while IFS= read -r line; do
  case "$line" in
    *'"op":"train_epoch"'*) echo '{"ok":true,"loss":0.5,"learning_rate":0.0001}' ;;
    *'"op":"evaluate"'*) echo '{"ok":true,"loss":0.4,"acc":0.9}' ;;
    *'"op":"shutdown"'*) echo '{"ok":true}'; exit 0 ;;
    *) echo '{"ok":true}' ;;
  esac
done
"#;
        let backend = WorkerBackend::new(WorkerConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            request_timeout_secs: 10,
            ..Default::default()
        });

        let mut session = backend.prepare(&RunConfig::default()).await.unwrap();
        let train = session.train_epoch().await.unwrap();
        assert_eq!(train.loss, 0.5);
        let eval = session.evaluate().await.unwrap();
        assert_eq!(eval.acc, 0.9);
    }
}
