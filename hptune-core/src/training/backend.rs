//! The boundary to the model: whatever owns the network, tokenizer,
//! optimizer and data loaders implements these traits.

use crate::error::TuneError;
use crate::run_config::RunConfig;
use crate::strategy::Strategy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of one training epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainReport {
    pub loss: f64,
    pub learning_rate: f64,
}

/// Result of one evaluation pass over the validation set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub loss: f64,
    pub acc: f64,
}

/// Serialized model and optimizer state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(with = "base64_bytes")]
    pub model: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub optim: Vec<u8>,
}

/// Creates training sessions and runs pipeline checks.
#[async_trait]
pub trait TrainingBackend: Send + Sync {
    /// Load the model, tokenizer and data loaders for `config`.
    async fn prepare(&self, config: &RunConfig) -> Result<Box<dyn TrainingSession>, TuneError>;

    /// Cheap end-to-end check that `config` can train at all.
    async fn debug(&self, config: &RunConfig, strategy: &Strategy) -> Result<(), TuneError>;

    /// Drop cached accelerator allocations held by the backend.
    async fn release_accelerator_memory(&self) -> Result<(), TuneError>;
}

/// A loaded model with its optimizer and data loaders.
#[async_trait]
pub trait TrainingSession: Send {
    async fn train_epoch(&mut self) -> Result<TrainReport, TuneError>;

    async fn evaluate(&mut self) -> Result<EvalReport, TuneError>;

    async fn state_dict(&mut self) -> Result<SessionState, TuneError>;

    async fn load_state_dict(&mut self, state: &SessionState) -> Result<(), TuneError>;
}

pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
