//! Strategy space: named hyperparameter overrides read from a TOML file.
//!
//! ```toml
//! [strategies.st01]
//! model_name = "xlm-roberta-large"
//! weight_decay = 0.01
//! optimizer_hp = { lr = 5e-5 }
//! ```

use crate::error::TuneError;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Immutable snapshot of the strategy space file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StrategySpace {
    #[serde(default)]
    strategies: BTreeMap<String, Map<String, Value>>,
}

impl StrategySpace {
    /// Read the space file. Called once per sampling step so edits made while
    /// the controller runs are picked up on the next iteration.
    pub fn load(path: &Path) -> Result<Self, TuneError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TuneError::config(format!(
                "cannot read strategy space {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, TuneError> {
        Ok(toml::from_str(content)?)
    }

    pub fn get(&self, name: &str) -> Option<&Map<String, Value>> {
        self.strategies.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.strategies.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}
