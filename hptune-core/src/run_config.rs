//! The effective configuration of a single training run.

use crate::error::TuneError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Named hyperparameters and run metadata for one run.
///
/// Built from defaults at start-up and replaced (never edited in place) each
/// time a strategy is merged in. Fields the struct doesn't know about are kept
/// in `extra` so that strategy spaces can carry model-specific knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub seed: u64,
    pub device: String,
    /// Epoch budget, also the PBT iteration budget.
    pub epochs: usize,
    /// Early-stopping patience in epochs.
    pub patience: usize,
    pub min_delta: f64,
    pub model_name: String,
    pub batch_size: usize,
    /// Optimizer sub-config; `lr` is always expected.
    pub optimizer_hp: Map<String, Value>,
    pub weight_decay: f64,
    pub dataset_idx: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub base_name: String,
    pub output_dir: PathBuf,
    pub save_path: PathBuf,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for RunConfig {
    fn default() -> Self {
        let mut optimizer_hp = Map::new();
        optimizer_hp.insert("lr".into(), Value::from(5e-5));
        optimizer_hp.insert("eps".into(), Value::from(1e-8));

        Self {
            seed: 42,
            device: "cuda:0".to_string(),
            epochs: 10,
            patience: 3,
            min_delta: 0.0,
            model_name: "xlm-roberta-large".to_string(),
            batch_size: 32,
            optimizer_hp,
            weight_decay: 0.01,
            dataset_idx: 0,
            strategy: None,
            base_name: "baseline".to_string(),
            output_dir: PathBuf::from("results"),
            save_path: PathBuf::from("results/baseline"),
            extra: Map::new(),
        }
    }
}

impl RunConfig {
    pub fn learning_rate(&self) -> Option<f64> {
        self.optimizer_hp.get("lr").and_then(Value::as_f64)
    }

    pub fn to_value(&self) -> Result<Value, TuneError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self, TuneError> {
        serde_json::from_value(value)
            .map_err(|e| TuneError::config(format!("invalid run configuration: {e}")))
    }

    /// Read a dotted path such as `optimizer_hp.lr`.
    pub fn get_path(&self, path: &str) -> Result<Option<Value>, TuneError> {
        Ok(get_path(&self.to_value()?, path).cloned())
    }

    /// Return a copy with the value at a dotted path replaced.
    pub fn with_path(&self, path: &str, value: Value) -> Result<Self, TuneError> {
        let mut root = self.to_value()?;
        set_path(&mut root, path, value)?;
        Self::from_value(root)
    }
}

/// Recursively merge `overlay` into `target`.
///
/// Objects merge key by key; any other overlay value replaces the target.
pub fn deep_merge(target: &mut Value, overlay: &Value) {
    match (target, overlay) {
        (Value::Object(target), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match target.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, overlay) => *target = overlay.clone(),
    }
}

pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |node, key| node.get(key))
}

pub fn set_path(root: &mut Value, path: &str, value: Value) -> Result<(), TuneError> {
    let mut keys: Vec<&str> = path.split('.').collect();
    let last = keys
        .pop()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| TuneError::invalid_input(format!("empty path '{path}'")))?;

    let mut node = root;
    for key in keys {
        let map = node
            .as_object_mut()
            .ok_or_else(|| TuneError::invalid_input(format!("'{path}' crosses a non-object")))?;
        node = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let map = node
        .as_object_mut()
        .ok_or_else(|| TuneError::invalid_input(format!("'{path}' crosses a non-object")))?;
    map.insert(last.to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_deep_merge_nested_objects() {
        let mut base = json!({"optimizer_hp": {"lr": 5e-5, "eps": 1e-8}, "epochs": 10});
        deep_merge(&mut base, &json!({"optimizer_hp": {"lr": 3e-5}, "epochs": 5}));
        assert_eq!(
            base,
            json!({"optimizer_hp": {"lr": 3e-5, "eps": 1e-8}, "epochs": 5})
        );
    }

    #[test]
    fn test_deep_merge_replaces_non_objects() {
        let mut base = json!({"labels": [1, 2, 3]});
        deep_merge(&mut base, &json!({"labels": [4]}));
        assert_eq!(base, json!({"labels": [4]}));
    }

    #[test]
    fn test_extra_fields_survive_roundtrip() {
        let mut value = RunConfig::default().to_value().unwrap();
        deep_merge(&mut value, &json!({"max_seq_len": 256}));
        let config = RunConfig::from_value(value).unwrap();
        assert_eq!(config.extra.get("max_seq_len"), Some(&json!(256)));
        assert_eq!(config.to_value().unwrap()["max_seq_len"], json!(256));
    }

    #[test]
    fn test_paths() {
        let config = RunConfig::default();
        assert_eq!(config.learning_rate(), Some(5e-5));

        let updated = config.with_path("optimizer_hp.lr", json!(2e-4)).unwrap();
        assert_eq!(updated.learning_rate(), Some(2e-4));
        assert_eq!(
            updated.get_path("optimizer_hp.eps").unwrap(),
            Some(json!(1e-8))
        );
        assert_eq!(config.learning_rate(), Some(5e-5));
    }

    #[test]
    fn test_set_path_rejects_scalar_parent() {
        let mut root = json!({"epochs": 10});
        assert!(set_path(&mut root, "epochs.inner", json!(1)).is_err());
    }
}
