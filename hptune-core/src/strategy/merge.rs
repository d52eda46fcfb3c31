//! Merging a sampled strategy into the base run configuration.

use super::{Strategy, StrategySpace};
use crate::error::TuneError;
use crate::run_config::{RunConfig, deep_merge};
use serde_json::Value;

/// Build the effective configuration for `strategy`.
///
/// Layers, last wins: `base`, the space entry named by the strategy, the
/// strategy's own overrides, then the derived fields (`strategy`,
/// `dataset_idx`, `base_name`, `save_path`). Inputs are left untouched and the
/// result only depends on them, so applying the same strategy twice yields
/// the same configuration.
///
/// Run artifacts are keyed by `<name>_<dataset_idx>` only. Two store rows
/// that share both but differ in `params` write to the same `save_path`, and
/// the later run replaces the earlier snapshot.
pub fn update_args(
    base: &RunConfig,
    strategy: &Strategy,
    space: &StrategySpace,
) -> Result<RunConfig, TuneError> {
    let entry = space.get(&strategy.name).ok_or_else(|| {
        TuneError::strategy(format!(
            "strategy '{}' (id {}) is not defined in the strategy space",
            strategy.name, strategy.id
        ))
    })?;

    let mut merged = base.to_value()?;
    deep_merge(&mut merged, &Value::Object(entry.clone()));
    deep_merge(&mut merged, &Value::Object(strategy.params.clone()));

    let mut config = RunConfig::from_value(merged)?;
    config.strategy = Some(strategy.name.clone());
    config.dataset_idx = strategy.dataset_idx;
    config.base_name = format!("{}_{}", strategy.name, strategy.dataset_idx);
    config.save_path = config.output_dir.join(&config.base_name);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{Map, json};
    use std::path::PathBuf;

    fn space() -> StrategySpace {
        StrategySpace::from_toml_str(
            r#"
[strategies.st01]
model_name = "klue/roberta-large"
weight_decay = 0.02
optimizer_hp = { lr = 1e-5 }
max_seq_len = 256
"#,
        )
        .unwrap()
    }

    fn strategy(params: Map<String, Value>) -> Strategy {
        Strategy {
            id: 7,
            name: "st01".into(),
            dataset_idx: 2,
            params,
        }
    }

    #[test]
    fn test_layers_and_derived_fields() {
        let base = RunConfig::default();
        let mut params = Map::new();
        params.insert("optimizer_hp".into(), json!({"lr": 3e-5}));

        let config = update_args(&base, &strategy(params), &space()).unwrap();

        assert_eq!(config.model_name, "klue/roberta-large");
        assert_eq!(config.weight_decay, 0.02);
        // Strategy override beats the space entry; sibling keys survive.
        assert_eq!(config.learning_rate(), Some(3e-5));
        assert_eq!(config.optimizer_hp.get("eps"), Some(&json!(1e-8)));
        assert_eq!(config.extra.get("max_seq_len"), Some(&json!(256)));
        assert_eq!(config.strategy.as_deref(), Some("st01"));
        assert_eq!(config.dataset_idx, 2);
        assert_eq!(config.base_name, "st01_2");
        assert_eq!(config.save_path, PathBuf::from("results/st01_2"));
    }

    #[test]
    fn test_inputs_untouched() {
        let base = RunConfig::default();
        let before = base.clone();
        let s = strategy(Map::new());
        let _ = update_args(&base, &s, &space()).unwrap();
        assert_eq!(base, before);
        assert_eq!(s, strategy(Map::new()));
    }

    #[test]
    fn test_idempotent() {
        let base = RunConfig::default();
        let s = strategy(Map::new());
        let once = update_args(&base, &s, &space()).unwrap();
        let twice = update_args(&once, &s, &space()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_same_name_and_split_share_run_dir() {
        let base = RunConfig::default();
        let mut params = Map::new();
        params.insert("weight_decay".into(), json!(0.05));
        let mut other = strategy(params);
        other.id = 8;

        let first = update_args(&base, &strategy(Map::new()), &space()).unwrap();
        let second = update_args(&base, &other, &space()).unwrap();
        assert_eq!(first.base_name, second.base_name);
        assert_eq!(first.save_path, second.save_path);
        assert_ne!(first.weight_decay, second.weight_decay);
    }

    #[test]
    fn test_unknown_strategy() {
        let mut s = strategy(Map::new());
        s.name = "st99".into();
        let err = update_args(&RunConfig::default(), &s, &space()).unwrap_err();
        assert!(matches!(err, TuneError::Strategy(_)));
    }
}
