//! Hyperparameter perturbation for population-based training.

use crate::config::MutationSpec;
use crate::error::TuneError;
use crate::run_config::{RunConfig, get_path, set_path};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;

/// Multipliers applied when a value is perturbed rather than resampled.
const PERTURBATION_FACTORS: [f64; 2] = [1.2, 0.8];

/// One change made by [`Explorer::explore`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Perturbation {
    pub path: String,
    pub from: Option<f64>,
    pub to: f64,
    pub resampled: bool,
}

/// Applies the configured mutations to run configs.
#[derive(Debug, Clone)]
pub struct Explorer {
    mutations: Vec<MutationSpec>,
    resample_probability: f64,
}

impl Explorer {
    pub fn new(mutations: Vec<MutationSpec>, resample_probability: f64) -> Result<Self, TuneError> {
        if !(0.0..=1.0).contains(&resample_probability) {
            return Err(TuneError::config(format!(
                "resample_probability must be within [0, 1], got {resample_probability}"
            )));
        }
        for spec in &mutations {
            if !spec.low.is_finite() || !spec.high.is_finite() || spec.low > spec.high {
                return Err(TuneError::config(format!(
                    "mutation '{}' has an invalid range [{}, {}]",
                    spec.path, spec.low, spec.high
                )));
            }
        }
        Ok(Self {
            mutations,
            resample_probability,
        })
    }

    pub fn mutations(&self) -> &[MutationSpec] {
        &self.mutations
    }

    /// Sample a value for every mutated path the config does not set yet.
    /// Values already present are left alone.
    pub fn fill_missing<R: Rng>(&self, config: &RunConfig, rng: &mut R) -> Result<RunConfig, TuneError> {
        let mut root = config.to_value()?;
        for spec in &self.mutations {
            if current_value(&root, &spec.path).is_none() {
                set_path(&mut root, &spec.path, Value::from(rng.gen_range(spec.low..=spec.high)))?;
            }
        }
        RunConfig::from_value(root)
    }

    /// Perturb every mutated path of `config`.
    ///
    /// Each value is resampled from its range with `resample_probability`
    /// (always, when missing), otherwise multiplied by 1.2 or 0.8.
    pub fn explore<R: Rng>(
        &self,
        config: &RunConfig,
        rng: &mut R,
    ) -> Result<(RunConfig, Vec<Perturbation>), TuneError> {
        let mut root = config.to_value()?;
        let mut changes = Vec::with_capacity(self.mutations.len());

        for spec in &self.mutations {
            let from = current_value(&root, &spec.path);
            let resample = from.is_none() || rng.gen_bool(self.resample_probability);
            let to = match from {
                Some(value) if !resample => {
                    value * PERTURBATION_FACTORS[rng.gen_range(0..PERTURBATION_FACTORS.len())]
                }
                _ => rng.gen_range(spec.low..=spec.high),
            };
            set_path(&mut root, &spec.path, Value::from(to))?;
            changes.push(Perturbation {
                path: spec.path.clone(),
                from,
                to,
                resampled: resample,
            });
        }

        Ok((RunConfig::from_value(root)?, changes))
    }
}

fn current_value(root: &Value, path: &str) -> Option<f64> {
    get_path(root, path).and_then(Value::as_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PbtConfig;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn explorer(resample_probability: f64) -> Explorer {
        Explorer::new(PbtConfig::default().mutations, resample_probability).unwrap()
    }

    #[test]
    fn test_always_resample_stays_in_range() {
        let explorer = explorer(1.0);
        let mut rng = StdRng::seed_from_u64(7);
        let mut config = RunConfig::default();
        for _ in 0..50 {
            let (next, changes) = explorer.explore(&config, &mut rng).unwrap();
            assert!(changes.iter().all(|c| c.resampled));
            let lr = next.learning_rate().unwrap();
            assert!((0.0001..=0.0005).contains(&lr));
            assert!((0.001..=0.02).contains(&next.weight_decay));
            config = next;
        }
    }

    #[test]
    fn test_never_resample_multiplies() {
        let explorer = explorer(0.0);
        let mut rng = StdRng::seed_from_u64(7);
        let config = RunConfig::default();
        let (next, changes) = explorer.explore(&config, &mut rng).unwrap();

        let lr = next.learning_rate().unwrap();
        let base_lr = config.learning_rate().unwrap();
        let ratio = lr / base_lr;
        assert!((ratio - 1.2).abs() < 1e-9 || (ratio - 0.8).abs() < 1e-9);

        let ratio = next.weight_decay / config.weight_decay;
        assert!((ratio - 1.2).abs() < 1e-9 || (ratio - 0.8).abs() < 1e-9);
        assert!(changes.iter().all(|c| !c.resampled));
    }

    #[test]
    fn test_missing_path_is_resampled() {
        let explorer = Explorer::new(
            vec![MutationSpec {
                path: "scheduler.warmup".into(),
                low: 0.0,
                high: 0.1,
            }],
            0.0,
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let (next, changes) = explorer.explore(&RunConfig::default(), &mut rng).unwrap();
        assert!(changes[0].resampled);
        assert_eq!(changes[0].from, None);
        let warmup = next.get_path("scheduler.warmup").unwrap().unwrap();
        assert!((0.0..=0.1).contains(&warmup.as_f64().unwrap()));
    }

    #[test]
    fn test_fill_missing_keeps_existing_values() {
        let explorer = explorer(0.25);
        let mut rng = StdRng::seed_from_u64(3);
        let config = RunConfig::default();
        let filled = explorer.fill_missing(&config, &mut rng).unwrap();
        assert_eq!(filled, config);

        let mut bare = RunConfig::default();
        bare.optimizer_hp.remove("lr");
        let filled = explorer.fill_missing(&bare, &mut rng).unwrap();
        assert!((0.0001..=0.0005).contains(&filled.learning_rate().unwrap()));
    }

    #[test]
    fn test_same_seed_same_perturbations() {
        let explorer = explorer(0.25);
        let config = RunConfig::default();
        let a = explorer
            .explore(&config, &mut StdRng::seed_from_u64(11))
            .unwrap();
        let b = explorer
            .explore(&config, &mut StdRng::seed_from_u64(11))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(Explorer::new(vec![], 1.5).is_err());
        let inverted = MutationSpec {
            path: "weight_decay".into(),
            low: 0.2,
            high: 0.1,
        };
        assert!(Explorer::new(vec![inverted], 0.25).is_err());
    }
}
