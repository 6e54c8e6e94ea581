//! Parameter sampling strategies over a [`SearchSpace`].

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tn_types::{HParams, ParameterKind, SearchSpace};

/// Produces the hyperparameters and seed for the `index`-th trial of a search.
///
/// Sampling is a pure function of the index so that a restored searcher only
/// needs to remember how many trials it has requested.
pub trait SearchStrategy: Send + Sync {
    fn sample(&self, index: usize) -> (HParams, u32);

    /// Upper bound on trials this strategy can produce.
    fn max_trials(&self) -> usize;

    fn name(&self) -> &str;
}

// ---- Grid search ----

/// Exhaustive grid search over discrete parameter combinations.
#[derive(Debug, Clone)]
pub struct GridSearch {
    seed: u32,
    combos: Vec<HParams>,
}

impl GridSearch {
    pub fn new(space: &SearchSpace, float_steps: usize, seed: u32) -> Self {
        Self {
            seed,
            combos: Self::build_grid(space, float_steps),
        }
    }

    fn build_grid(space: &SearchSpace, float_steps: usize) -> Vec<HParams> {
        let mut axes: Vec<Vec<(&str, serde_json::Value)>> = Vec::new();

        for param in &space.parameters {
            let steps = float_steps.max(2);
            let values: Vec<serde_json::Value> = match &param.kind {
                ParameterKind::Const { value } => vec![value.clone()],
                ParameterKind::Double { low, high } => (0..steps)
                    .map(|i| {
                        let t = i as f64 / (steps - 1) as f64;
                        serde_json::json!(low + t * (high - low))
                    })
                    .collect(),
                ParameterKind::Int { low, high } => {
                    (*low..=*high).map(|v| serde_json::json!(v)).collect()
                }
                ParameterKind::Log { low, high } => {
                    let log_low = low.ln();
                    let log_high = high.ln();
                    (0..steps)
                        .map(|i| {
                            let t = i as f64 / (steps - 1) as f64;
                            serde_json::json!((log_low + t * (log_high - log_low)).exp())
                        })
                        .collect()
                }
                ParameterKind::Categorical { values } => values.clone(),
            };
            axes.push(values.into_iter().map(|v| (param.name.as_str(), v)).collect());
        }

        // Cartesian product
        let mut result: Vec<HParams> = vec![HParams::new()];
        for axis in &axes {
            let mut next = Vec::with_capacity(result.len() * axis.len());
            for existing in &result {
                for (name, value) in axis {
                    let mut combo = existing.clone();
                    combo.insert(name.to_string(), value.clone());
                    next.push(combo);
                }
            }
            result = next;
        }

        result
    }
}

impl SearchStrategy for GridSearch {
    fn sample(&self, index: usize) -> (HParams, u32) {
        let hparams = self.combos.get(index).cloned().unwrap_or_default();
        let seed = ChaCha8Rng::seed_from_u64(self.seed as u64 ^ index as u64).gen();
        (hparams, seed)
    }

    fn max_trials(&self) -> usize {
        self.combos.len()
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
    max_trials: usize,
    seed: u32,
}

impl RandomSearch {
    pub fn new(space: SearchSpace, max_trials: usize, seed: u32) -> Self {
        Self {
            space,
            max_trials,
            seed,
        }
    }

    fn rng_for(&self, index: usize) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(((self.seed as u64) << 32) | index as u64)
    }
}

impl SearchStrategy for RandomSearch {
    fn sample(&self, index: usize) -> (HParams, u32) {
        let mut rng = self.rng_for(index);
        let mut params = HParams::new();

        for param in &self.space.parameters {
            let value = match &param.kind {
                ParameterKind::Const { value } => value.clone(),
                ParameterKind::Double { low, high } => serde_json::json!(rng.gen_range(*low..=*high)),
                ParameterKind::Int { low, high } => serde_json::json!(rng.gen_range(*low..=*high)),
                ParameterKind::Log { low, high } => {
                    let log_val: f64 = rng.gen_range(low.ln()..=high.ln());
                    serde_json::json!(log_val.exp())
                }
                ParameterKind::Categorical { values } => {
                    values[rng.gen_range(0..values.len())].clone()
                }
            };
            params.insert(param.name.clone(), value);
        }

        (params, rng.gen())
    }

    fn max_trials(&self) -> usize {
        self.max_trials
    }

    fn name(&self) -> &str {
        "random"
    }
}
