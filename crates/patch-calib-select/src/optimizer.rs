use crate::{CoverageAccumulator, SelectError};
use log::{debug, info, warn};
use nalgebra::Point2;
use patch_calib_core::{ensure, ConfigError};
use rand::{rngs::StdRng, seq::index, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Default selection budget.
pub const MAX_PATTERNS_PER_SET: usize = 10;

/// Frame selection strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMode {
    /// Every candidate.
    AllPatterns,
    /// Uniform sample of `budget` candidates from OS entropy.
    RandomSet,
    /// The first `budget` candidates in input order.
    FirstN,
    /// Greedy with one-step look-ahead.
    EnhancedMcm,
    /// Best of `random_trials` seeded random subsets.
    BestOfRandom,
    /// Every subset of the capped size, in lexicographic order.
    ExhaustiveSearch,
    /// [`RandomSet`](Self::RandomSet) with an explicit seed.
    RandomSeed,
    /// Greedy on the live coverage score.
    #[default]
    ScoreBased,
}

impl OptimizationMode {
    pub const ALL: [OptimizationMode; 8] = [
        Self::AllPatterns,
        Self::RandomSet,
        Self::FirstN,
        Self::EnhancedMcm,
        Self::BestOfRandom,
        Self::ExhaustiveSearch,
        Self::RandomSeed,
        Self::ScoreBased,
    ];

    pub fn code(self) -> u8 {
        match self {
            Self::AllPatterns => 0,
            Self::RandomSet => 1,
            Self::FirstN => 2,
            Self::EnhancedMcm => 3,
            Self::BestOfRandom => 4,
            Self::ExhaustiveSearch => 5,
            Self::RandomSeed => 6,
            Self::ScoreBased => 7,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, ConfigError> {
        Self::ALL
            .get(code as usize)
            .copied()
            .ok_or_else(|| ConfigError::parameter("mode", format!("unknown code {code}")))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionParams {
    pub mode: OptimizationMode,
    /// Maximum number of selected sets (ignored by `AllPatterns`).
    pub budget: usize,
    /// Subsets drawn by `BestOfRandom`.
    pub random_trials: usize,
    /// Upper bound on the subset size enumerated by `ExhaustiveSearch`.
    pub exhaustive_cap: usize,
    /// Upper bound on subsets scored by `ExhaustiveSearch`.
    pub max_exhaustive_evaluations: usize,
    /// Seed for `RandomSeed`; base seed for `BestOfRandom` trials.
    pub seed: u64,
    /// `EnhancedMcm` adds the best follow-up gain to each candidate's value.
    pub lookahead: bool,
}

impl Default for SelectionParams {
    fn default() -> Self {
        Self {
            mode: OptimizationMode::default(),
            budget: MAX_PATTERNS_PER_SET,
            random_trials: 64,
            exhaustive_cap: 4,
            max_exhaustive_evaluations: 100_000,
            seed: 0,
            lookahead: true,
        }
    }
}

impl SelectionParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(self.budget > 0, "budget", "must be > 0")?;
        ensure(self.random_trials > 0, "random_trials", "must be > 0")?;
        ensure(self.exhaustive_cap > 0, "exhaustive_cap", "must be > 0")?;
        ensure(
            self.max_exhaustive_evaluations > 0,
            "max_exhaustive_evaluations",
            "must be > 0",
        )
    }
}

/// Result of one optimizer run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub mode: OptimizationMode,
    /// Pool indices in acceptance order.
    pub indices: Vec<usize>,
    /// Marginal coverage gain of each accepted set.
    pub gains: Vec<f64>,
    /// Sum of `gains`.
    pub aggregate: f64,
    /// Candidate sets or subsets scored while searching.
    pub evaluations: usize,
    /// `ExhaustiveSearch` stopped at `max_exhaustive_evaluations`.
    pub capped: bool,
}

/// Sum of marginal gains of `indices`, accumulated in order into a copy of
/// `coverage`.
pub fn aggregate_score<P>(pool: &[P], coverage: &CoverageAccumulator, indices: &[usize]) -> f64
where
    P: AsRef<[Point2<f32>]>,
{
    let mut scratch = coverage.clone();
    let mut total = 0.0;
    for &i in indices {
        let Some(set) = pool.get(i) else { continue };
        total += scratch.obtain_set_score(set.as_ref());
        scratch.accumulate(set.as_ref());
    }
    total
}

fn sample_sorted<R: Rng + ?Sized>(rng: &mut R, n: usize, k: usize) -> Vec<usize> {
    let mut picked = index::sample(rng, n, k).into_vec();
    picked.sort_unstable();
    picked
}

/// Advance `c` to the next `k`-combination of `0..n` in lexicographic order.
fn next_combination(c: &mut [usize], n: usize) -> bool {
    let k = c.len();
    for i in (0..k).rev() {
        if c[i] < n - k + i {
            c[i] += 1;
            for j in i + 1..k {
                c[j] = c[j - 1] + 1;
            }
            return true;
        }
    }
    false
}

/// `(order, value)` with ties resolved towards the lower order.
#[inline]
fn better<T>(a: (usize, f64, T), b: (usize, f64, T)) -> (usize, f64, T) {
    if b.1 > a.1 || (b.1 == a.1 && b.0 < a.0) {
        b
    } else {
        a
    }
}

/// Picks frames from a candidate pool to maximize coverage.
#[derive(Clone, Debug, Default)]
pub struct SetOptimizer {
    params: SelectionParams,
}

impl SetOptimizer {
    pub fn new(params: SelectionParams) -> Result<Self, ConfigError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &SelectionParams {
        &self.params
    }

    /// Select from `pool` and accept the selection into `coverage`.
    #[cfg_attr(
        feature = "tracing",
        instrument(
            level = "info",
            skip(self, pool, coverage),
            fields(mode = ?self.params.mode, pool = pool.len())
        )
    )]
    pub fn optimize<P>(
        &self,
        pool: &[P],
        coverage: &mut CoverageAccumulator,
    ) -> Result<Selection, SelectError>
    where
        P: AsRef<[Point2<f32>]> + Sync,
    {
        if pool.is_empty() {
            return Err(SelectError::EmptyPool);
        }
        self.params.validate()?;

        let n = pool.len();
        let k = self.params.budget.min(n);
        let mode = self.params.mode;

        let selection = match mode {
            OptimizationMode::AllPatterns => accept(mode, pool, coverage, (0..n).collect(), 0),
            OptimizationMode::FirstN => accept(mode, pool, coverage, (0..k).collect(), 0),
            OptimizationMode::RandomSet => {
                let picked = sample_sorted(&mut rand::rng(), n, k);
                accept(mode, pool, coverage, picked, 0)
            }
            OptimizationMode::RandomSeed => {
                let mut rng = StdRng::seed_from_u64(self.params.seed);
                let picked = sample_sorted(&mut rng, n, k);
                accept(mode, pool, coverage, picked, 0)
            }
            OptimizationMode::ScoreBased => self.greedy(pool, coverage, k, false),
            OptimizationMode::EnhancedMcm => self.greedy(pool, coverage, k, self.params.lookahead),
            OptimizationMode::BestOfRandom => {
                let picked = self.best_of_random(pool, coverage, k);
                accept(mode, pool, coverage, picked, self.params.random_trials)
            }
            OptimizationMode::ExhaustiveSearch => {
                let (picked, evaluations, capped) = self.exhaustive(pool, coverage, k);
                let mut selection = accept(mode, pool, coverage, picked, evaluations);
                selection.capped = capped;
                selection
            }
        };

        info!(
            "{:?}: selected {} of {} candidates, aggregate {:.4}, bin coverage {:.3}",
            mode,
            selection.indices.len(),
            n,
            selection.aggregate,
            coverage.coverage_fraction()
        );
        Ok(selection)
    }

    /// Repeatedly accept the best-valued remaining candidate. With
    /// `lookahead`, a candidate's value adds the best gain still available
    /// after accepting it.
    fn greedy<P>(
        &self,
        pool: &[P],
        coverage: &mut CoverageAccumulator,
        k: usize,
        lookahead: bool,
    ) -> Selection
    where
        P: AsRef<[Point2<f32>]> + Sync,
    {
        let mut remaining: Vec<usize> = (0..pool.len()).collect();
        let mut indices = Vec::with_capacity(k);
        let mut gains = Vec::with_capacity(k);
        let mut evaluations = 0;

        while indices.len() < k && !remaining.is_empty() {
            let current: &CoverageAccumulator = coverage;
            let best = remaining
                .par_iter()
                .enumerate()
                .map(|(slot, &i)| {
                    let set = pool[i].as_ref();
                    let mut value = current.obtain_set_score(set);
                    if lookahead {
                        let mut next = current.clone();
                        next.accumulate(set);
                        value += remaining
                            .iter()
                            .filter(|&&j| j != i)
                            .map(|&j| next.obtain_set_score(pool[j].as_ref()))
                            .fold(0.0, f64::max);
                    }
                    (i, value, slot)
                })
                .reduce_with(better);
            evaluations += remaining.len();

            let Some((i, value, slot)) = best else { break };
            remaining.remove(slot);
            let set = pool[i].as_ref();
            let gain = coverage.obtain_set_score(set);
            coverage.accumulate(set);
            debug!("greedy pick {i}: gain {gain:.4}, value {value:.4}");
            indices.push(i);
            gains.push(gain);
        }

        Selection {
            mode: self.params.mode,
            aggregate: gains.iter().sum(),
            indices,
            gains,
            evaluations,
            capped: false,
        }
    }

    fn best_of_random<P>(&self, pool: &[P], coverage: &CoverageAccumulator, k: usize) -> Vec<usize>
    where
        P: AsRef<[Point2<f32>]> + Sync,
    {
        let n = pool.len();
        let seed = self.params.seed;
        (0..self.params.random_trials)
            .into_par_iter()
            .map(|trial| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(trial as u64));
                let subset = sample_sorted(&mut rng, n, k);
                let score = aggregate_score(pool, coverage, &subset);
                (trial, score, subset)
            })
            .reduce_with(better)
            .map(|(_, _, subset)| subset)
            .unwrap_or_default()
    }

    /// Best subset of size `min(k, exhaustive_cap)`; returns it with the
    /// number of subsets scored and whether enumeration was cut short.
    fn exhaustive<P>(
        &self,
        pool: &[P],
        coverage: &CoverageAccumulator,
        k: usize,
    ) -> (Vec<usize>, usize, bool)
    where
        P: AsRef<[Point2<f32>]> + Sync,
    {
        let n = pool.len();
        let size = k.min(self.params.exhaustive_cap);
        let limit = self.params.max_exhaustive_evaluations;

        let mut subsets = Vec::new();
        let mut c: Vec<usize> = (0..size).collect();
        let mut capped = false;
        loop {
            subsets.push(c.clone());
            let more = next_combination(&mut c, n);
            if !more {
                break;
            }
            if subsets.len() >= limit {
                capped = true;
                break;
            }
        }
        if capped {
            warn!("exhaustive search over C({n}, {size}) stopped after {limit} subsets");
        }

        let evaluations = subsets.len();
        let best = subsets
            .into_par_iter()
            .enumerate()
            .map(|(order, subset)| {
                let score = aggregate_score(pool, coverage, &subset);
                (order, score, subset)
            })
            .reduce_with(better)
            .map(|(_, _, subset)| subset)
            .unwrap_or_default();
        (best, evaluations, capped)
    }
}

fn accept<P>(
    mode: OptimizationMode,
    pool: &[P],
    coverage: &mut CoverageAccumulator,
    indices: Vec<usize>,
    evaluations: usize,
) -> Selection
where
    P: AsRef<[Point2<f32>]>,
{
    let mut gains = Vec::with_capacity(indices.len());
    for &i in &indices {
        let set = pool[i].as_ref();
        gains.push(coverage.obtain_set_score(set));
        coverage.accumulate(set);
    }
    Selection {
        mode,
        aggregate: gains.iter().sum(),
        indices,
        gains,
        evaluations,
        capped: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patch_calib_core::ImageSize;

    fn coverage() -> CoverageAccumulator {
        CoverageAccumulator::with_defaults(ImageSize {
            width: 640,
            height: 480,
        })
        .unwrap()
    }

    /// 2x2 point clusters spread over the image.
    fn pool(n: usize) -> Vec<Vec<Point2<f32>>> {
        (0..n)
            .map(|i| {
                let x = 30.0 + (i % 6) as f32 * 100.0;
                let y = 30.0 + (i / 6 % 4) as f32 * 110.0;
                vec![
                    Point2::new(x, y),
                    Point2::new(x + 25.0, y),
                    Point2::new(x, y + 25.0),
                    Point2::new(x + 25.0, y + 25.0),
                ]
            })
            .collect()
    }

    fn optimizer(mode: OptimizationMode, budget: usize) -> SetOptimizer {
        SetOptimizer::new(SelectionParams {
            mode,
            budget,
            ..SelectionParams::default()
        })
        .unwrap()
    }

    #[test]
    fn mode_codes_round_trip() {
        for mode in OptimizationMode::ALL {
            assert_eq!(OptimizationMode::from_code(mode.code()).unwrap(), mode);
        }
        assert!(OptimizationMode::from_code(8).is_err());
        assert_eq!(OptimizationMode::default().code(), 7);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let params: SelectionParams =
            serde_json::from_str(r#"{ "mode": "exhaustive_search", "budget": 3 }"#).unwrap();
        assert_eq!(params.mode, OptimizationMode::ExhaustiveSearch);
        assert_eq!(params.budget, 3);
        assert_eq!(params.exhaustive_cap, 4);
        assert!(params.lookahead);
    }

    #[test]
    fn zero_budget_is_a_config_error() {
        let params = SelectionParams {
            budget: 0,
            ..SelectionParams::default()
        };
        assert!(SetOptimizer::new(params).is_err());
    }

    #[test]
    fn empty_pool_is_fatal() {
        let pool: Vec<Vec<Point2<f32>>> = Vec::new();
        for mode in OptimizationMode::ALL {
            let err = optimizer(mode, 3).optimize(&pool, &mut coverage()).unwrap_err();
            assert_eq!(err, SelectError::EmptyPool);
        }
    }

    #[test]
    fn every_mode_accepts_distinct_indices() {
        let pool = pool(12);
        for mode in OptimizationMode::ALL {
            let mut cov = coverage();
            let sel = optimizer(mode, 4).optimize(&pool, &mut cov).unwrap();
            let expected = if mode == OptimizationMode::AllPatterns { 12 } else { 4 };
            assert_eq!(sel.indices.len(), expected, "{mode:?}");

            let mut sorted = sel.indices.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), sel.indices.len(), "{mode:?} repeated an index");
            assert!(sel.indices.iter().all(|&i| i < pool.len()));

            assert_eq!(cov.accumulated_sets(), sel.indices.len(), "{mode:?}");
            assert!((sel.aggregate - sel.gains.iter().sum::<f64>()).abs() < 1e-12);
        }
    }

    #[test]
    fn first_n_keeps_input_order() {
        let sel = optimizer(OptimizationMode::FirstN, 3)
            .optimize(&pool(8), &mut coverage())
            .unwrap();
        assert_eq!(sel.indices, vec![0, 1, 2]);
    }

    #[test]
    fn budget_larger_than_pool_takes_everything() {
        let sel = optimizer(OptimizationMode::ScoreBased, 50)
            .optimize(&pool(5), &mut coverage())
            .unwrap();
        assert_eq!(sel.indices.len(), 5);
    }

    #[test]
    fn seeded_modes_are_reproducible() {
        let pool = pool(20);
        for mode in [OptimizationMode::RandomSeed, OptimizationMode::BestOfRandom] {
            let a = optimizer(mode, 5).optimize(&pool, &mut coverage()).unwrap();
            let b = optimizer(mode, 5).optimize(&pool, &mut coverage()).unwrap();
            assert_eq!(a.indices, b.indices, "{mode:?}");
        }
    }

    #[test]
    fn exhaustive_finds_best_pair() {
        let pool = pool(7);
        let base = coverage();
        let sel = optimizer(OptimizationMode::ExhaustiveSearch, 2)
            .optimize(&pool, &mut base.clone())
            .unwrap();
        assert_eq!(sel.evaluations, 21);
        assert!(!sel.capped);

        for a in 0..pool.len() {
            for b in a + 1..pool.len() {
                let score = aggregate_score(&pool, &base, &[a, b]);
                assert!(score <= sel.aggregate + 1e-12, "({a}, {b}) beats the search");
            }
        }
    }

    #[test]
    fn exhaustive_respects_evaluation_cap() {
        let params = SelectionParams {
            mode: OptimizationMode::ExhaustiveSearch,
            budget: 3,
            max_exhaustive_evaluations: 10,
            ..SelectionParams::default()
        };
        let sel = SetOptimizer::new(params)
            .unwrap()
            .optimize(&pool(10), &mut coverage())
            .unwrap();
        assert_eq!(sel.evaluations, 10);
        assert!(sel.capped);
        assert_eq!(sel.indices.len(), 3);
    }

    #[test]
    fn greedy_ties_go_to_lower_index() {
        let same = vec![vec![Point2::new(320.0_f32, 240.0)]; 4];
        for mode in [OptimizationMode::ScoreBased, OptimizationMode::EnhancedMcm] {
            let sel = optimizer(mode, 2).optimize(&same, &mut coverage()).unwrap();
            assert_eq!(sel.indices, vec![0, 1], "{mode:?}");
        }
    }

    #[test]
    fn combinations_are_lexicographic() {
        let mut c = vec![0, 1];
        let mut seen = vec![c.clone()];
        while next_combination(&mut c, 4) {
            seen.push(c.clone());
        }
        assert_eq!(
            seen,
            vec![
                vec![0, 1],
                vec![0, 2],
                vec![0, 3],
                vec![1, 2],
                vec![1, 3],
                vec![2, 3]
            ]
        );
    }
}
