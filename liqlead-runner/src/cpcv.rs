//! Combinatorial purged cross-validation (CPCV).
//!
//! The complete-row observations are cut into `F` contiguous folds. Every
//! choice of `T` test folds is one candidate split. Training drops a single
//! span running from `purge` rows before the first test row to `embargo` rows
//! after the last one, including any rows between separated test folds.
//!
//! Minimum data requirements:
//! - 60 complete observations
//! - 20 training rows per split
//! - 5 successful paths

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use liqlead_core::builders::{
    ensure_target_blind, sign_correct, BuildError, Builder, BuilderKind, BuilderParams,
    IndexBuilder,
};
use liqlead_core::composite::CompositeScorer;
use liqlead_core::matrix::VariableMatrix;
use liqlead_core::series::TimeSeries;
use liqlead_core::stats::{mean, std_population};

use crate::aligned::AlignedSample;

// ─── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpcvConfig {
    /// Contiguous folds (default 10).
    pub n_folds: usize,
    /// Folds held out per split (default 2).
    pub n_test_folds: usize,
    /// Observations removed before the first test row (default 9).
    pub purge: usize,
    /// Observations removed after the last test row (default 2).
    pub embargo: usize,
    /// Smallest training set a split may keep (default 20).
    pub min_train_size: usize,
    /// Complete observations required to run at all (default 60).
    pub min_observations: usize,
    /// Successful paths required for a summary (default 5).
    pub min_valid_paths: usize,
    /// Lag bound for out-of-sample scoring (default 12).
    pub max_lag: usize,
}

impl Default for CpcvConfig {
    fn default() -> Self {
        Self {
            n_folds: 10,
            n_test_folds: 2,
            purge: 9,
            embargo: 2,
            min_train_size: 20,
            min_observations: 60,
            min_valid_paths: 5,
            max_lag: 12,
        }
    }
}

// ─── Split generation ────────────────────────────────────────────────

/// One train/test partition of `0..n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpcvSplit {
    pub split_id: usize,
    pub test_folds: Vec<usize>,
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitPlan {
    /// `C(F, T)` candidate splits enumerated.
    pub n_candidates: usize,
    /// Splits whose training set fell below the minimum.
    pub n_skipped: usize,
    pub splits: Vec<CpcvSplit>,
}

/// All `k`-subsets of `0..n` in lexicographic order.
fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    if k == 0 || k > n {
        return out;
    }
    let mut combo: Vec<usize> = (0..k).collect();
    loop {
        out.push(combo.clone());
        // Rightmost position that can still advance
        let Some(i) = (0..k).rev().find(|&i| combo[i] < n - k + i) else {
            return out;
        };
        combo[i] += 1;
        for j in i + 1..k {
            combo[j] = combo[j - 1] + 1;
        }
    }
}

/// Fold `k` of `n` observations as `[start, end)`; the last fold takes the remainder.
fn fold_bounds(n: usize, n_folds: usize, k: usize) -> (usize, usize) {
    let size = n / n_folds;
    let start = k * size;
    let end = if k + 1 == n_folds { n } else { start + size };
    (start, end)
}

/// Enumerate every `C(F, T)` split of `0..n` with purge and embargo applied.
///
/// Folds come out in ascending order, so the test rows are sorted.
pub fn generate_splits(n: usize, config: &CpcvConfig) -> SplitPlan {
    let combos = combinations(config.n_folds, config.n_test_folds);
    let n_candidates = combos.len();
    if config.n_folds == 0 || n < config.n_folds {
        return SplitPlan {
            n_candidates,
            n_skipped: n_candidates,
            splits: Vec::new(),
        };
    }

    let mut splits = Vec::with_capacity(n_candidates);
    let mut n_skipped = 0;
    for (split_id, test_folds) in combos.into_iter().enumerate() {
        let test: Vec<usize> = test_folds
            .iter()
            .flat_map(|&k| {
                let (start, end) = fold_bounds(n, config.n_folds, k);
                start..end
            })
            .collect();
        let (Some(&first), Some(&last)) = (test.first(), test.last()) else {
            n_skipped += 1;
            continue;
        };

        // One excluded span: purge, every test fold and whatever lies between, embargo
        let lo = first.saturating_sub(config.purge);
        let hi = (last + 1 + config.embargo).min(n);
        let train: Vec<usize> = (0..lo).chain(hi..n).collect();

        if train.len() < config.min_train_size {
            tracing::debug!(split_id, n_train = train.len(), "cpcv split skipped: training set too small");
            n_skipped += 1;
            continue;
        }
        splits.push(CpcvSplit {
            split_id,
            test_folds,
            train,
            test,
        });
    }

    tracing::info!(
        n_splits = splits.len(),
        n_candidates,
        purge = config.purge,
        embargo = config.embargo,
        "cpcv splits generated"
    );
    SplitPlan {
        n_candidates,
        n_skipped,
        splits,
    }
}

// ─── Result types ────────────────────────────────────────────────────

/// Out-of-sample outcome of one split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpcvPath {
    pub split_id: usize,
    pub test_folds: Vec<usize>,
    pub n_train: usize,
    pub n_test: usize,
    pub cws: f64,
    pub optimal_lag: usize,
    pub mda: Option<f64>,
    pub pearson_r: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpcvReport {
    pub n_candidates: usize,
    pub n_skipped: usize,
    pub n_paths: usize,
    pub cws_mean: f64,
    /// Population standard deviation across paths.
    pub cws_std: f64,
    pub mda_mean: Option<f64>,
    pub pearson_mean: Option<f64>,
    /// Share of paths with a defined, positive correlation.
    pub positive_rate: Option<f64>,
    pub best_path: CpcvPath,
    pub worst_path: CpcvPath,
    pub paths: Vec<CpcvPath>,
}

#[derive(Debug, Error)]
pub enum CpcvError {
    #[error("insufficient data: {n_observations} complete observations < minimum {required}")]
    InsufficientObservations { n_observations: usize, required: usize },
    #[error("only {n_valid} valid paths (need {required})")]
    InsufficientPaths { n_valid: usize, required: usize },
    #[error("builder input rejected: {0}")]
    Rejected(#[from] BuildError),
}

impl CpcvError {
    /// Too little data, as opposed to a rejected input.
    pub fn is_insufficiency(&self) -> bool {
        !matches!(self, CpcvError::Rejected(_))
    }
}

// ─── Evaluation ──────────────────────────────────────────────────────

fn evaluate_split(
    sample: &AlignedSample,
    split: &CpcvSplit,
    kind: BuilderKind,
    params: &BuilderParams,
    scorer: &CompositeScorer,
) -> Result<CpcvPath, String> {
    let (train_matrix, _) = sample.subset(&split.train).map_err(|e| e.to_string())?;
    let (test_matrix, test_target) = sample.subset(&split.test).map_err(|e| e.to_string())?;

    let mut builder = Builder::new(kind, params);
    let fit = builder.build(&train_matrix).map_err(|e| e.to_string())?;
    let mut oos: TimeSeries = builder.transform(&test_matrix).map_err(|e| e.to_string())?;

    // Orientation comes from the training fit only
    if let Some(anchor) = train_matrix.column(train_matrix.anchor_column()) {
        if sign_correct(&fit.index, &anchor).1.flipped {
            oos = oos.negated();
        }
    }

    let opt = scorer.optimal_lag(&oos, &test_target);
    let row = opt.profile.at(opt.optimal_lag);
    Ok(CpcvPath {
        split_id: split.split_id,
        test_folds: split.test_folds.clone(),
        n_train: split.train.len(),
        n_test: split.test.len(),
        cws: opt.best_cws,
        optimal_lag: opt.optimal_lag,
        mda: row.and_then(|r| r.mda),
        pearson_r: row.and_then(|r| r.pearson_r),
    })
}

/// Fit on each split's training rows, score the held-out rows.
pub fn run_cpcv(
    matrix: &VariableMatrix,
    target: &TimeSeries,
    kind: BuilderKind,
    params: &BuilderParams,
    scorer: &CompositeScorer,
    config: &CpcvConfig,
) -> Result<CpcvReport, CpcvError> {
    ensure_target_blind(matrix)?;
    let sample = AlignedSample::new(matrix, target);
    let n = sample.len();
    if n < config.min_observations {
        return Err(CpcvError::InsufficientObservations {
            n_observations: n,
            required: config.min_observations,
        });
    }

    let plan = generate_splits(n, config);
    let scorer = scorer.with_max_lag(config.max_lag);
    let paths: Vec<CpcvPath> = plan
        .splits
        .par_iter()
        .filter_map(|split| match evaluate_split(&sample, split, kind, params, &scorer) {
            Ok(path) => Some(path),
            Err(reason) => {
                tracing::debug!(split_id = split.split_id, %reason, "cpcv split failed");
                None
            }
        })
        .collect();

    if paths.len() < config.min_valid_paths {
        return Err(CpcvError::InsufficientPaths {
            n_valid: paths.len(),
            required: config.min_valid_paths,
        });
    }

    let cws: Vec<f64> = paths.iter().map(|p| p.cws).collect();
    let mdas: Vec<f64> = paths.iter().filter_map(|p| p.mda).collect();
    let rs: Vec<f64> = paths.iter().filter_map(|p| p.pearson_r).collect();

    // First occurrence wins ties
    let mut best = 0;
    let mut worst = 0;
    for (i, c) in cws.iter().enumerate() {
        if *c > cws[best] {
            best = i;
        }
        if *c < cws[worst] {
            worst = i;
        }
    }

    let report = CpcvReport {
        n_candidates: plan.n_candidates,
        n_skipped: plan.n_skipped,
        n_paths: paths.len(),
        cws_mean: mean(&cws),
        cws_std: std_population(&cws),
        mda_mean: (!mdas.is_empty()).then(|| mean(&mdas)),
        pearson_mean: (!rs.is_empty()).then(|| mean(&rs)),
        positive_rate: (!rs.is_empty())
            .then(|| rs.iter().filter(|r| **r > 0.0).count() as f64 / rs.len() as f64),
        best_path: paths[best].clone(),
        worst_path: paths[worst].clone(),
        paths,
    };
    tracing::info!(
        n_paths = report.n_paths,
        cws_mean = report.cws_mean,
        cws_std = report.cws_std,
        "cpcv complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use liqlead_core::synthetic::LeadLagScenario;

    // ─── Split generation ────────────────────────────────────────

    #[test]
    fn combinations_are_lexicographic() {
        let c = combinations(4, 2);
        assert_eq!(c, vec![vec![0, 1], vec![0, 2], vec![0, 3], vec![1, 2], vec![1, 3], vec![2, 3]]);
        assert_eq!(combinations(10, 2).len(), 45);
        assert!(combinations(2, 3).is_empty());
    }

    #[test]
    fn span_exclusion_leaves_thirty_seven_of_forty_five_splits() {
        let config = CpcvConfig::default();
        let plan = generate_splits(100, &config);
        assert_eq!(plan.n_candidates, 45);
        assert_eq!(plan.splits.len(), 37);
        assert_eq!(plan.n_skipped, 8);
        // Folds 2 and 8 keep 11 + 8 rows
        assert!(plan.splits.iter().all(|s| s.test_folds != vec![2, 8]));
        for split in &plan.splits {
            assert_eq!(split.test.len(), 20);
            assert!(split.train.iter().all(|i| !split.test.contains(i)));
        }
    }

    #[test]
    fn rows_between_separated_test_folds_never_train() {
        let plan = generate_splits(100, &CpcvConfig::default());
        // Folds 3 and 7: test [30,40) and [70,80), excluded span [21,82)
        let split = plan.splits.iter().find(|s| s.test_folds == vec![3, 7]).unwrap();
        for i in 21..82 {
            assert!(!split.train.contains(&i), "{i} should be excluded");
        }
        assert!(split.train.contains(&20));
        assert!(split.train.contains(&82));
        assert!(!split.train.contains(&50));
        assert_eq!(split.train.len(), 21 + 18);
        assert_eq!(split.test.len(), 20);
    }

    #[test]
    fn adjacent_test_folds_form_one_block() {
        let plan = generate_splits(100, &CpcvConfig::default());
        let split = plan.splits.iter().find(|s| s.test_folds == vec![4, 5]).unwrap();
        // One purge and one embargo only
        assert_eq!(split.train.len(), 100 - 20 - 9 - 2);
        assert!(split.train.contains(&30));
        assert!(split.train.contains(&62));
    }

    #[test]
    fn last_fold_takes_the_remainder() {
        assert_eq!(fold_bounds(105, 10, 9), (90, 105));
        assert_eq!(fold_bounds(105, 10, 0), (0, 10));
    }

    #[test]
    fn small_training_sets_are_skipped() {
        let config = CpcvConfig {
            min_train_size: 50,
            ..CpcvConfig::default()
        };
        let plan = generate_splits(70, &config);
        assert_eq!(plan.n_candidates, 45);
        assert!(plan.n_skipped > 0);
        assert_eq!(plan.n_skipped + plan.splits.len(), 45);
        // Folds 0 and 1 only lose the embargo
        assert!(plan.splits.iter().any(|s| s.test_folds == vec![0, 1]));
        assert!(plan.splits.iter().all(|s| s.train.len() >= 50));
    }

    // ─── Evaluation ──────────────────────────────────────────────

    #[test]
    fn fewer_than_sixty_observations_is_insufficient() {
        let panel = LeadLagScenario {
            n_periods: 50,
            ..LeadLagScenario::default()
        }
        .generate()
        .unwrap();
        let err = run_cpcv(
            &panel.matrix,
            &panel.target,
            BuilderKind::Pca,
            &BuilderParams::default(),
            &CompositeScorer::default(),
            &CpcvConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CpcvError::InsufficientObservations { n_observations: 50, required: 60 }
        ));
        assert!(err.is_insufficiency());
    }

    #[test]
    fn out_of_sample_signal_is_found() {
        let panel = LeadLagScenario {
            companion_noise: 0.2,
            ..LeadLagScenario::default()
        }
        .generate()
        .unwrap();
        let report = run_cpcv(
            &panel.matrix,
            &panel.target,
            BuilderKind::Pca,
            &BuilderParams::default(),
            &CompositeScorer::default(),
            &CpcvConfig::default(),
        )
        .unwrap();
        assert_eq!(report.n_candidates, 45);
        assert!(report.n_skipped > 0);
        assert_eq!(report.n_paths + report.n_skipped, 45);
        assert!(report.cws_mean > 0.5, "cws mean {}", report.cws_mean);
        assert!(report.best_path.cws >= report.worst_path.cws);
    }
}
