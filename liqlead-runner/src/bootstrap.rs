//! Block bootstrap stability analysis of loadings and optimal lag.
//!
//! Fixed-length blocks keep the serial dependence of monthly macro data.
//! Block starts are drawn uniformly and blocks are concatenated until the
//! resample reaches the original length, truncating the last block.
//!
//! Key design choices:
//! - Block length 12 periods (one year) keeps annual seasonality intact.
//! - Each resample draws from its own `RngHierarchy` sub-seed, so the
//!   parallel fan-out is identical to a sequential run.
//! - Fits that fail are discarded; fewer than 10 survivors is reported as
//!   insufficient, never as a confidence interval.

use std::collections::BTreeMap;

use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use liqlead_core::builders::{
    ensure_target_blind, sign_correct, BuildError, Builder, BuilderKind, BuilderParams,
    IndexBuilder,
};
use liqlead_core::composite::CompositeScorer;
use liqlead_core::matrix::VariableMatrix;
use liqlead_core::rng::RngHierarchy;
use liqlead_core::series::TimeSeries;
use liqlead_core::stats::{mean, percentile_sorted, sorted};

use crate::aligned::AlignedSample;

// ─── Configuration ───────────────────────────────────────────────────

/// Configuration for block bootstrap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Loading-stability resamples (default 1000).
    pub n_resamples: usize,
    /// Block length in periods (default 12).
    pub block_length: usize,
    /// Lag-stability resample cap (default 200).
    pub lag_resample_cap: usize,
    /// Two-sided percentile interval level (default 0.95).
    pub confidence_level: f64,
    /// Fewest valid resamples that still yield an interval (default 10).
    pub min_valid: usize,
    /// Anchor-largest rate that counts as "always" (default 0.95).
    pub anchor_max_threshold: f64,
    /// RNG seed for reproducibility.
    pub seed: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            n_resamples: 1000,
            block_length: 12,
            lag_resample_cap: 200,
            confidence_level: 0.95,
            min_valid: 10,
            anchor_max_threshold: 0.95,
            seed: 42,
        }
    }
}

impl BootstrapConfig {
    /// Lower and upper percentile (0–100) of the interval.
    fn percentiles(&self) -> (f64, f64) {
        let alpha = 1.0 - self.confidence_level;
        (alpha / 2.0 * 100.0, (1.0 - alpha / 2.0) * 100.0)
    }
}

// ─── Result types ────────────────────────────────────────────────────

/// Percentile interval of one variable's loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadingInterval {
    pub mean: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub excludes_zero: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadingStabilityReport {
    pub anchor: String,
    pub variables: BTreeMap<String, LoadingInterval>,
    /// Share of valid resamples where the anchor has the largest |loading|.
    pub anchor_max_rate: f64,
    pub anchor_always_max: bool,
    pub n_valid: usize,
    pub n_resamples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadingStability {
    Stable(LoadingStabilityReport),
    Insufficient { n_valid: usize, required: usize },
}

impl LoadingStability {
    /// Whether the anchor's interval excludes zero; `None` when insufficient.
    pub fn anchor_ci_excludes_zero(&self) -> Option<bool> {
        match self {
            LoadingStability::Stable(r) => r.variables.get(&r.anchor).map(|v| v.excludes_zero),
            LoadingStability::Insufficient { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagStabilityReport {
    pub mean_lag: f64,
    pub median_lag: f64,
    /// Most frequent lag; the smaller lag wins ties.
    pub mode_lag: usize,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub n_samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LagStability {
    Stable(LagStabilityReport),
    Insufficient { n_valid: usize, required: usize },
}

/// Errors from bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("builder input rejected: {0}")]
    Rejected(#[from] BuildError),
}

// ─── Resampling ──────────────────────────────────────────────────────

/// Indices of one fixed-length block bootstrap resample of `0..n`.
pub fn block_bootstrap_indices<R: Rng + ?Sized>(n: usize, block_length: usize, rng: &mut R) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let len = block_length.clamp(1, n);
    let mut indices = Vec::with_capacity(n + len);
    while indices.len() < n {
        let start = rng.gen_range(0..=n - len);
        indices.extend(start..start + len);
    }
    indices.truncate(n);
    indices
}

// ─── Loading stability ───────────────────────────────────────────────

/// Refit `kind` on block resamples of the complete rows and summarize the
/// anchor-positive loadings.
pub fn loading_stability(
    matrix: &VariableMatrix,
    kind: BuilderKind,
    params: &BuilderParams,
    config: &BootstrapConfig,
) -> Result<LoadingStability, BootstrapError> {
    ensure_target_blind(matrix)?;
    let complete = matrix.complete_rows();
    let n = complete.n_rows();
    let columns = complete.columns().to_vec();
    let anchor = complete.anchor_column().to_string();
    let anchor_idx = complete.column_index(&anchor).unwrap_or(0);
    let hierarchy = RngHierarchy::new(config.seed);

    let samples: Vec<Vec<f64>> = (0..config.n_resamples)
        .into_par_iter()
        .filter_map(|b| {
            let mut rng = hierarchy.rng_for("loading_bootstrap", b as u64);
            let idx = block_bootstrap_indices(n, config.block_length, &mut rng);
            let resampled = complete.select_rows(&idx).with_sequential_dates();
            let mut builder = Builder::new(kind, params);
            match builder.build(&resampled) {
                Ok(out) if !out.diagnostics.converged() => {
                    tracing::debug!(resample = b, "bootstrap fit discarded: not converged");
                    None
                }
                Ok(out) => {
                    let mut loadings: Vec<f64> = columns
                        .iter()
                        .map(|c| out.loadings.get(c).copied().unwrap_or(0.0))
                        .collect();
                    if loadings[anchor_idx] < 0.0 {
                        loadings.iter_mut().for_each(|l| *l = -*l);
                    }
                    loadings.iter().all(|l| l.is_finite()).then_some(loadings)
                }
                Err(e) => {
                    tracing::debug!(resample = b, error = %e, "bootstrap fit discarded");
                    None
                }
            }
        })
        .collect();

    let n_valid = samples.len();
    if n_valid < config.min_valid {
        tracing::warn!(n_valid, required = config.min_valid, "loading stability: too few valid resamples");
        return Ok(LoadingStability::Insufficient {
            n_valid,
            required: config.min_valid,
        });
    }

    let anchor_max = samples
        .iter()
        .filter(|s| {
            let mut best = 0;
            for (j, l) in s.iter().enumerate() {
                if l.abs() > s[best].abs() {
                    best = j;
                }
            }
            best == anchor_idx
        })
        .count();
    let anchor_max_rate = anchor_max as f64 / n_valid as f64;

    let (lo_pct, hi_pct) = config.percentiles();
    let variables = columns
        .iter()
        .enumerate()
        .map(|(j, name)| {
            let values: Vec<f64> = samples.iter().map(|s| s[j]).collect();
            let ordered = sorted(&values);
            let ci_lower = percentile_sorted(&ordered, lo_pct);
            let ci_upper = percentile_sorted(&ordered, hi_pct);
            let interval = LoadingInterval {
                mean: mean(&values),
                ci_lower,
                ci_upper,
                excludes_zero: ci_lower > 0.0 || ci_upper < 0.0,
            };
            (name.clone(), interval)
        })
        .collect();

    tracing::info!(
        n_valid,
        anchor = %anchor,
        anchor_max_rate,
        "loading stability complete"
    );
    Ok(LoadingStability::Stable(LoadingStabilityReport {
        anchor,
        variables,
        anchor_max_rate,
        anchor_always_max: anchor_max_rate >= config.anchor_max_threshold,
        n_valid,
        n_resamples: config.n_resamples,
    }))
}

// ─── Lag stability ───────────────────────────────────────────────────

/// Distribution of the composite-optimal lag over block resamples of the
/// jointly resampled inputs and target.
pub fn lag_stability(
    matrix: &VariableMatrix,
    target: &TimeSeries,
    kind: BuilderKind,
    params: &BuilderParams,
    scorer: &CompositeScorer,
    config: &BootstrapConfig,
) -> Result<LagStability, BootstrapError> {
    ensure_target_blind(matrix)?;
    let sample = AlignedSample::new(matrix, target);
    let n = sample.len();
    let anchor = sample.matrix.anchor_column().to_string();
    let hierarchy = RngHierarchy::new(config.seed);
    let count = config.n_resamples.min(config.lag_resample_cap);

    let lags: Vec<usize> = (0..count)
        .into_par_iter()
        .filter_map(|b| {
            let mut rng = hierarchy.rng_for("lag_bootstrap", b as u64);
            let idx = block_bootstrap_indices(n, config.block_length, &mut rng);
            let (resampled, boot_target) = sample.resample(&idx).ok()?;
            let mut builder = Builder::new(kind, params);
            let out = match builder.build(&resampled) {
                Ok(out) if !out.diagnostics.converged() => {
                    tracing::debug!(resample = b, "lag bootstrap fit discarded: not converged");
                    return None;
                }
                Ok(out) => out,
                Err(e) => {
                    tracing::debug!(resample = b, error = %e, "lag bootstrap fit discarded");
                    return None;
                }
            };
            let index = match resampled.column(&anchor) {
                Some(a) => sign_correct(&out.index, &a).0,
                None => out.index,
            };
            Some(scorer.optimal_lag(&index, &boot_target).optimal_lag)
        })
        .collect();

    let n_samples = lags.len();
    if n_samples < config.min_valid {
        tracing::warn!(n_samples, required = config.min_valid, "lag stability: too few valid resamples");
        return Ok(LagStability::Insufficient {
            n_valid: n_samples,
            required: config.min_valid,
        });
    }

    let values: Vec<f64> = lags.iter().map(|&l| l as f64).collect();
    let ordered = sorted(&values);
    let (lo_pct, hi_pct) = config.percentiles();
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for &l in &lags {
        *counts.entry(l).or_default() += 1;
    }
    let mut mode_lag = 0;
    let mut mode_count = 0;
    for (&lag, &c) in &counts {
        if c > mode_count {
            mode_lag = lag;
            mode_count = c;
        }
    }

    let report = LagStabilityReport {
        mean_lag: mean(&values),
        median_lag: percentile_sorted(&ordered, 50.0),
        mode_lag,
        ci_lower: percentile_sorted(&ordered, lo_pct),
        ci_upper: percentile_sorted(&ordered, hi_pct),
        n_samples,
    };
    tracing::info!(n_samples, mode_lag, mean_lag = report.mean_lag, "lag stability complete");
    Ok(LagStability::Stable(report))
}
