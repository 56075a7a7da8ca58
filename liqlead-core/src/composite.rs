//! Composite waveform score (CWS) and lag search.
//!
//! CWS blends four directional metrics into one value in [0, 1]:
//!
//! | metric                 | scaling          | undefined → |
//! |------------------------|------------------|-------------|
//! | directional accuracy   | as-is            | 0.5         |
//! | shape distance         | max(0, 1 − sbd)  | 0.0         |
//! | derivative cosine      | (cos + 1) / 2    | 0.5         |
//! | Kendall tau            | (tau + 1) / 2    | 0.5         |
//!
//! Pearson correlation is reported alongside but never enters the score.

use serde::{Deserialize, Serialize};

use crate::metrics::{self, LaggedPair};
use crate::series::TimeSeries;

// ─── Configuration ───────────────────────────────────────────────────

/// Fixed blend weights. Not learned.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveformWeights {
    pub mda: f64,
    pub sbd: f64,
    pub cosine: f64,
    pub tau: f64,
}

impl Default for WaveformWeights {
    fn default() -> Self {
        Self {
            mda: 0.4,
            sbd: 0.3,
            cosine: 0.2,
            tau: 0.1,
        }
    }
}

impl WaveformWeights {
    pub fn sum(&self) -> f64 {
        self.mda + self.sbd + self.cosine + self.tau
    }

    pub fn all_non_negative(&self) -> bool {
        [self.mda, self.sbd, self.cosine, self.tau]
            .iter()
            .all(|w| *w >= 0.0)
    }
}

// ─── Result types ────────────────────────────────────────────────────

/// All metrics at one lag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagMetrics {
    pub lag: usize,
    /// Aligned pairs the metrics were computed on (0 when undefined).
    pub n_pairs: usize,
    pub pearson_r: Option<f64>,
    pub mda: Option<f64>,
    pub sbd: Option<f64>,
    pub cosine_sim: Option<f64>,
    pub kendall_tau: Option<f64>,
    pub kendall_p: Option<f64>,
    pub cws: f64,
}

/// One row per lag in `[0, max_lag]`, in lag order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagProfile {
    pub rows: Vec<LagMetrics>,
}

impl LagProfile {
    /// Row with the highest CWS; first occurrence wins ties.
    pub fn best(&self) -> Option<&LagMetrics> {
        let mut best: Option<&LagMetrics> = None;
        for row in &self.rows {
            if best.map_or(true, |b| row.cws > b.cws) {
                best = Some(row);
            }
        }
        best
    }

    /// Row with the highest defined Pearson correlation.
    pub fn peak_pearson(&self) -> Option<&LagMetrics> {
        let mut best: Option<(&LagMetrics, f64)> = None;
        for row in &self.rows {
            if let Some(r) = row.pearson_r {
                if best.map_or(true, |(_, b)| r > b) {
                    best = Some((row, r));
                }
            }
        }
        best.map(|(row, _)| row)
    }

    /// Pearson is defined and positive at every lag.
    pub fn all_pearson_positive(&self) -> bool {
        !self.rows.is_empty()
            && self
                .rows
                .iter()
                .all(|r| r.pearson_r.map_or(false, |p| p > 0.0))
    }

    pub fn at(&self, lag: usize) -> Option<&LagMetrics> {
        self.rows.iter().find(|r| r.lag == lag)
    }
}

/// Result of the lag search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimalLag {
    pub optimal_lag: usize,
    pub best_cws: f64,
    pub profile: LagProfile,
}

/// Pearson profile across lags: the reporting view used by acceptance checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossCorrelation {
    pub pearson_by_lag: Vec<(usize, Option<f64>)>,
    pub all_positive: bool,
    pub peak_lag: Option<usize>,
    pub peak_r: Option<f64>,
}

impl From<&LagProfile> for CrossCorrelation {
    fn from(profile: &LagProfile) -> Self {
        let peak = profile.peak_pearson();
        Self {
            pearson_by_lag: profile.rows.iter().map(|r| (r.lag, r.pearson_r)).collect(),
            all_positive: profile.all_pearson_positive(),
            peak_lag: peak.map(|r| r.lag),
            peak_r: peak.and_then(|r| r.pearson_r),
        }
    }
}

/// One candidate's standing in a method comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodScore {
    pub method: String,
    pub optimal_lag: usize,
    pub best_cws: f64,
    pub mda_at_optimal: Option<f64>,
    pub pearson_at_optimal: Option<f64>,
}

// ─── Scorer ──────────────────────────────────────────────────────────

/// Scores an index against a target over the lag grid `[0, max_lag]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompositeScorer {
    pub weights: WaveformWeights,
    pub max_lag: usize,
}

impl Default for CompositeScorer {
    fn default() -> Self {
        Self {
            weights: WaveformWeights::default(),
            max_lag: 15,
        }
    }
}

impl CompositeScorer {
    pub fn new(weights: WaveformWeights, max_lag: usize) -> Self {
        Self { weights, max_lag }
    }

    /// Same weights, different lag bound.
    pub fn with_max_lag(self, max_lag: usize) -> Self {
        Self { max_lag, ..self }
    }

    /// Blend already-computed metrics, substituting neutral values.
    pub fn blend(
        &self,
        mda: Option<f64>,
        sbd: Option<f64>,
        cosine: Option<f64>,
        tau: Option<f64>,
    ) -> f64 {
        let w = &self.weights;
        let mda_n = mda.unwrap_or(0.5);
        let sbd_n = sbd.map_or(0.0, |d| (1.0 - d).max(0.0));
        let cos_n = cosine.map_or(0.5, |c| (c + 1.0) / 2.0);
        let tau_n = tau.map_or(0.5, |t| (t + 1.0) / 2.0);
        (w.mda * mda_n + w.sbd * sbd_n + w.cosine * cos_n + w.tau * tau_n).clamp(0.0, 1.0)
    }

    /// All metrics and the CWS at one lag.
    pub fn calculate(&self, index: &TimeSeries, target: &TimeSeries, lag: usize) -> LagMetrics {
        match LaggedPair::new(index, target, lag) {
            Some(pair) => self.calculate_pair(&pair),
            None => LagMetrics {
                lag,
                n_pairs: 0,
                pearson_r: None,
                mda: None,
                sbd: None,
                cosine_sim: None,
                kendall_tau: None,
                kendall_p: None,
                cws: self.blend(None, None, None, None),
            },
        }
    }

    fn calculate_pair(&self, pair: &LaggedPair) -> LagMetrics {
        let (x, y) = (&pair.index, &pair.target);
        let mda = metrics::mda(x, y);
        let sbd = metrics::sbd(x, y);
        let cosine_sim = metrics::cosine_similarity_derivatives(x, y);
        let kendall = metrics::kendall_tau(x, y);
        let kendall_tau = kendall.map(|k| k.tau);
        LagMetrics {
            lag: pair.lag,
            n_pairs: pair.len(),
            pearson_r: metrics::pearson_r(x, y),
            mda,
            sbd,
            cosine_sim,
            kendall_tau,
            kendall_p: kendall.map(|k| k.p_value),
            cws: self.blend(mda, sbd, cosine_sim, kendall_tau),
        }
    }

    /// Metrics at every lag in `[0, max_lag]`.
    pub fn profile(&self, index: &TimeSeries, target: &TimeSeries) -> LagProfile {
        LagProfile {
            rows: (0..=self.max_lag)
                .map(|lag| self.calculate(index, target, lag))
                .collect(),
        }
    }

    /// Lag with the highest CWS, plus the full profile.
    pub fn optimal_lag(&self, index: &TimeSeries, target: &TimeSeries) -> OptimalLag {
        let profile = self.profile(index, target);
        let (optimal_lag, best_cws) = profile
            .best()
            .map_or((0, self.blend(None, None, None, None)), |b| (b.lag, b.cws));
        OptimalLag {
            optimal_lag,
            best_cws,
            profile,
        }
    }

    /// Rank candidate indices by best CWS, highest first. Stable on ties.
    pub fn compare_methods(
        &self,
        candidates: &[(String, TimeSeries)],
        target: &TimeSeries,
    ) -> Vec<MethodScore> {
        let mut scores: Vec<MethodScore> = candidates
            .iter()
            .map(|(method, index)| {
                let opt = self.optimal_lag(index, target);
                let row = opt.profile.at(opt.optimal_lag);
                MethodScore {
                    method: method.clone(),
                    optimal_lag: opt.optimal_lag,
                    best_cws: opt.best_cws,
                    mda_at_optimal: row.and_then(|r| r.mda),
                    pearson_at_optimal: row.and_then(|r| r.pearson_r),
                }
            })
            .collect();
        scores.sort_by(|a, b| b.best_cws.total_cmp(&a.best_cws));
        scores
    }
}
