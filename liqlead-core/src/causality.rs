//! Granger-style lead/lag significance and a unit-root pre-check.
//!
//! Both directions are tested over lags `1..=max_lag` with the SSR F-test:
//! a restricted autoregression of the effect on its own lags against an
//! unrestricted one that adds lags of the cause. A direction's summary is its
//! minimum p-value across lags.
//!
//! The stationarity check is diagnostic only; it never gates the causality
//! test.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::series::TimeSeries;
use crate::stats;

/// Observations required beyond `max_lag` before any F-test runs.
pub const MIN_EXTRA_OBSERVATIONS: usize = 10;

/// Minimum observations for the unit-root test.
pub const MIN_STATIONARITY_OBSERVATIONS: usize = 20;

// ─── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CausalityConfig {
    pub max_lag: usize,
    pub alpha: f64,
}

impl Default for CausalityConfig {
    fn default() -> Self {
        Self {
            max_lag: 12,
            alpha: 0.05,
        }
    }
}

// ─── Result types ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CausalityStatus {
    Tested,
    InsufficientData { n_observations: usize, required: usize },
}

/// One direction of the test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionResult {
    pub status: CausalityStatus,
    /// `(lag, p_value)` for every lag that could be fitted.
    pub p_values: Vec<(usize, f64)>,
    pub best_p: Option<f64>,
    pub best_lag: Option<usize>,
    pub significant: bool,
}

impl DirectionResult {
    fn insufficient(n_observations: usize, required: usize) -> Self {
        Self {
            status: CausalityStatus::InsufficientData {
                n_observations,
                required,
            },
            p_values: Vec::new(),
            best_p: None,
            best_lag: None,
            significant: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalityResult {
    /// Index → target.
    pub forward: DirectionResult,
    /// Target → index.
    pub reverse: DirectionResult,
    /// Forward significant and reverse not.
    pub unidirectional: bool,
    pub n_observations: usize,
    pub max_lag: usize,
}

// ─── OLS ─────────────────────────────────────────────────────────────

struct OlsFit {
    beta: DVector<f64>,
    rss: f64,
    xtx_inv: DMatrix<f64>,
}

fn ols(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<OlsFit> {
    let xtx = x.transpose() * x;
    let xtx_inv = xtx.try_inverse()?;
    let beta = &xtx_inv * (x.transpose() * y);
    let residuals = y - x * &beta;
    let rss = residuals.iter().map(|r| r * r).sum();
    Some(OlsFit { beta, rss, xtx_inv })
}

// ─── Granger ─────────────────────────────────────────────────────────

/// SSR F-test p-value that `cause` helps predict `effect` at `lag`.
fn granger_p_value(effect: &[f64], cause: &[f64], lag: usize) -> Option<f64> {
    let n = effect.len();
    let n_obs = n.checked_sub(lag)?;
    let k_unrestricted = 2 * lag + 1;
    if n_obs <= k_unrestricted {
        return None;
    }

    let y = DVector::from_iterator(n_obs, (lag..n).map(|t| effect[t]));
    let restricted = DMatrix::from_fn(n_obs, lag + 1, |r, c| {
        let t = r + lag;
        if c == 0 {
            1.0
        } else {
            effect[t - c]
        }
    });
    let unrestricted = DMatrix::from_fn(n_obs, k_unrestricted, |r, c| {
        let t = r + lag;
        match c {
            0 => 1.0,
            c if c <= lag => effect[t - c],
            c => cause[t - (c - lag)],
        }
    });

    let rss_r = ols(&restricted, &y)?.rss;
    let rss_u = ols(&unrestricted, &y)?.rss;
    let df_num = lag as f64;
    let df_den = (n_obs - k_unrestricted) as f64;

    if rss_u <= f64::EPSILON * rss_r.max(1.0) {
        return Some(if rss_r > rss_u { 0.0 } else { 1.0 });
    }
    let f = ((rss_r - rss_u).max(0.0) / df_num) / (rss_u / df_den);
    let p = stats::f_sf(f, df_num, df_den);
    p.is_finite().then_some(p)
}

fn test_direction(effect: &[f64], cause: &[f64], config: &CausalityConfig) -> DirectionResult {
    let p_values: Vec<(usize, f64)> = (1..=config.max_lag)
        .filter_map(|lag| granger_p_value(effect, cause, lag).map(|p| (lag, p)))
        .collect();
    let best = p_values
        .iter()
        .copied()
        .fold(None, |acc: Option<(usize, f64)>, (lag, p)| match acc {
            Some((_, bp)) if bp <= p => acc,
            _ => Some((lag, p)),
        });
    DirectionResult {
        status: CausalityStatus::Tested,
        significant: best.map_or(false, |(_, p)| p < config.alpha),
        best_lag: best.map(|(lag, _)| lag),
        best_p: best.map(|(_, p)| p),
        p_values,
    }
}

/// Test index → target and target → index.
pub fn granger_bidirectional(
    index: &TimeSeries,
    target: &TimeSeries,
    config: &CausalityConfig,
) -> CausalityResult {
    let (idx, tgt) = index.align(target);
    let (idx, tgt): (Vec<f64>, Vec<f64>) = idx
        .into_iter()
        .zip(tgt)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .unzip();
    let n = idx.len();
    let required = config.max_lag + MIN_EXTRA_OBSERVATIONS;

    if n < required {
        tracing::warn!(n, required, "granger test skipped: insufficient data");
        return CausalityResult {
            forward: DirectionResult::insufficient(n, required),
            reverse: DirectionResult::insufficient(n, required),
            unidirectional: false,
            n_observations: n,
            max_lag: config.max_lag,
        };
    }

    let forward = test_direction(&tgt, &idx, config);
    let reverse = test_direction(&idx, &tgt, config);
    let unidirectional = forward.significant && !reverse.significant;
    tracing::debug!(
        forward_p = ?forward.best_p,
        reverse_p = ?reverse.best_p,
        unidirectional,
        "granger test complete"
    );

    CausalityResult {
        forward,
        reverse,
        unidirectional,
        n_observations: n,
        max_lag: config.max_lag,
    }
}

// ─── Augmented Dickey-Fuller ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationarityResult {
    pub n_observations: usize,
    /// `None` when the series is too short or the regression is singular.
    pub adf_statistic: Option<f64>,
    pub p_value: Option<f64>,
    pub used_lag: Option<usize>,
    /// 1%, 5%, 10% critical values for the constant-only regression.
    pub critical_values: Option<[f64; 3]>,
    pub is_stationary: bool,
}

/// MacKinnon (1994) approximate p-value, constant-only regression, one series.
pub fn mackinnon_p_value(tau: f64) -> f64 {
    const TAU_MAX: f64 = 2.74;
    const TAU_MIN: f64 = -18.83;
    const TAU_STAR: f64 = -1.61;
    const SMALL_P: [f64; 3] = [2.1659, 1.4412, 0.038269];
    const LARGE_P: [f64; 4] = [1.7339, 0.93202, -0.12745, -0.010368];

    if tau > TAU_MAX {
        return 1.0;
    }
    if tau < TAU_MIN {
        return 0.0;
    }
    let coeffs: &[f64] = if tau <= TAU_STAR { &SMALL_P } else { &LARGE_P };
    let poly = coeffs.iter().rev().fold(0.0, |acc, c| acc * tau + c);
    stats::normal_cdf(poly)
}

/// MacKinnon (2010) finite-sample critical values, constant-only regression.
fn critical_values(nobs: usize) -> [f64; 3] {
    let t = nobs as f64;
    [
        -3.43035 - 6.5393 / t - 16.786 / t.powi(2) - 79.433 / t.powi(3),
        -2.86154 - 2.8903 / t - 4.234 / t.powi(2) - 40.040 / t.powi(3),
        -2.56677 - 1.5384 / t - 2.809 / t.powi(2),
    ]
}

/// Regression of Δx_t on [1, x_{t-1}, Δx_{t-1}, ..., Δx_{t-lags}] over the
/// last `nobs` differences.
fn adf_design(x: &[f64], lags: usize, nobs: usize) -> (DMatrix<f64>, DVector<f64>) {
    let dx: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();
    let start = dx.len() - nobs;
    let y = DVector::from_iterator(nobs, dx[start..].iter().copied());
    let design = DMatrix::from_fn(nobs, lags + 2, |r, c| {
        let j = start + r;
        match c {
            0 => 1.0,
            1 => x[j],
            c => dx[j - (c - 1)],
        }
    });
    (design, y)
}

fn aic(rss: f64, nobs: usize, k: usize) -> f64 {
    let n = nobs as f64;
    let llf = -n / 2.0 * ((2.0 * std::f64::consts::PI).ln() + (rss / n).ln() + 1.0);
    -2.0 * llf + 2.0 * k as f64
}

/// Augmented Dickey-Fuller test with constant, lag order by AIC.
pub fn stationarity_check(series: &TimeSeries) -> StationarityResult {
    let x: Vec<f64> = series.values().iter().copied().filter(|v| v.is_finite()).collect();
    let n = x.len();
    let mut result = StationarityResult {
        n_observations: n,
        adf_statistic: None,
        p_value: None,
        used_lag: None,
        critical_values: None,
        is_stationary: false,
    };
    if n < MIN_STATIONARITY_OBSERVATIONS {
        return result;
    }

    let schwert = (12.0 * (n as f64 / 100.0).powf(0.25)).ceil() as usize;
    let max_lag = schwert.min(n / 2 - 2);

    // Lag search on a common sample
    let search_nobs = n - 1 - max_lag;
    let best_lag = (0..=max_lag)
        .filter_map(|lags| {
            let (design, y) = adf_design(&x, lags, search_nobs);
            let k = design.ncols();
            ols(&design, &y).map(|fit| (lags, aic(fit.rss, search_nobs, k)))
        })
        .filter(|(_, a)| a.is_finite())
        .fold(None, |acc: Option<(usize, f64)>, (lags, a)| match acc {
            Some((_, best)) if best <= a => acc,
            _ => Some((lags, a)),
        })
        .map(|(lags, _)| lags);

    let Some(lags) = best_lag else {
        return result;
    };
    let nobs = n - 1 - lags;
    let (design, y) = adf_design(&x, lags, nobs);
    let Some(fit) = ols(&design, &y) else {
        return result;
    };
    let dof = nobs.saturating_sub(design.ncols());
    if dof == 0 {
        return result;
    }
    let sigma2 = fit.rss / dof as f64;
    let se = (sigma2 * fit.xtx_inv[(1, 1)]).sqrt();
    if !(se.is_finite() && se > 0.0) {
        return result;
    }
    let tau = fit.beta[1] / se;
    let p = mackinnon_p_value(tau);

    result.adf_statistic = Some(tau);
    result.p_value = Some(p);
    result.used_lag = Some(lags);
    result.critical_values = Some(critical_values(nobs));
    result.is_stationary = p < 0.05;
    result
}
