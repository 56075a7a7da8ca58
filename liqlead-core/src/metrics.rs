//! Directional metric primitives between an index and a target.
//!
//! Every metric works on a [`LaggedPair`]: the two series intersected on
//! their period keys, shifted so the index at period t is paired with the
//! target at t + lag, and stripped of missing pairs. Fewer than
//! [`MIN_PAIRS`] pairs leaves every metric undefined.
//!
//! Undefined is `None`, never `NaN`: a constant series has no direction,
//! no shape and no rank order, and callers must see that explicitly.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

use crate::series::TimeSeries;
use crate::stats;

/// Minimum aligned, non-missing pairs for any metric to be defined.
pub const MIN_PAIRS: usize = 3;

const NORM_EPS: f64 = 1e-10;

// ─── Alignment ───────────────────────────────────────────────────────

/// Index and target values paired at a lead of `lag` periods.
#[derive(Debug, Clone, PartialEq)]
pub struct LaggedPair {
    pub index: Vec<f64>,
    pub target: Vec<f64>,
    pub lag: usize,
}

impl LaggedPair {
    /// Align on common keys, shift, drop missing pairs.
    ///
    /// With lag k the last k index values and the first k target values
    /// fall away. Returns `None` with fewer than [`MIN_PAIRS`] pairs.
    pub fn new(index: &TimeSeries, target: &TimeSeries, lag: usize) -> Option<Self> {
        let (idx, tgt) = index.align(target);
        if idx.len() <= lag {
            return None;
        }
        let n = idx.len() - lag;
        let (index, target): (Vec<f64>, Vec<f64>) = idx[..n]
            .iter()
            .zip(&tgt[lag..])
            .filter(|(a, b)| a.is_finite() && b.is_finite())
            .map(|(a, b)| (*a, *b))
            .unzip();
        if index.len() < MIN_PAIRS {
            return None;
        }
        Some(Self { index, target, lag })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

fn diffs(x: &[f64]) -> Vec<f64> {
    x.windows(2).map(|w| w[1] - w[0]).collect()
}

fn sign(v: f64) -> i8 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}

// ─── Directional accuracy ────────────────────────────────────────────

/// Sign agreements and comparisons between first differences.
///
/// Two flat steps agree; a flat step against a move does not.
pub fn directional_hits(x: &[f64], y: &[f64]) -> (usize, usize) {
    let dx = diffs(x);
    let dy = diffs(y);
    let hits = dx
        .iter()
        .zip(&dy)
        .filter(|(a, b)| sign(**a) == sign(**b))
        .count();
    (hits, dx.len().min(dy.len()))
}

/// Mean directional accuracy in [0, 1]; 0.5 is chance.
pub fn mda(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() < MIN_PAIRS || x.len() != y.len() {
        return None;
    }
    let (hits, total) = directional_hits(x, y);
    Some(hits as f64 / total as f64)
}

/// One-sided binomial test of directional accuracy against chance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionalSignificance {
    pub mda: f64,
    pub hits: usize,
    pub n_directions: usize,
    /// P(hits >= observed) under Bin(n, 0.5).
    pub p_value: f64,
    pub significant: bool,
}

pub fn mda_significance(x: &[f64], y: &[f64], alpha: f64) -> Option<DirectionalSignificance> {
    let mda = mda(x, y)?;
    let (hits, n_directions) = directional_hits(x, y);
    let p_value = stats::binomial_sf(hits, n_directions, 0.5);
    Some(DirectionalSignificance {
        mda,
        hits,
        n_directions,
        p_value,
        significant: p_value < alpha,
    })
}

// ─── Shape-based distance ────────────────────────────────────────────

/// Zero mean, unit energy. `None` for a constant input.
fn unit_energy(x: &[f64]) -> Option<Vec<f64>> {
    let m = stats::mean(x);
    let centered: Vec<f64> = x.iter().map(|v| v - m).collect();
    let norm = centered.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm < NORM_EPS {
        return None;
    }
    Some(centered.into_iter().map(|v| v / norm).collect())
}

/// Full normalized cross-correlation via FFT, every shift in one buffer.
fn ncc_fft(x: &[f64], y: &[f64]) -> Vec<f64> {
    let size = (x.len() + y.len() - 1).next_power_of_two();
    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(size);
    let inverse = planner.plan_fft_inverse(size);

    let pad = |v: &[f64]| {
        let mut buf = vec![Complex::new(0.0, 0.0); size];
        for (slot, &val) in buf.iter_mut().zip(v) {
            slot.re = val;
        }
        buf
    };
    let mut fx = pad(x);
    let mut fy = pad(y);
    forward.process(&mut fx);
    forward.process(&mut fy);

    let mut cc: Vec<Complex<f64>> = fx.iter().zip(&fy).map(|(a, b)| a * b.conj()).collect();
    inverse.process(&mut cc);
    let scale = size as f64;
    cc.into_iter().map(|c| c.re / scale).collect()
}

/// Shape-based distance in [0, 2]; 0 means identical shape.
pub fn sbd(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() < MIN_PAIRS || x.len() != y.len() {
        return None;
    }
    let nx = unit_energy(x)?;
    let ny = unit_energy(y)?;
    let max_cc = ncc_fft(&nx, &ny)
        .into_iter()
        .fold(f64::NEG_INFINITY, f64::max);
    Some((1.0 - max_cc).clamp(0.0, 2.0))
}

// ─── Derivative cosine ───────────────────────────────────────────────

/// Cosine between first-difference vectors, in [-1, 1].
pub fn cosine_similarity_derivatives(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() < MIN_PAIRS || x.len() != y.len() {
        return None;
    }
    let dx = diffs(x);
    let dy = diffs(y);
    let nx = dx.iter().map(|v| v * v).sum::<f64>().sqrt();
    let ny = dy.iter().map(|v| v * v).sum::<f64>().sqrt();
    if nx < NORM_EPS || ny < NORM_EPS {
        return None;
    }
    let dot: f64 = dx.iter().zip(&dy).map(|(a, b)| a * b).sum();
    Some((dot / (nx * ny)).clamp(-1.0, 1.0))
}

// ─── Rank correlation ────────────────────────────────────────────────

/// Kendall tau-b with its two-sided asymptotic p-value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KendallTau {
    pub tau: f64,
    pub p_value: f64,
}

/// Tie-group sizes of a sample.
fn tie_groups(x: &[f64]) -> Vec<f64> {
    let s = stats::sorted(x);
    let mut groups = Vec::new();
    let mut run = 1usize;
    for w in s.windows(2) {
        if w[0] == w[1] {
            run += 1;
        } else {
            if run > 1 {
                groups.push(run as f64);
            }
            run = 1;
        }
    }
    if run > 1 {
        groups.push(run as f64);
    }
    groups
}

pub fn kendall_tau(x: &[f64], y: &[f64]) -> Option<KendallTau> {
    let n = x.len();
    if n < MIN_PAIRS || n != y.len() {
        return None;
    }

    let mut score = 0i64;
    for i in 0..n {
        for j in (i + 1)..n {
            let s = i64::from(sign(x[j] - x[i])) * i64::from(sign(y[j] - y[i]));
            score += s;
        }
    }

    let nf = n as f64;
    let n0 = nf * (nf - 1.0) / 2.0;
    let tx = tie_groups(x);
    let ty = tie_groups(y);
    let pairs = |g: &[f64]| g.iter().map(|t| t * (t - 1.0) / 2.0).sum::<f64>();
    let n1 = pairs(&tx);
    let n2 = pairs(&ty);
    let denom = ((n0 - n1) * (n0 - n2)).sqrt();
    if denom < NORM_EPS {
        return None;
    }
    let s = score as f64;
    let tau = (s / denom).clamp(-1.0, 1.0);

    let v = |g: &[f64]| g.iter().map(|t| t * (t - 1.0) * (2.0 * t + 5.0)).sum::<f64>();
    let t1 = |g: &[f64]| g.iter().map(|t| t * (t - 1.0)).sum::<f64>();
    let t2 = |g: &[f64]| g.iter().map(|t| t * (t - 1.0) * (t - 2.0)).sum::<f64>();
    let mut var = (nf * (nf - 1.0) * (2.0 * nf + 5.0) - v(&tx) - v(&ty)) / 18.0
        + t1(&tx) * t1(&ty) / (2.0 * nf * (nf - 1.0));
    if n > 2 {
        var += t2(&tx) * t2(&ty) / (9.0 * nf * (nf - 1.0) * (nf - 2.0));
    }
    let p_value = if var > 0.0 {
        let z = s / var.sqrt();
        stats::erfc(z.abs() / std::f64::consts::SQRT_2).clamp(0.0, 1.0)
    } else {
        1.0
    };
    Some(KendallTau { tau, p_value })
}

// ─── Linear correlation ──────────────────────────────────────────────

/// Pearson correlation; reporting and sign conventions only.
pub fn pearson_r(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() < MIN_PAIRS {
        return None;
    }
    stats::pearson(x, y)
}
