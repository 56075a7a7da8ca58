//! Multiple-comparison deflation of the best composite score.
//!
//! Trying several builders and keeping the best inflates the winner. The
//! expected maximum of N standard-normal draws, scaled by the spread across
//! candidates, is subtracted before testing against the chance level 0.5.
//!
//! The inflation estimate is a heuristic, kept behind [`ScoreDeflator`] so a
//! permutation-based estimate can replace it.

use serde::{Deserialize, Serialize};

use liqlead_core::stats::{normal_cdf, std_population};

/// Composite score expected from a directionless index.
pub const NULL_SCORE: f64 = 0.5;

/// Spread assumed when only one score is available.
const SINGLE_SCORE_STD: f64 = 0.1;

const SPREAD_EPS: f64 = 1e-10;

const SIGNIFICANCE_LEVEL: f64 = 0.05;

// ─── Deflators ───────────────────────────────────────────────────────

/// Expected inflation of the best of `n` tries, in standard deviations.
pub trait ScoreDeflator: Send + Sync {
    fn expected_max_inflation(&self, n_methods: usize) -> f64;
}

/// Large-N expected maximum of standard normals, `sqrt(2 ln N)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsymptoticMaxDeflator;

impl ScoreDeflator for AsymptoticMaxDeflator {
    fn expected_max_inflation(&self, n_methods: usize) -> f64 {
        expected_max_inflation(n_methods)
    }
}

/// `sqrt(2 ln n)`, zero for a single try.
pub fn expected_max_inflation(n: usize) -> f64 {
    if n > 1 {
        (2.0 * (n as f64).ln()).sqrt()
    } else {
        0.0
    }
}

// ─── Deflated score ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeflatedScore {
    pub best_score: f64,
    pub mean_score: f64,
    pub score_std: f64,
    pub expected_max_shift: f64,
    pub deflated_score: f64,
    pub p_value: f64,
    pub significant: bool,
    pub n_methods: usize,
    pub n_observations: usize,
}

/// Deflate with the asymptotic expected-maximum heuristic.
pub fn deflated_score(scores: &[f64], n_methods: usize, n_observations: usize) -> DeflatedScore {
    deflate_with(&AsymptoticMaxDeflator, scores, n_methods, n_observations)
}

pub fn deflate_with(
    deflator: &dyn ScoreDeflator,
    scores: &[f64],
    n_methods: usize,
    n_observations: usize,
) -> DeflatedScore {
    if scores.is_empty() {
        return DeflatedScore {
            best_score: 0.0,
            mean_score: 0.0,
            score_std: 0.0,
            expected_max_shift: 0.0,
            deflated_score: 0.0,
            p_value: 1.0,
            significant: false,
            n_methods,
            n_observations,
        };
    }

    let best_score = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean_score = scores.iter().sum::<f64>() / scores.len() as f64;
    let score_std = if scores.len() > 1 {
        std_population(scores)
    } else {
        SINGLE_SCORE_STD
    };
    let expected_max_shift = deflator.expected_max_inflation(n_methods);

    let deflated = if score_std > SPREAD_EPS {
        let z = (best_score - NULL_SCORE) / score_std - expected_max_shift;
        NULL_SCORE + z * score_std
    } else {
        best_score
    };

    let se = score_std / (n_observations.max(1) as f64).sqrt();
    let p_value = if se > SPREAD_EPS {
        1.0 - normal_cdf((deflated - NULL_SCORE) / se)
    } else if deflated > NULL_SCORE {
        0.0
    } else {
        1.0
    };

    tracing::info!(
        best_score,
        deflated,
        p_value,
        n_methods,
        "deflated score"
    );
    DeflatedScore {
        best_score,
        mean_score,
        score_std,
        expected_max_shift,
        deflated_score: deflated,
        p_value,
        significant: p_value < SIGNIFICANCE_LEVEL,
        n_methods,
        n_observations,
    }
}
