//! Pass/fail table against fixed acceptance thresholds.
//!
//! A sub-result that is missing or insufficient fails its check.

use serde::{Deserialize, Serialize};

use liqlead_core::causality::CausalityResult;
use liqlead_core::composite::LagProfile;

use crate::bootstrap::LoadingStability;
use crate::cpcv::CpcvReport;

// ─── Thresholds ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptanceThresholds {
    /// Directional accuracy at the peak-correlation lag (default 0.60).
    pub min_mda: f64,
    /// Forward Granger p-value ceiling (default 0.05).
    pub max_granger_p: f64,
    /// Mean out-of-sample composite score floor (default 0.15).
    pub min_cpcv_mean: f64,
}

impl Default for AcceptanceThresholds {
    fn default() -> Self {
        Self {
            min_mda: 0.60,
            max_granger_p: 0.05,
            min_cpcv_mean: 0.15,
        }
    }
}

// ─── Checks ──────────────────────────────────────────────────────────

/// A numeric check; `actual` is `None` when the input was unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCheck {
    pub threshold: f64,
    pub actual: Option<f64>,
    pub passed: bool,
}

impl ThresholdCheck {
    fn at_least(threshold: f64, actual: Option<f64>) -> Self {
        Self {
            threshold,
            actual,
            passed: actual.is_some_and(|a| a >= threshold),
        }
    }

    fn at_most(threshold: f64, actual: Option<f64>) -> Self {
        Self {
            threshold,
            actual,
            passed: actual.is_some_and(|a| a <= threshold),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagCheck {
    pub actual: Option<bool>,
    pub passed: bool,
}

impl FlagCheck {
    fn new(actual: Option<bool>) -> Self {
        Self {
            actual,
            passed: actual == Some(true),
        }
    }
}

// ─── Report ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceReport {
    pub min_mda: ThresholdCheck,
    pub all_lags_positive: FlagCheck,
    pub bootstrap_anchor_ci_excludes_zero: FlagCheck,
    pub granger_forward_p: ThresholdCheck,
    pub cpcv_mean: ThresholdCheck,
    pub overall: bool,
}

impl AcceptanceReport {
    /// Names of the checks that failed.
    pub fn failures(&self) -> Vec<&'static str> {
        [
            ("min_mda", self.min_mda.passed),
            ("all_lags_positive", self.all_lags_positive.passed),
            ("bootstrap_anchor_ci_excludes_zero", self.bootstrap_anchor_ci_excludes_zero.passed),
            ("granger_forward_p", self.granger_forward_p.passed),
            ("cpcv_mean", self.cpcv_mean.passed),
        ]
        .into_iter()
        .filter(|(_, passed)| !passed)
        .map(|(name, _)| name)
        .collect()
    }
}

// ─── Evaluation ──────────────────────────────────────────────────────

impl AcceptanceThresholds {
    pub fn evaluate(
        &self,
        profile: &LagProfile,
        causality: &CausalityResult,
        loadings: &LoadingStability,
        cpcv: Option<&CpcvReport>,
    ) -> AcceptanceReport {
        let mda_at_peak = profile.peak_pearson().and_then(|row| row.mda);
        let all_positive = (!profile.rows.is_empty()).then(|| profile.all_pearson_positive());

        let min_mda = ThresholdCheck::at_least(self.min_mda, mda_at_peak);
        let all_lags_positive = FlagCheck::new(all_positive);
        let bootstrap_anchor_ci_excludes_zero = FlagCheck::new(loadings.anchor_ci_excludes_zero());
        let granger_forward_p = ThresholdCheck::at_most(self.max_granger_p, causality.forward.best_p);
        let cpcv_mean = ThresholdCheck::at_least(self.min_cpcv_mean, cpcv.map(|r| r.cws_mean));

        let overall = min_mda.passed
            && all_lags_positive.passed
            && bootstrap_anchor_ci_excludes_zero.passed
            && granger_forward_p.passed
            && cpcv_mean.passed;

        AcceptanceReport {
            min_mda,
            all_lags_positive,
            bootstrap_anchor_ci_excludes_zero,
            granger_forward_p,
            cpcv_mean,
            overall,
        }
    }
}
