//! Three-stage pipeline: blind build, directional validation, robustness.
//!
//! ```text
//! Stage1Pending → Stage1Done { fallback } → Stage2Done → Stage3Done → Complete
//! ```
//!
//! Stage 1 never sees the target. A non-default builder that fails on the
//! data falls back to PCA and the fallback is recorded. Stages 2 and 3 never
//! abort for data-quality reasons: a sub-result that cannot be computed is
//! reported as unavailable or insufficient, and the acceptance table treats
//! it as failing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use liqlead_core::builders::{
    ensure_target_blind, sign_correct, BuildError, BuildOutput, Builder, BuilderKind,
    IndexBuilder, SignCorrection,
};
use liqlead_core::causality::{
    granger_bidirectional, stationarity_check, CausalityResult, StationarityResult,
};
use liqlead_core::coherence::{spectral_coherence, Availability, CoherenceSummary};
use liqlead_core::composite::{CrossCorrelation, MethodScore, OptimalLag};
use liqlead_core::matrix::VariableMatrix;
use liqlead_core::metrics::{mda_significance, DirectionalSignificance, LaggedPair};
use liqlead_core::series::TimeSeries;

use crate::acceptance::AcceptanceReport;
use crate::aligned::AlignedSample;
use crate::bootstrap::{lag_stability, loading_stability, BootstrapError, LagStability, LoadingStability};
use crate::config::{ConfigError, PipelineConfig};
use crate::cpcv::{run_cpcv, CpcvError, CpcvReport};
use crate::deflation::{deflated_score, DeflatedScore};

// ─── Inputs and state ────────────────────────────────────────────────

/// Already-standardized inputs supplied by the caller.
#[derive(Debug, Clone)]
pub struct PipelineInputs {
    /// Monthly builder inputs; must not contain target-named columns.
    pub matrix: VariableMatrix,
    pub target: TimeSeries,
    /// Daily inputs for the dynamic factor model, when available.
    pub daily_matrix: Option<VariableMatrix>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Stage1Pending,
    Stage1Done { fallback: bool },
    Stage2Done,
    Stage3Done,
    Complete,
}

/// Recorded when the requested builder failed and PCA was used instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fallback {
    pub from: BuilderKind,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("stage 1 build with {builder} failed: {source}")]
    Build {
        builder: BuilderKind,
        #[source]
        source: BuildError,
    },
    #[error("bootstrap: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("cpcv: {0}")]
    Cpcv(#[source] CpcvError),
}

// ─── Stage results ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage1Result {
    pub requested: BuilderKind,
    pub used: BuilderKind,
    pub fallback: Option<Fallback>,
    /// Fit output; `build.index` is the sign-corrected index.
    pub build: BuildOutput,
    pub anchor: String,
    pub sign: SignCorrection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stationarity {
    pub index: StationarityResult,
    pub target: StationarityResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage2Result {
    pub optimal: OptimalLag,
    pub cross_correlation: CrossCorrelation,
    /// Binomial test of directional accuracy at the optimal lag.
    pub mda_significance: Option<DirectionalSignificance>,
    pub causality: CausalityResult,
    pub stationarity: Stationarity,
    pub coherence: Availability<CoherenceSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage3Result {
    pub loading_stability: LoadingStability,
    pub lag_stability: LagStability,
    pub cpcv: Availability<CpcvReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub config_fingerprint: String,
    pub stage1: Stage1Result,
    pub stage2: Stage2Result,
    pub stage3: Stage3Result,
    pub acceptance: AcceptanceReport,
    /// Every state entered, in order, ending with `Complete`.
    pub transitions: Vec<PipelineState>,
}

// ─── Method comparison ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodFailure {
    pub kind: BuilderKind,
    pub reason: String,
}

/// Every candidate builder scored on the same target, best first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodComparison {
    pub rankings: Vec<MethodScore>,
    pub failures: Vec<MethodFailure>,
    /// Builders attempted, successful or not.
    pub n_methods_tried: usize,
    pub deflation: DeflatedScore,
}

// ─── Orchestrator ────────────────────────────────────────────────────

pub struct Pipeline {
    config: PipelineConfig,
    state: PipelineState,
    transitions: Vec<PipelineState>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            state: PipelineState::Stage1Pending,
            transitions: vec![PipelineState::Stage1Pending],
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    fn advance(&mut self, next: PipelineState) {
        tracing::info!(from = ?self.state, to = ?next, "pipeline transition");
        self.state = next.clone();
        self.transitions.push(next);
    }

    /// Run all three stages. Consumes the pipeline: a run cannot be resumed.
    pub fn run(mut self, inputs: PipelineInputs) -> Result<PipelineResult, PipelineError> {
        self.config.validate()?;
        let config_fingerprint = self.config.fingerprint()?;
        tracing::info!(
            builder = %self.config.builder,
            fingerprint = %config_fingerprint,
            n_rows = inputs.matrix.n_rows(),
            "pipeline start"
        );

        let stage1 = self.stage1(&inputs)?;
        self.advance(PipelineState::Stage1Done {
            fallback: stage1.fallback.is_some(),
        });

        let stage2 = self.stage2(&stage1.build.index, &inputs.target);
        self.advance(PipelineState::Stage2Done);

        let stage3 = self.stage3(&inputs, stage1.used)?;
        self.advance(PipelineState::Stage3Done);

        let acceptance = self.config.acceptance.evaluate(
            &stage2.optimal.profile,
            &stage2.causality,
            &stage3.loading_stability,
            stage3.cpcv.as_option(),
        );
        self.advance(PipelineState::Complete);
        tracing::info!(
            overall = acceptance.overall,
            failures = ?acceptance.failures(),
            "pipeline complete"
        );

        Ok(PipelineResult {
            config_fingerprint,
            stage1,
            stage2,
            stage3,
            acceptance,
            transitions: self.transitions,
        })
    }

    // ── Stage 1 ──────────────────────────────────────────────────────

    fn stage1(&self, inputs: &PipelineInputs) -> Result<Stage1Result, PipelineError> {
        let requested = self.config.builder;
        tracing::info!(builder = %requested, "stage 1: blind index construction");

        let (build, used, fallback) = match build_index(&self.config, requested, inputs) {
            Ok(out) => (out, requested, None),
            Err(e) if !requested.is_default() && e.allows_fallback() => {
                tracing::warn!(from = %requested, error = %e, "builder failed, falling back to PCA");
                let out = build_index(&self.config, BuilderKind::DEFAULT, inputs).map_err(|source| {
                    PipelineError::Build {
                        builder: BuilderKind::DEFAULT,
                        source,
                    }
                })?;
                let fallback = Fallback {
                    from: requested,
                    reason: e.to_string(),
                };
                (out, BuilderKind::DEFAULT, Some(fallback))
            }
            Err(source) => {
                return Err(PipelineError::Build {
                    builder: requested,
                    source,
                })
            }
        };

        let anchor = inputs.matrix.anchor_column().to_string();
        let (index, sign) = match inputs.matrix.column(&anchor) {
            Some(a) => sign_correct(&build.index, &a),
            None => (
                build.index.clone(),
                SignCorrection {
                    flipped: false,
                    anchor_correlation: None,
                    n_overlap: 0,
                    low_confidence: true,
                },
            ),
        };
        let build = BuildOutput { index, ..build };
        tracing::info!(
            used = %used,
            n_observations = build.n_observations,
            flipped = sign.flipped,
            "stage 1 complete"
        );

        Ok(Stage1Result {
            requested,
            used,
            fallback,
            build,
            anchor,
            sign,
        })
    }

    // ── Stage 2 ──────────────────────────────────────────────────────

    fn stage2(&self, index: &TimeSeries, target: &TimeSeries) -> Stage2Result {
        tracing::info!("stage 2: directional validation");
        let scorer = self.config.score.scorer();
        let optimal = scorer.optimal_lag(index, target);
        let cross_correlation = CrossCorrelation::from(&optimal.profile);
        let mda_significance = LaggedPair::new(index, target, optimal.optimal_lag)
            .and_then(|pair| mda_significance(&pair.index, &pair.target, self.config.score.mda_alpha));
        let causality = granger_bidirectional(index, target, &self.config.causality);
        let stationarity = Stationarity {
            index: stationarity_check(index),
            target: stationarity_check(target),
        };
        let coherence = spectral_coherence(index, target);
        if let Availability::Unavailable { reason } = &coherence {
            tracing::info!(%reason, "spectral coherence unavailable");
        }

        tracing::info!(
            optimal_lag = optimal.optimal_lag,
            best_cws = optimal.best_cws,
            all_positive = cross_correlation.all_positive,
            unidirectional = causality.unidirectional,
            "stage 2 complete"
        );
        Stage2Result {
            optimal,
            cross_correlation,
            mda_significance,
            causality,
            stationarity,
            coherence,
        }
    }

    // ── Stage 3 ──────────────────────────────────────────────────────

    fn stage3(&self, inputs: &PipelineInputs, kind: BuilderKind) -> Result<Stage3Result, PipelineError> {
        tracing::info!(builder = %kind, "stage 3: robustness");
        let params = &self.config.builders;
        let scorer = self.config.score.scorer();

        let loading_stability = loading_stability(&inputs.matrix, kind, params, &self.config.bootstrap)?;
        let lag_stability = lag_stability(
            &inputs.matrix,
            &inputs.target,
            kind,
            params,
            &scorer,
            &self.config.bootstrap,
        )?;

        let cpcv = match run_cpcv(&inputs.matrix, &inputs.target, kind, params, &scorer, &self.config.cpcv) {
            Ok(report) => Availability::Available(report),
            Err(e) if e.is_insufficiency() => {
                tracing::warn!(error = %e, "cpcv skipped");
                Availability::unavailable(e.to_string())
            }
            Err(e) => return Err(PipelineError::Cpcv(e)),
        };

        tracing::info!(cpcv_available = cpcv.is_available(), "stage 3 complete");
        Ok(Stage3Result {
            loading_stability,
            lag_stability,
            cpcv,
        })
    }

    // ── Comparison ───────────────────────────────────────────────────

    /// Build every candidate, sign-correct, rank by composite score and
    /// deflate the winner for the number of tries.
    ///
    /// The dynamic factor model is a candidate only when daily inputs are
    /// supplied. A candidate that fails is recorded and skipped; target-named
    /// columns abort the comparison.
    pub fn compare_all_methods(&self, inputs: &PipelineInputs) -> Result<MethodComparison, PipelineError> {
        let kinds: Vec<BuilderKind> = BuilderKind::ALL
            .into_iter()
            .filter(|k| *k != BuilderKind::Dfm || inputs.daily_matrix.is_some())
            .collect();

        let anchor = inputs.matrix.column(inputs.matrix.anchor_column());
        let mut candidates: Vec<(String, TimeSeries)> = Vec::with_capacity(kinds.len());
        let mut failures = Vec::new();
        for &kind in &kinds {
            match build_index(&self.config, kind, inputs) {
                Ok(out) => {
                    let index = match &anchor {
                        Some(a) => sign_correct(&out.index, a).0,
                        None => out.index,
                    };
                    candidates.push((kind.name().to_string(), index));
                }
                Err(e @ BuildError::StructuralViolation { .. }) => {
                    return Err(PipelineError::Build { builder: kind, source: e });
                }
                Err(e) => {
                    tracing::warn!(builder = %kind, error = %e, "method comparison: candidate failed");
                    failures.push(MethodFailure {
                        kind,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let rankings = self.config.score.scorer().compare_methods(&candidates, &inputs.target);
        let scores: Vec<f64> = rankings.iter().map(|r| r.best_cws).collect();
        let n_observations = AlignedSample::new(&inputs.matrix, &inputs.target).len();
        let deflation = deflated_score(&scores, kinds.len(), n_observations);
        tracing::info!(
            n_candidates = candidates.len(),
            best = ?rankings.first().map(|r| r.method.as_str()),
            deflated = deflation.deflated_score,
            "method comparison complete"
        );

        Ok(MethodComparison {
            rankings,
            failures,
            n_methods_tried: kinds.len(),
            deflation,
        })
    }
}

// ─── Builder dispatch ────────────────────────────────────────────────

/// Fit `kind` on the inputs it consumes; DFM prefers the daily matrix.
fn build_index(
    config: &PipelineConfig,
    kind: BuilderKind,
    inputs: &PipelineInputs,
) -> Result<BuildOutput, BuildError> {
    // Checked up front so a polluted monthly matrix never falls through to
    // the daily one.
    ensure_target_blind(&inputs.matrix)?;
    let matrix = match (kind, &inputs.daily_matrix) {
        (BuilderKind::Dfm, Some(daily)) => daily,
        _ => &inputs.matrix,
    };
    Builder::new(kind, &config.builders).build(matrix)
}
