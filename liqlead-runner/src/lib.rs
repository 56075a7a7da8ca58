//! LiqLead Runner: pipeline orchestration and robustness analysis.
//!
//! This crate builds on `liqlead-core` to provide:
//! - Immutable, TOML-loadable pipeline configuration with a content fingerprint
//! - Block bootstrap stability of loadings and of the optimal lag
//! - Combinatorial purged cross-validation
//! - Multiple-comparison deflation of the best composite score
//! - Acceptance checks and the three-stage pipeline state machine

pub mod acceptance;
pub mod aligned;
pub mod bootstrap;
pub mod config;
pub mod cpcv;
pub mod deflation;
pub mod pipeline;

pub use acceptance::{AcceptanceReport, AcceptanceThresholds, FlagCheck, ThresholdCheck};
pub use aligned::AlignedSample;
pub use bootstrap::{
    block_bootstrap_indices, lag_stability, loading_stability, BootstrapConfig, BootstrapError,
    LagStability, LagStabilityReport, LoadingInterval, LoadingStability, LoadingStabilityReport,
};
pub use config::{ConfigError, PipelineConfig, ScoreConfig};
pub use cpcv::{generate_splits, run_cpcv, CpcvConfig, CpcvError, CpcvPath, CpcvReport, CpcvSplit, SplitPlan};
pub use deflation::{
    deflate_with, deflated_score, expected_max_inflation, AsymptoticMaxDeflator, DeflatedScore,
    ScoreDeflator,
};
pub use pipeline::{
    Fallback, MethodComparison, MethodFailure, Pipeline, PipelineError, PipelineInputs,
    PipelineResult, PipelineState, Stage1Result, Stage2Result, Stage3Result,
};
