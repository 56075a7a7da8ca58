//! Immutable pipeline configuration.
//!
//! Every constant a run depends on lives here: score weights and lag bound,
//! causality settings, builder hyperparameters, resampling settings and the
//! acceptance thresholds. Partial TOML files fall back to defaults field by
//! field.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use liqlead_core::builders::{BuilderKind, BuilderParams};
use liqlead_core::causality::CausalityConfig;
use liqlead_core::composite::{CompositeScorer, WaveformWeights};

use crate::acceptance::AcceptanceThresholds;
use crate::bootstrap::BootstrapConfig;
use crate::cpcv::CpcvConfig;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ─── Score configuration ─────────────────────────────────────────────

/// Composite score settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreConfig {
    pub weights: WaveformWeights,
    /// Lag search bound (default 15).
    pub max_lag: usize,
    /// Level of the one-sided directional-accuracy binomial test (default 0.05).
    pub mda_alpha: f64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            weights: WaveformWeights::default(),
            max_lag: 15,
            mda_alpha: 0.05,
        }
    }
}

impl ScoreConfig {
    pub fn scorer(&self) -> CompositeScorer {
        CompositeScorer::new(self.weights, self.max_lag)
    }
}

// ─── Pipeline configuration ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Builder requested for Stage 1 (default PCA).
    pub builder: BuilderKind,
    pub score: ScoreConfig,
    pub causality: CausalityConfig,
    pub builders: BuilderParams,
    pub bootstrap: BootstrapConfig,
    pub cpcv: CpcvConfig,
    pub acceptance: AcceptanceThresholds,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            builder: BuilderKind::DEFAULT,
            score: ScoreConfig::default(),
            causality: CausalityConfig::default(),
            builders: BuilderParams::default(),
            bootstrap: BootstrapConfig::default(),
            cpcv: CpcvConfig::default(),
            acceptance: AcceptanceThresholds::default(),
        }
    }
}

// ─── Loading and validation ──────────────────────────────────────────

impl PipelineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.score.weights;
        if !w.all_non_negative() {
            return Err(ConfigError::Invalid("score weights must be non-negative".into()));
        }
        if (w.sum() - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::Invalid(format!(
                "score weights must sum to 1, got {}",
                w.sum()
            )));
        }
        if !(0.0 < self.score.mda_alpha && self.score.mda_alpha < 1.0) {
            return Err(ConfigError::Invalid("mda_alpha must be in (0, 1)".into()));
        }
        if !(0.0 < self.causality.alpha && self.causality.alpha < 1.0) {
            return Err(ConfigError::Invalid("causality alpha must be in (0, 1)".into()));
        }
        if self.causality.max_lag == 0 {
            return Err(ConfigError::Invalid("causality max_lag must be at least 1".into()));
        }
        if self.bootstrap.block_length == 0 {
            return Err(ConfigError::Invalid("block_length must be at least 1".into()));
        }
        let level = self.bootstrap.confidence_level;
        if !(0.0 < level && level < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "confidence_level must be in (0, 1), got {level}"
            )));
        }
        if self.cpcv.n_test_folds == 0 || self.cpcv.n_test_folds >= self.cpcv.n_folds {
            return Err(ConfigError::Invalid(format!(
                "need 0 < n_test_folds < n_folds, got {} of {}",
                self.cpcv.n_test_folds, self.cpcv.n_folds
            )));
        }
        Ok(())
    }

    /// BLAKE3 digest of the canonical JSON form.
    ///
    /// Two runs with identical configs share a fingerprint, so stored
    /// results can be traced to the settings that produced them.
    pub fn fingerprint(&self) -> Result<String, ConfigError> {
        let json = serde_json::to_string(self)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}
