//! Index builders: turn a variable matrix into one scalar index.
//!
//! Four strategies share one contract ([`IndexBuilder`]) and are dispatched
//! through the closed [`Builder`] enum, so fallback and comparison logic
//! match exhaustively over [`BuilderKind`].
//!
//! Architecture invariant: `build` never sees the target series. The trait
//! signature takes only a [`VariableMatrix`], and every implementation calls
//! [`ensure_target_blind`] before touching the numbers.

pub mod dfm;
pub mod ica;
pub mod pca;
pub mod sign;
pub mod sparse_pca;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::matrix::VariableMatrix;
use crate::series::{SeriesError, TimeSeries};

pub use dfm::{prepare_daily_matrix, DfmBuilder, DfmParams, FactorState, FittedFactorModel};
pub use ica::{IcaBuilder, IcaParams};
pub use pca::PcaBuilder;
pub use sign::{sign_correct, SignCorrection, MIN_SIGN_OVERLAP};
pub use sparse_pca::{alpha_sensitivity, AlphaSweepPoint, SparsePcaBuilder, SparsePcaParams};

/// Fewest complete rows any builder will fit on.
pub const MIN_FIT_ROWS: usize = 5;

/// Variance below which a column is treated as constant.
pub(crate) const CONSTANT_EPS: f64 = 1e-12;

/// Variable name → coefficient.
pub type LoadingVector = BTreeMap<String, f64>;

// ─── Kinds ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuilderKind {
    Pca,
    Ica,
    SparsePca,
    Dfm,
}

impl BuilderKind {
    pub const ALL: [BuilderKind; 4] = [
        BuilderKind::Pca,
        BuilderKind::Ica,
        BuilderKind::SparsePca,
        BuilderKind::Dfm,
    ];

    /// The builder every other kind falls back to.
    pub const DEFAULT: BuilderKind = BuilderKind::Pca;

    pub fn name(self) -> &'static str {
        match self {
            BuilderKind::Pca => "pca",
            BuilderKind::Ica => "ica",
            BuilderKind::SparsePca => "sparse_pca",
            BuilderKind::Dfm => "dfm",
        }
    }

    pub fn is_default(self) -> bool {
        self == Self::DEFAULT
    }
}

impl fmt::Display for BuilderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("target-asset columns in builder input: {columns:?}")]
    StructuralViolation { columns: Vec<String> },
    #[error("{builder} fit failed: {reason}")]
    FitFailure { builder: BuilderKind, reason: String },
    #[error("{builder}: {n_rows} usable rows < minimum {required}")]
    InsufficientData {
        builder: BuilderKind,
        n_rows: usize,
        required: usize,
    },
    #[error("{builder} used before a successful build")]
    NotFitted { builder: BuilderKind },
    #[error("column mismatch: fitted on {expected:?}, got {found:?}")]
    ColumnMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("index series: {0}")]
    Series(#[from] SeriesError),
}

impl BuildError {
    /// Whether a non-default builder failing this way may fall back.
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, BuildError::StructuralViolation { .. })
    }
}

/// Hard precondition of every builder.
pub fn ensure_target_blind(matrix: &VariableMatrix) -> Result<(), BuildError> {
    let columns = matrix.target_named_columns();
    if columns.is_empty() {
        Ok(())
    } else {
        Err(BuildError::StructuralViolation { columns })
    }
}

pub(crate) fn require_rows(
    builder: BuilderKind,
    n_rows: usize,
    required: usize,
) -> Result<(), BuildError> {
    if n_rows < required {
        return Err(BuildError::InsufficientData {
            builder,
            n_rows,
            required,
        });
    }
    Ok(())
}

// ─── Output ──────────────────────────────────────────────────────────

/// Builder-specific fit diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildDiagnostics {
    Pca {
        explained_variance_ratio: f64,
        /// Zero-variance columns left out of the fit (loading 0).
        excluded_constant: Vec<String>,
    },
    Ica {
        n_components: usize,
        selected_component: usize,
        anchor_abs_correlation: f64,
        iterations: usize,
        converged: bool,
        excluded_constant: Vec<String>,
    },
    SparsePca {
        alpha: f64,
        nonzero_variables: Vec<String>,
        zero_variables: Vec<String>,
        sparsity_ratio: f64,
        explained_variance_ratio: f64,
        iterations: usize,
        converged: bool,
    },
    Dfm {
        factor_order: usize,
        ar_coefficients: Vec<f64>,
        log_likelihood: f64,
        aic: f64,
        bic: f64,
        restarts_succeeded: usize,
        iterations: usize,
        converged: bool,
        n_grid_rows: usize,
    },
}

impl BuildDiagnostics {
    /// Whether the iterative fit met its tolerance. PCA is closed-form.
    pub fn converged(&self) -> bool {
        match self {
            BuildDiagnostics::Pca { .. } => true,
            BuildDiagnostics::Ica { converged, .. }
            | BuildDiagnostics::SparsePca { converged, .. }
            | BuildDiagnostics::Dfm { converged, .. } => *converged,
        }
    }
}

/// What every builder hands back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub kind: BuilderKind,
    pub index: TimeSeries,
    pub loadings: LoadingVector,
    pub n_observations: usize,
    pub diagnostics: BuildDiagnostics,
}

// ─── Contract ────────────────────────────────────────────────────────

/// Shared capability of the four index builders.
pub trait IndexBuilder: Send + Sync {
    fn kind(&self) -> BuilderKind;

    /// Fit on `matrix` and return the in-sample index.
    fn build(&mut self, matrix: &VariableMatrix) -> Result<BuildOutput, BuildError>;

    /// Apply the fitted model to new rows.
    fn transform(&self, matrix: &VariableMatrix) -> Result<TimeSeries, BuildError>;
}

/// Hyperparameters for every builder kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderParams {
    pub ica: IcaParams,
    pub sparse_pca: SparsePcaParams,
    pub dfm: DfmParams,
}

/// Closed set of builders.
#[derive(Debug, Clone)]
pub enum Builder {
    Pca(PcaBuilder),
    Ica(IcaBuilder),
    SparsePca(SparsePcaBuilder),
    Dfm(DfmBuilder),
}

impl Builder {
    pub fn new(kind: BuilderKind, params: &BuilderParams) -> Self {
        match kind {
            BuilderKind::Pca => Builder::Pca(PcaBuilder::new()),
            BuilderKind::Ica => Builder::Ica(IcaBuilder::new(params.ica.clone())),
            BuilderKind::SparsePca => {
                Builder::SparsePca(SparsePcaBuilder::new(params.sparse_pca.clone()))
            }
            BuilderKind::Dfm => Builder::Dfm(DfmBuilder::new(params.dfm.clone())),
        }
    }
}

impl IndexBuilder for Builder {
    fn kind(&self) -> BuilderKind {
        match self {
            Builder::Pca(b) => b.kind(),
            Builder::Ica(b) => b.kind(),
            Builder::SparsePca(b) => b.kind(),
            Builder::Dfm(b) => b.kind(),
        }
    }

    fn build(&mut self, matrix: &VariableMatrix) -> Result<BuildOutput, BuildError> {
        match self {
            Builder::Pca(b) => b.build(matrix),
            Builder::Ica(b) => b.build(matrix),
            Builder::SparsePca(b) => b.build(matrix),
            Builder::Dfm(b) => b.build(matrix),
        }
    }

    fn transform(&self, matrix: &VariableMatrix) -> Result<TimeSeries, BuildError> {
        match self {
            Builder::Pca(b) => b.transform(matrix),
            Builder::Ica(b) => b.transform(matrix),
            Builder::SparsePca(b) => b.transform(matrix),
            Builder::Dfm(b) => b.transform(matrix),
        }
    }
}

// ─── Shared linear machinery ─────────────────────────────────────────

/// Complete rows split into active (non-constant) columns.
pub(crate) struct Prepared {
    pub matrix: VariableMatrix,
    /// Indices of columns with non-zero variance.
    pub active: Vec<usize>,
    pub means: Vec<f64>,
    /// n × active centered data, row-major.
    pub centered: nalgebra::DMatrix<f64>,
}

impl Prepared {
    pub fn new(matrix: &VariableMatrix, builder: BuilderKind) -> Result<Self, BuildError> {
        let complete = matrix.complete_rows();
        let n = complete.n_rows();
        require_rows(builder, n, MIN_FIT_ROWS)?;

        let p = complete.n_cols();
        let means: Vec<f64> = (0..p)
            .map(|j| complete.rows().iter().map(|r| r[j]).sum::<f64>() / n as f64)
            .collect();
        let active: Vec<usize> = (0..p)
            .filter(|&j| {
                let var = complete
                    .rows()
                    .iter()
                    .map(|r| (r[j] - means[j]).powi(2))
                    .sum::<f64>()
                    / (n - 1) as f64;
                var > CONSTANT_EPS
            })
            .collect();
        if active.is_empty() {
            return Err(BuildError::FitFailure {
                builder,
                reason: "every column is constant".into(),
            });
        }
        let centered = nalgebra::DMatrix::from_fn(n, active.len(), |r, c| {
            let j = active[c];
            complete.rows()[r][j] - means[j]
        });
        Ok(Self {
            matrix: complete,
            active,
            means,
            centered,
        })
    }

    pub fn excluded_names(&self) -> Vec<String> {
        self.matrix
            .columns()
            .iter()
            .enumerate()
            .filter(|(j, _)| !self.active.contains(j))
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Sample covariance of the active columns.
    pub fn covariance(&self) -> nalgebra::DMatrix<f64> {
        let n = self.centered.nrows() as f64;
        (self.centered.transpose() * &self.centered) / (n - 1.0)
    }

    /// Expand active-column weights to all columns (zeros elsewhere).
    pub fn full_weights(&self, active_weights: &[f64]) -> Vec<f64> {
        let mut w = vec![0.0; self.matrix.n_cols()];
        for (k, &j) in self.active.iter().enumerate() {
            w[j] = active_weights[k];
        }
        w
    }
}

/// Fitted affine map `index = Σ w_j (x_j − μ_j)` over named columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearProjection {
    pub columns: Vec<String>,
    pub means: Vec<f64>,
    pub weights: Vec<f64>,
}

impl LinearProjection {
    /// Project the complete rows of `matrix`, matching columns by name.
    pub fn project(&self, matrix: &VariableMatrix) -> Result<TimeSeries, BuildError> {
        let positions: Option<Vec<usize>> =
            self.columns.iter().map(|c| matrix.column_index(c)).collect();
        let positions = positions.ok_or_else(|| BuildError::ColumnMismatch {
            expected: self.columns.clone(),
            found: matrix.columns().to_vec(),
        })?;

        let mut dates = Vec::new();
        let mut values = Vec::new();
        for (date, row) in matrix.dates().iter().zip(matrix.rows()) {
            let vals: Vec<f64> = positions.iter().map(|&p| row[p]).collect();
            if vals.iter().all(|v| v.is_finite()) {
                let score = vals
                    .iter()
                    .zip(&self.means)
                    .zip(&self.weights)
                    .map(|((x, m), w)| (x - m) * w)
                    .sum();
                dates.push(*date);
                values.push(score);
            }
        }
        Ok(TimeSeries::new(dates, values)?)
    }

    pub fn loadings(&self) -> LoadingVector {
        self.columns
            .iter()
            .cloned()
            .zip(self.weights.iter().copied())
            .collect()
    }
}

/// Flip so the largest-magnitude entry is positive.
pub(crate) fn canonical_sign(v: &mut [f64]) {
    let mut pivot = 0;
    for (i, x) in v.iter().enumerate() {
        if x.abs() > v[pivot].abs() {
            pivot = i;
        }
    }
    if v.get(pivot).map_or(false, |x| *x < 0.0) {
        v.iter_mut().for_each(|x| *x = -*x);
    }
}
