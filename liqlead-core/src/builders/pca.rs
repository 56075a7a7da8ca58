//! Linear projection onto the first principal component.
//!
//! The default builder: it never falls back to anything, so any failure here
//! is returned to the caller as-is.

use nalgebra::SymmetricEigen;

use super::{
    canonical_sign, ensure_target_blind, BuildDiagnostics, BuildError, BuildOutput, BuilderKind,
    IndexBuilder, LinearProjection, Prepared,
};
use crate::matrix::VariableMatrix;
use crate::series::TimeSeries;

/// PC1 builder. Zero-variance columns get loading 0 and are reported.
#[derive(Debug, Clone, Default)]
pub struct PcaBuilder {
    fitted: Option<LinearProjection>,
}

impl PcaBuilder {
    pub fn new() -> Self {
        Self { fitted: None }
    }

    pub fn projection(&self) -> Option<&LinearProjection> {
        self.fitted.as_ref()
    }
}

/// Leading eigenpair of a symmetric matrix: (eigenvalue, unit eigenvector,
/// trace). Deterministic: no random start, ties go to the lower index.
pub(crate) fn leading_eigen(cov: nalgebra::DMatrix<f64>) -> (f64, Vec<f64>, f64) {
    let trace = cov.trace();
    let eig = SymmetricEigen::new(cov);
    let mut best = 0;
    for i in 1..eig.eigenvalues.len() {
        if eig.eigenvalues[i] > eig.eigenvalues[best] {
            best = i;
        }
    }
    let vector: Vec<f64> = eig.eigenvectors.column(best).iter().copied().collect();
    (eig.eigenvalues[best], vector, trace)
}

impl IndexBuilder for PcaBuilder {
    fn kind(&self) -> BuilderKind {
        BuilderKind::Pca
    }

    fn build(&mut self, matrix: &VariableMatrix) -> Result<BuildOutput, BuildError> {
        ensure_target_blind(matrix)?;
        let prepared = Prepared::new(matrix, BuilderKind::Pca)?;

        let (lambda, mut vector, trace) = leading_eigen(prepared.covariance());
        if !lambda.is_finite() || vector.iter().any(|v| !v.is_finite()) {
            return Err(BuildError::FitFailure {
                builder: BuilderKind::Pca,
                reason: "non-finite eigen-decomposition".into(),
            });
        }
        canonical_sign(&mut vector);

        let excluded = prepared.excluded_names();
        if !excluded.is_empty() {
            tracing::info!(columns = ?excluded, "pca: constant columns excluded from fit");
        }

        let projection = LinearProjection {
            columns: prepared.matrix.columns().to_vec(),
            means: prepared.means.clone(),
            weights: prepared.full_weights(&vector),
        };
        let index = projection.project(&prepared.matrix)?;
        let explained = if trace > 0.0 { lambda / trace } else { 0.0 };
        tracing::debug!(
            n_obs = prepared.matrix.n_rows(),
            explained_variance_ratio = explained,
            "pca fitted"
        );

        let output = BuildOutput {
            kind: BuilderKind::Pca,
            loadings: projection.loadings(),
            n_observations: index.len(),
            index,
            diagnostics: BuildDiagnostics::Pca {
                explained_variance_ratio: explained,
                excluded_constant: excluded,
            },
        };
        self.fitted = Some(projection);
        Ok(output)
    }

    fn transform(&self, matrix: &VariableMatrix) -> Result<TimeSeries, BuildError> {
        self.fitted
            .as_ref()
            .ok_or(BuildError::NotFitted {
                builder: BuilderKind::Pca,
            })?
            .project(matrix)
    }
}
