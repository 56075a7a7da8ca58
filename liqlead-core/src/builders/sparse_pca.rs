//! Sparse principal component: automatic variable selection.
//!
//! Rank-one penalized power iteration on the correlation matrix:
//! `v ← soft(S v, alpha) / ‖·‖`, started from the ordinary PC1. Variables
//! whose loading is driven to zero drop out of the index.

use serde::{Deserialize, Serialize};

use super::pca::leading_eigen;
use super::{
    canonical_sign, ensure_target_blind, BuildDiagnostics, BuildError, BuildOutput, BuilderKind,
    IndexBuilder, LinearProjection, LoadingVector, Prepared,
};
use crate::matrix::VariableMatrix;
use crate::series::TimeSeries;

/// Loadings below this magnitude count as zero.
const NONZERO_EPS: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SparsePcaParams {
    /// L1 penalty on correlation-scale loadings.
    pub alpha: f64,
    pub max_iter: usize,
    pub tol: f64,
    /// Penalties visited by [`alpha_sensitivity`] when none are given.
    pub sweep_alphas: Vec<f64>,
}

impl Default for SparsePcaParams {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            max_iter: 200,
            tol: 1e-8,
            sweep_alphas: vec![0.05, 0.1, 0.2, 0.3, 0.5],
        }
    }
}

/// One row of the penalty sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlphaSweepPoint {
    pub alpha: f64,
    pub loadings: LoadingVector,
    pub n_nonzero: usize,
    pub explained_variance_ratio: f64,
}

#[derive(Debug, Clone)]
pub struct SparsePcaBuilder {
    params: SparsePcaParams,
    fitted: Option<LinearProjection>,
}

impl SparsePcaBuilder {
    pub fn new(params: SparsePcaParams) -> Self {
        Self {
            params,
            fitted: None,
        }
    }

    pub fn params(&self) -> &SparsePcaParams {
        &self.params
    }
}

struct SparseFit {
    /// Unit-norm loadings on the active, standardized columns.
    loadings: Vec<f64>,
    /// Active-column standard deviations.
    scale: Vec<f64>,
    explained: f64,
    iterations: usize,
    converged: bool,
}

fn soft_threshold(x: f64, alpha: f64) -> f64 {
    x.signum() * (x.abs() - alpha).max(0.0)
}

fn fit_sparse(prepared: &Prepared, alpha: f64, max_iter: usize, tol: f64) -> Result<SparseFit, BuildError> {
    let cov = prepared.covariance();
    let p = cov.nrows();
    let scale: Vec<f64> = (0..p).map(|j| cov[(j, j)].sqrt()).collect();
    let corr = nalgebra::DMatrix::from_fn(p, p, |i, j| cov[(i, j)] / (scale[i] * scale[j]));

    let (_, mut v, trace) = leading_eigen(corr.clone());
    let mut iterations = 0;
    let mut converged = false;
    for it in 1..=max_iter {
        let sv = &corr * nalgebra::DVector::from_column_slice(&v);
        let mut next: Vec<f64> = sv.iter().map(|x| soft_threshold(*x, alpha)).collect();
        let norm = next.iter().map(|x| x * x).sum::<f64>().sqrt();
        iterations = it;
        if norm <= NONZERO_EPS {
            return Err(BuildError::FitFailure {
                builder: BuilderKind::SparsePca,
                reason: format!("alpha {alpha} zeroes every loading"),
            });
        }
        next.iter_mut().for_each(|x| *x /= norm);
        let delta = next
            .iter()
            .zip(&v)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        v = next;
        if delta < tol {
            converged = true;
            break;
        }
    }
    if v.iter().any(|x| !x.is_finite()) {
        return Err(BuildError::FitFailure {
            builder: BuilderKind::SparsePca,
            reason: "non-finite loadings".into(),
        });
    }
    v.iter_mut().for_each(|x| {
        if x.abs() < NONZERO_EPS {
            *x = 0.0;
        }
    });
    canonical_sign(&mut v);

    let sv = &corr * nalgebra::DVector::from_column_slice(&v);
    let captured: f64 = v.iter().zip(sv.iter()).map(|(a, b)| a * b).sum();
    let explained = if trace > 0.0 { captured / trace } else { 0.0 };
    Ok(SparseFit {
        loadings: v,
        scale,
        explained,
        iterations,
        converged,
    })
}

fn named_loadings(prepared: &Prepared, fit: &SparseFit) -> LoadingVector {
    prepared
        .matrix
        .columns()
        .iter()
        .cloned()
        .zip(prepared.full_weights(&fit.loadings))
        .collect()
}

impl IndexBuilder for SparsePcaBuilder {
    fn kind(&self) -> BuilderKind {
        BuilderKind::SparsePca
    }

    fn build(&mut self, matrix: &VariableMatrix) -> Result<BuildOutput, BuildError> {
        ensure_target_blind(matrix)?;
        let prepared = Prepared::new(matrix, BuilderKind::SparsePca)?;
        let fit = fit_sparse(&prepared, self.params.alpha, self.params.max_iter, self.params.tol)?;
        if !fit.converged {
            tracing::warn!(iterations = fit.iterations, "sparse pca hit the iteration cap; using last iterate");
        }

        // Index on the standardized scale: Σ v_j (x_j − μ_j) / σ_j
        let weights: Vec<f64> = fit
            .loadings
            .iter()
            .zip(&fit.scale)
            .map(|(v, s)| v / s)
            .collect();
        let projection = LinearProjection {
            columns: prepared.matrix.columns().to_vec(),
            means: prepared.means.clone(),
            weights: prepared.full_weights(&weights),
        };
        let index = projection.project(&prepared.matrix)?;

        let loadings = named_loadings(&prepared, &fit);
        let (nonzero, zero): (Vec<String>, Vec<String>) = loadings
            .keys()
            .cloned()
            .partition(|k| loadings[k].abs() > NONZERO_EPS);
        let sparsity_ratio = zero.len() as f64 / loadings.len() as f64;
        tracing::info!(
            alpha = self.params.alpha,
            nonzero = ?nonzero,
            sparsity_ratio,
            "sparse pca fitted"
        );

        let output = BuildOutput {
            kind: BuilderKind::SparsePca,
            n_observations: index.len(),
            index,
            loadings,
            diagnostics: BuildDiagnostics::SparsePca {
                alpha: self.params.alpha,
                nonzero_variables: nonzero,
                zero_variables: zero,
                sparsity_ratio,
                explained_variance_ratio: fit.explained,
                iterations: fit.iterations,
                converged: fit.converged,
            },
        };
        self.fitted = Some(projection);
        Ok(output)
    }

    fn transform(&self, matrix: &VariableMatrix) -> Result<TimeSeries, BuildError> {
        self.fitted
            .as_ref()
            .ok_or(BuildError::NotFitted {
                builder: BuilderKind::SparsePca,
            })?
            .project(matrix)
    }
}

/// Loadings across a range of penalties. Penalties that zero every loading
/// are logged and skipped.
pub fn alpha_sensitivity(
    matrix: &VariableMatrix,
    params: &SparsePcaParams,
    alphas: Option<&[f64]>,
) -> Result<Vec<AlphaSweepPoint>, BuildError> {
    ensure_target_blind(matrix)?;
    let prepared = Prepared::new(matrix, BuilderKind::SparsePca)?;
    let alphas = alphas.unwrap_or(&params.sweep_alphas);

    let mut points = Vec::with_capacity(alphas.len());
    for &alpha in alphas {
        match fit_sparse(&prepared, alpha, params.max_iter, params.tol) {
            Ok(fit) => {
                let loadings = named_loadings(&prepared, &fit);
                let n_nonzero = loadings.values().filter(|v| v.abs() > NONZERO_EPS).count();
                points.push(AlphaSweepPoint {
                    alpha,
                    loadings,
                    n_nonzero,
                    explained_variance_ratio: fit.explained,
                });
            }
            Err(e) => tracing::warn!(alpha, error = %e, "alpha sweep point skipped"),
        }
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::monthly_dates;
    use chrono::NaiveDate;

    fn matrix(columns: &[&str], rows: Vec<Vec<f64>>) -> VariableMatrix {
        let dates = monthly_dates(NaiveDate::from_ymd_opt(2012, 1, 1).unwrap(), rows.len());
        VariableMatrix::new(columns.iter().map(|s| s.to_string()).collect(), dates, rows).unwrap()
    }

    /// Three columns share a factor; the fourth is unrelated noise.
    fn factor_plus_noise(n: usize) -> Vec<Vec<f64>> {
        (0..n)
            .map(|i| {
                let t = i as f64;
                let f = (t * 0.2).sin();
                vec![
                    f + 0.05 * (t * 2.3).cos(),
                    2.0 * f + 0.1 * (t * 1.9).sin(),
                    -f + 0.05 * (t * 3.1).sin(),
                    (t * 1.37).sin() * (t * 0.61).cos(),
                ]
            })
            .collect()
    }

    #[test]
    fn unrelated_variable_is_zeroed() {
        let m = matrix(&["net_liquidity", "m2", "hy", "noise"], factor_plus_noise(120));
        let out = SparsePcaBuilder::new(SparsePcaParams::default()).build(&m).unwrap();
        assert_eq!(out.loadings["noise"], 0.0);
        assert!(out.loadings["net_liquidity"].abs() > 0.3);
        let norm: f64 = out.loadings.values().map(|v| v * v).sum();
        assert!((norm - 1.0).abs() < 1e-9);
        match out.diagnostics {
            BuildDiagnostics::SparsePca {
                zero_variables,
                sparsity_ratio,
                ..
            } => {
                assert_eq!(zero_variables, vec!["noise".to_string()]);
                assert!((sparsity_ratio - 0.25).abs() < 1e-12);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn huge_penalty_is_fit_failure() {
        let m = matrix(&["a", "b", "c", "d"], factor_plus_noise(60));
        let params = SparsePcaParams {
            alpha: 50.0,
            ..SparsePcaParams::default()
        };
        let err = SparsePcaBuilder::new(params).build(&m).unwrap_err();
        assert!(matches!(err, BuildError::FitFailure { builder: BuilderKind::SparsePca, .. }));
    }

    #[test]
    fn iteration_cap_keeps_last_iterate_unconverged() {
        let m = matrix(&["a", "b", "c", "d"], factor_plus_noise(80));
        let params = SparsePcaParams {
            max_iter: 1,
            tol: 0.0,
            ..SparsePcaParams::default()
        };
        let out = SparsePcaBuilder::new(params).build(&m).unwrap();
        assert!(!out.diagnostics.converged());
        assert!(matches!(out.diagnostics, BuildDiagnostics::SparsePca { iterations: 1, .. }));
        assert!(out.index.values().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn zero_penalty_matches_pca_direction() {
        let m = matrix(&["a", "b", "c", "d"], factor_plus_noise(80));
        let params = SparsePcaParams {
            alpha: 0.0,
            ..SparsePcaParams::default()
        };
        let out = SparsePcaBuilder::new(params).build(&m).unwrap();
        assert!(out.loadings.values().all(|v| *v != 0.0));
    }

    #[test]
    fn sweep_grows_sparser_with_penalty() {
        let m = matrix(&["a", "b", "c", "d"], factor_plus_noise(100));
        let params = SparsePcaParams::default();
        let points = alpha_sensitivity(&m, &params, Some(&[0.0, 0.3, 50.0])).unwrap();
        // The last penalty zeroes everything and is skipped
        assert_eq!(points.len(), 2);
        assert!(points[0].n_nonzero >= points[1].n_nonzero);
        assert_eq!(points[0].n_nonzero, 4);
    }

    #[test]
    fn sweep_defaults_to_configured_alphas() {
        let m = matrix(&["a", "b", "c", "d"], factor_plus_noise(100));
        let params = SparsePcaParams::default();
        let points = alpha_sensitivity(&m, &params, None).unwrap();
        assert_eq!(points.len(), params.sweep_alphas.len());
    }

    #[test]
    fn transform_reapplies_standardization() {
        let m = matrix(&["a", "b", "c", "d"], factor_plus_noise(50));
        let mut b = SparsePcaBuilder::new(SparsePcaParams::default());
        let out = b.build(&m).unwrap();
        assert_eq!(out.index, b.transform(&m).unwrap());
    }
}
