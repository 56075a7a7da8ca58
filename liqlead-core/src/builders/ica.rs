//! Independent-component separation.
//!
//! Parallel FastICA with the logcosh contrast (tanh nonlinearity) and
//! symmetric decorrelation, on PCA-whitened complete rows. Component order
//! and sign are arbitrary, so the builder picks the component most
//! correlated (in absolute value) with the anchor variable and flips it to
//! correlate positively. The target never enters the selection.
//!
//! Loadings are the selected column of the mixing matrix: how strongly each
//! variable expresses the chosen source.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{
    ensure_target_blind, BuildDiagnostics, BuildError, BuildOutput, BuilderKind, IndexBuilder,
    LinearProjection, LoadingVector, Prepared,
};
use crate::matrix::VariableMatrix;
use crate::rng::RngHierarchy;
use crate::series::TimeSeries;
use crate::stats;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcaParams {
    /// Upper bound on extracted components (capped by rank).
    pub max_components: usize,
    pub max_iter: usize,
    pub tol: f64,
    pub seed: u64,
}

impl Default for IcaParams {
    fn default() -> Self {
        Self {
            max_components: 4,
            max_iter: 500,
            tol: 1e-4,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IcaBuilder {
    params: IcaParams,
    fitted: Option<LinearProjection>,
}

impl IcaBuilder {
    pub fn new(params: IcaParams) -> Self {
        Self {
            params,
            fitted: None,
        }
    }
}

fn fit_failure(reason: impl Into<String>) -> BuildError {
    BuildError::FitFailure {
        builder: BuilderKind::Ica,
        reason: reason.into(),
    }
}

/// `(W Wᵀ)^{-1/2} W`.
fn symmetric_decorrelation(w: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let eig = SymmetricEigen::new(w * w.transpose());
    if eig
        .eigenvalues
        .iter()
        .any(|s| !(s.is_finite() && *s > 1e-300))
    {
        return None;
    }
    let inv_sqrt = DMatrix::from_diagonal(&eig.eigenvalues.map(|s| 1.0 / s.sqrt()));
    Some(&eig.eigenvectors * inv_sqrt * eig.eigenvectors.transpose() * w)
}

struct Unmixing {
    w: DMatrix<f64>,
    iterations: usize,
    converged: bool,
}

fn fast_ica(z: &DMatrix<f64>, params: &IcaParams) -> Result<Unmixing, BuildError> {
    let c = z.nrows();
    let n = z.ncols() as f64;
    let mut rng = RngHierarchy::new(params.seed).rng_for("ica_init", 0);
    let init = DMatrix::from_fn(c, c, |_, _| rng.gen_range(-1.0..1.0));
    let mut w = symmetric_decorrelation(&init).ok_or_else(|| fit_failure("singular initial unmixing"))?;

    let mut iterations = 0;
    let mut converged = false;
    for it in 1..=params.max_iter {
        let g = (&w * z).map(|v| v.tanh());
        let mut next = (&g * z.transpose()) / n;
        for i in 0..c {
            let g_prime = g.row(i).iter().map(|v| 1.0 - v * v).sum::<f64>() / n;
            for j in 0..c {
                next[(i, j)] -= g_prime * w[(i, j)];
            }
        }
        let next = symmetric_decorrelation(&next)
            .ok_or_else(|| fit_failure(format!("degenerate unmixing at iteration {it}")))?;
        let lim = (0..c)
            .map(|i| (next.row(i).dot(&w.row(i)).abs() - 1.0).abs())
            .fold(0.0, f64::max);
        w = next;
        iterations = it;
        if lim < params.tol {
            converged = true;
            break;
        }
    }
    if w.iter().any(|v| !v.is_finite()) {
        return Err(fit_failure("non-finite unmixing matrix"));
    }
    Ok(Unmixing {
        w,
        iterations,
        converged,
    })
}

impl IndexBuilder for IcaBuilder {
    fn kind(&self) -> BuilderKind {
        BuilderKind::Ica
    }

    fn build(&mut self, matrix: &VariableMatrix) -> Result<BuildOutput, BuildError> {
        ensure_target_blind(matrix)?;
        let prepared = Prepared::new(matrix, BuilderKind::Ica)?;
        let anchor_name = matrix.anchor_column().to_string();
        let anchor = prepared
            .matrix
            .column_index(&anchor_name)
            .map(|j| prepared.matrix.column_values(j))
            .ok_or_else(|| fit_failure("anchor column missing"))?;

        // Whitening on the leading eigenpairs
        let eig = SymmetricEigen::new(prepared.covariance());
        let mut order: Vec<usize> = (0..eig.eigenvalues.len()).collect();
        order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));
        let lambda_max = eig.eigenvalues[order[0]].max(0.0);
        let kept: Vec<usize> = order
            .into_iter()
            .filter(|&i| eig.eigenvalues[i] > 1e-10 * lambda_max)
            .take(self.params.max_components.max(1))
            .collect();
        if kept.is_empty() {
            return Err(fit_failure("covariance has no positive eigenvalue"));
        }
        let c = kept.len();
        let p = prepared.active.len();
        let whitening = DMatrix::from_fn(c, p, |r, j| {
            eig.eigenvectors[(j, kept[r])] / eig.eigenvalues[kept[r]].sqrt()
        });
        let dewhitening = DMatrix::from_fn(p, c, |j, r| {
            eig.eigenvectors[(j, kept[r])] * eig.eigenvalues[kept[r]].sqrt()
        });
        let z = &whitening * prepared.centered.transpose();

        let unmixing = fast_ica(&z, &self.params)?;
        if !unmixing.converged {
            tracing::warn!(
                iterations = unmixing.iterations,
                "ica did not converge; using last iterate"
            );
        }

        let sources = &unmixing.w * &z;
        let mut selected: Option<(usize, f64)> = None;
        for i in 0..c {
            let s: Vec<f64> = sources.row(i).iter().copied().collect();
            if let Some(r) = stats::pearson(&s, &anchor) {
                if selected.map_or(true, |(_, best)| r.abs() > best.abs()) {
                    selected = Some((i, r));
                }
            }
        }
        let (component, corr) =
            selected.ok_or_else(|| fit_failure("no component correlates with the anchor"))?;
        let sign = if corr < 0.0 { -1.0 } else { 1.0 };
        if corr < 0.0 {
            tracing::info!(component, corr, "ica component sign flipped");
        }

        let w_sel: DVector<f64> = unmixing.w.row(component).transpose();
        let weights: Vec<f64> = (whitening.transpose() * &w_sel).iter().map(|v| v * sign).collect();
        let mixing: Vec<f64> = (&dewhitening * &w_sel).iter().map(|v| v * sign).collect();

        let projection = LinearProjection {
            columns: prepared.matrix.columns().to_vec(),
            means: prepared.means.clone(),
            weights: prepared.full_weights(&weights),
        };
        let index = projection.project(&prepared.matrix)?;
        let loadings: LoadingVector = prepared
            .matrix
            .columns()
            .iter()
            .cloned()
            .zip(prepared.full_weights(&mixing))
            .collect();
        tracing::debug!(
            component,
            anchor_abs_correlation = corr.abs(),
            n_components = c,
            "ica fitted"
        );

        let output = BuildOutput {
            kind: BuilderKind::Ica,
            n_observations: index.len(),
            index,
            loadings,
            diagnostics: BuildDiagnostics::Ica {
                n_components: c,
                selected_component: component,
                anchor_abs_correlation: corr.abs(),
                iterations: unmixing.iterations,
                converged: unmixing.converged,
                excluded_constant: prepared.excluded_names(),
            },
        };
        self.fitted = Some(projection);
        Ok(output)
    }

    fn transform(&self, matrix: &VariableMatrix) -> Result<TimeSeries, BuildError> {
        self.fitted
            .as_ref()
            .ok_or(BuildError::NotFitted {
                builder: BuilderKind::Ica,
            })?
            .project(matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::monthly_dates;
    use chrono::NaiveDate;

    fn matrix(columns: &[&str], rows: Vec<Vec<f64>>) -> VariableMatrix {
        let dates = monthly_dates(NaiveDate::from_ymd_opt(2010, 1, 1).unwrap(), rows.len());
        VariableMatrix::new(columns.iter().map(|s| s.to_string()).collect(), dates, rows).unwrap()
    }

    /// Two non-Gaussian sources mixed into three observed columns.
    fn mixed(n: usize) -> (Vec<Vec<f64>>, Vec<f64>) {
        let s1: Vec<f64> = (0..n).map(|i| ((i as f64) * 0.13).sin()).collect();
        let s2: Vec<f64> = (0..n)
            .map(|i| if (i / 7) % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let rows = (0..n)
            .map(|i| vec![0.9 * s1[i] + 0.1 * s2[i], 0.3 * s1[i] + 0.8 * s2[i], 0.5 * s1[i] - 0.5 * s2[i]])
            .collect();
        (rows, s1)
    }

    #[test]
    fn selects_anchor_component_with_positive_sign() {
        let (rows, _) = mixed(200);
        let m = matrix(&["net_liquidity", "spread", "basis"], rows);
        let out = IcaBuilder::new(IcaParams::default()).build(&m).unwrap();

        let anchor = m.column("net_liquidity").unwrap();
        let (x, y) = out.index.align(&anchor);
        let r = stats::pearson(&x, &y).unwrap();
        assert!(r > 0.8, "anchor correlation {r}");
        match out.diagnostics {
            BuildDiagnostics::Ica { n_components, anchor_abs_correlation, .. } => {
                assert_eq!(n_components, 3);
                assert!((anchor_abs_correlation - r).abs() < 1e-9);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(out.loadings["net_liquidity"] > 0.0);
    }

    #[test]
    fn seeded_runs_match() {
        let (rows, _) = mixed(150);
        let m = matrix(&["net_liquidity", "spread", "basis"], rows);
        let a = IcaBuilder::new(IcaParams::default()).build(&m).unwrap();
        let b = IcaBuilder::new(IcaParams::default()).build(&m).unwrap();
        assert_eq!(a.index, b.index);
        assert_eq!(a.loadings, b.loadings);
    }

    #[test]
    fn component_count_capped() {
        let (rows, _) = mixed(120);
        let m = matrix(&["net_liquidity", "spread", "basis"], rows);
        let params = IcaParams {
            max_components: 2,
            ..IcaParams::default()
        };
        let out = IcaBuilder::new(params).build(&m).unwrap();
        assert!(matches!(out.diagnostics, BuildDiagnostics::Ica { n_components: 2, .. }));
    }

    #[test]
    fn transform_matches_in_sample_index() {
        let (rows, _) = mixed(100);
        let m = matrix(&["net_liquidity", "spread", "basis"], rows);
        let mut ica = IcaBuilder::new(IcaParams::default());
        let out = ica.build(&m).unwrap();
        let again = ica.transform(&m).unwrap();
        for (a, b) in out.index.values().iter().zip(again.values()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn constant_anchor_is_fit_failure() {
        let (rows, _) = mixed(60);
        let rows = rows
            .into_iter()
            .map(|mut r| {
                r[0] = 2.0;
                r
            })
            .collect();
        let m = matrix(&["net_liquidity", "spread", "basis"], rows);
        let err = IcaBuilder::new(IcaParams::default()).build(&m).unwrap_err();
        assert!(matches!(err, BuildError::FitFailure { builder: BuilderKind::Ica, .. }));
        assert!(err.allows_fallback());
    }
}
