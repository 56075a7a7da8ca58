//! Dynamic factor model for mixed-cadence inputs.
//!
//! One latent factor with AR(p) dynamics:
//!
//! ```text
//! y_it = λ_i f_t + e_it,                      e_it ~ N(0, r_i)
//! f_t  = φ_1 f_{t−1} + … + φ_p f_{t−p} + η_t,  η_t  ~ N(0, 1)
//! ```
//!
//! The filter runs on the companion state `(f_t, …, f_{t−p+1})`.
//!
//! Inputs are standardized per column and may be missing on any day; the
//! Kalman filter simply skips unobserved entries, which is what lets daily,
//! weekly and monthly series share one business-day grid. Parameters are
//! fitted by EM from several seeded starting points and the run with the
//! highest log-likelihood is kept. The smoothed factor is the index.

use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{
    canonical_sign, ensure_target_blind, require_rows, BuildDiagnostics, BuildError, BuildOutput,
    BuilderKind, IndexBuilder, LoadingVector, CONSTANT_EPS, MIN_FIT_ROWS,
};
use crate::matrix::{MatrixError, VariableMatrix};
use crate::rng::RngHierarchy;
use crate::series::{Cadence, TimeSeries};

const LN_2PI: f64 = 1.837_877_066_409_345_3;
const MIN_IDIOSYNCRATIC_VAR: f64 = 1e-4;
const MAX_STATIONARY_VAR: f64 = 100.0;
const AR_SHRINK: f64 = 0.95;
const MAX_SHRINK_STEPS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DfmParams {
    /// Lag order `p` of the factor process (at least 1).
    pub factor_order: usize,
    /// Seeded EM starting points; the best likelihood wins.
    pub restarts: usize,
    pub max_iter: usize,
    /// Relative log-likelihood change that stops EM.
    pub tol: f64,
    pub seed: u64,
    /// Cadence the smoothed factor is resampled to, if any.
    pub output: Option<Cadence>,
}

impl Default for DfmParams {
    fn default() -> Self {
        Self {
            factor_order: 1,
            restarts: 3,
            max_iter: 200,
            tol: 1e-6,
            seed: 42,
            output: Some(Cadence::Monthly),
        }
    }
}

// ─── Daily grid ──────────────────────────────────────────────────────

fn roll_to_business_day(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date + Duration::days(2),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

/// Place mixed-cadence series on a Monday–Friday grid spanning all inputs.
///
/// Weekend observations roll forward to the next business day; a later
/// observation landing on the same day wins. Days without an observation
/// are `NaN`.
pub fn prepare_daily_matrix(
    variables: Vec<(String, TimeSeries)>,
) -> Result<VariableMatrix, MatrixError> {
    let bounds = variables
        .iter()
        .flat_map(|(_, s)| s.dates().iter().copied())
        .fold(None, |acc: Option<(NaiveDate, NaiveDate)>, d| match acc {
            None => Some((d, d)),
            Some((lo, hi)) => Some((lo.min(d), hi.max(d))),
        });

    let mut grid = Vec::new();
    if let Some((lo, hi)) = bounds {
        let (mut day, last) = (roll_to_business_day(lo), roll_to_business_day(hi));
        while day <= last {
            if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
                grid.push(day);
            }
            day += Duration::days(1);
        }
    }
    let position: BTreeMap<NaiveDate, usize> =
        grid.iter().enumerate().map(|(i, d)| (*d, i)).collect();

    let mut rows = vec![vec![f64::NAN; variables.len()]; grid.len()];
    for (col, (_, series)) in variables.iter().enumerate() {
        for (date, value) in series.iter() {
            if let Some(&r) = position.get(&roll_to_business_day(date)) {
                rows[r][col] = value;
            }
        }
    }
    let columns: Vec<String> = variables.into_iter().map(|(name, _)| name).collect();
    let matrix = VariableMatrix::new(columns, grid, rows)?;
    tracing::debug!(
        days = matrix.n_rows(),
        variables = matrix.n_cols(),
        "daily grid prepared"
    );
    Ok(matrix)
}

// ─── State space ─────────────────────────────────────────────────────

/// Fitted parameters on the standardized scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorState {
    pub loadings: Vec<f64>,
    pub idiosyncratic_var: Vec<f64>,
    /// `φ_1..φ_p` of the factor autoregression.
    pub ar_coefficients: Vec<f64>,
}

impl FactorState {
    fn is_finite(&self) -> bool {
        self.ar_coefficients.iter().all(|v| v.is_finite())
            && self.loadings.iter().all(|v| v.is_finite())
            && self.idiosyncratic_var.iter().all(|v| v.is_finite() && *v > 0.0)
    }
}

/// Transition matrix of `α_t = (f_t, …, f_{t−p+1})`.
fn companion(phi: &[f64]) -> DMatrix<f64> {
    let order = phi.len();
    let mut t = DMatrix::zeros(order, order);
    for (j, &c) in phi.iter().enumerate() {
        t[(0, j)] = c;
    }
    for i in 1..order {
        t[(i, i - 1)] = 1.0;
    }
    t
}

/// Solves `P = T P Tᵀ + e₁e₁ᵀ`. `None` unless the process is stationary
/// with bounded variance.
fn stationary_covariance(phi: &[f64]) -> Option<DMatrix<f64>> {
    let order = phi.len();
    let t = companion(phi);
    let system = DMatrix::<f64>::identity(order * order, order * order) - t.kronecker(&t);
    let mut shock = DVector::<f64>::zeros(order * order);
    shock[0] = 1.0;
    let solved = system.lu().solve(&shock)?;
    let p = DMatrix::from_column_slice(order, order, solved.as_slice());
    let p = (&p + p.transpose()) * 0.5;
    let bounded = p.iter().all(|v| v.is_finite())
        && p.diagonal().iter().all(|v| *v <= MAX_STATIONARY_VAR);
    (bounded && p.clone().cholesky().is_some()).then_some(p)
}

/// Pull the roots inside the unit circle by damping `φ_j` with `c^j`.
fn stabilize(mut phi: Vec<f64>) -> Vec<f64> {
    for _ in 0..MAX_SHRINK_STEPS {
        if stationary_covariance(&phi).is_some() {
            return phi;
        }
        for (j, c) in phi.iter_mut().enumerate() {
            *c *= AR_SHRINK.powi(j as i32 + 1);
        }
    }
    vec![0.0; phi.len()]
}

fn invert_spd(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    m.clone()
        .cholesky()
        .map(|c| c.inverse())
        .or_else(|| m.clone().try_inverse())
}

struct Smoothed {
    mean: Vec<DVector<f64>>,
    var: Vec<DMatrix<f64>>,
    /// `Cov(α_t, α_{t−1} | all data)`, zero at t = 0.
    lag_cov: Vec<DMatrix<f64>>,
    log_likelihood: f64,
}

impl Smoothed {
    fn factor(&self) -> Vec<f64> {
        self.mean.iter().map(|m| m[0]).collect()
    }
}

/// Kalman filter + RTS smoother. Missing entries contribute nothing.
///
/// Every observation loads on the first state only, so the update collapses
/// to a rank-one correction driven by `Σ λ²/r` and `Σ λ v / r`.
fn smooth(y: &[Vec<f64>], state: &FactorState) -> Result<Smoothed, String> {
    let n = y.len();
    let order = state.ar_coefficients.len();
    let transition = companion(&state.ar_coefficients);
    let mut shock = DMatrix::<f64>::zeros(order, order);
    shock[(0, 0)] = 1.0;
    let initial = stationary_covariance(&state.ar_coefficients)
        .ok_or_else(|| "factor process is not stationary".to_string())?;

    let mut a_pred: Vec<DVector<f64>> = Vec::with_capacity(n);
    let mut p_pred: Vec<DMatrix<f64>> = Vec::with_capacity(n);
    let mut a_filt: Vec<DVector<f64>> = Vec::with_capacity(n);
    let mut p_filt: Vec<DMatrix<f64>> = Vec::with_capacity(n);
    let mut log_likelihood = 0.0;

    for t in 0..n {
        let (ap, pp) = if t == 0 {
            (DVector::zeros(order), initial.clone())
        } else {
            (
                &transition * &a_filt[t - 1],
                &transition * &p_filt[t - 1] * transition.transpose() + &shock,
            )
        };

        let mut info = 0.0;
        let mut quad_r = 0.0;
        let mut cross = 0.0;
        let mut logdet_r = 0.0;
        let mut m = 0usize;
        for (i, &obs) in y[t].iter().enumerate() {
            if obs.is_nan() {
                continue;
            }
            let (l, r) = (state.loadings[i], state.idiosyncratic_var[i]);
            let innovation = obs - l * ap[0];
            info += l * l / r;
            quad_r += innovation * innovation / r;
            cross += l * innovation / r;
            logdet_r += r.ln();
            m += 1;
        }

        let s = pp[(0, 0)];
        let h = pp.column(0).into_owned();
        let denom = 1.0 + info * s;
        let af = &ap + &h * (cross / denom);
        let pf = &pp - &h * h.transpose() * (info / denom);
        if m > 0 {
            // Determinant lemma and Woodbury on R + λλᵀs
            let logdet = logdet_r + denom.ln();
            let quad = quad_r - cross * cross * s / denom;
            log_likelihood -= 0.5 * (m as f64 * LN_2PI + logdet + quad);
        }
        a_pred.push(ap);
        p_pred.push(pp);
        a_filt.push(af);
        p_filt.push(pf);
    }

    let mut mean = a_filt.clone();
    let mut var = p_filt.clone();
    let mut lag_cov = vec![DMatrix::<f64>::zeros(order, order); n];
    for t in (0..n.saturating_sub(1)).rev() {
        let pred_inv = invert_spd(&p_pred[t + 1])
            .ok_or_else(|| format!("singular predicted covariance at t = {}", t + 1))?;
        let gain = &p_filt[t] * transition.transpose() * pred_inv;
        let smoothed_mean = &a_filt[t] + &gain * (&mean[t + 1] - &a_pred[t + 1]);
        let smoothed_var = &p_filt[t] + &gain * (&var[t + 1] - &p_pred[t + 1]) * gain.transpose();
        lag_cov[t + 1] = &var[t + 1] * gain.transpose();
        mean[t] = smoothed_mean;
        var[t] = smoothed_var;
    }

    Ok(Smoothed {
        mean,
        var,
        lag_cov,
        log_likelihood,
    })
}

fn m_step(y: &[Vec<f64>], s: &Smoothed, p: usize, order: usize) -> FactorState {
    let factor = s.factor();
    let second: Vec<f64> = s
        .mean
        .iter()
        .zip(&s.var)
        .map(|(m, v)| m[0] * m[0] + v[(0, 0)])
        .collect();

    // Regress f_t on α_{t−1} = (f_{t−1}, …, f_{t−p})
    let mut s10 = DVector::<f64>::zeros(order);
    let mut s00 = DMatrix::<f64>::zeros(order, order);
    for t in 1..y.len() {
        let joint = &s.mean[t] * s.mean[t - 1].transpose() + &s.lag_cov[t];
        s10 += joint.row(0).transpose();
        s00 += &s.mean[t - 1] * s.mean[t - 1].transpose() + &s.var[t - 1];
    }
    let phi: Vec<f64> = s00
        .cholesky()
        .map(|c| c.solve(&s10).iter().copied().collect())
        .unwrap_or_else(|| vec![0.0; order]);
    let ar_coefficients = stabilize(phi);

    let mut loadings = vec![0.0; p];
    let mut idiosyncratic_var = vec![1.0; p];
    for i in 0..p {
        let (mut num, mut den, mut count) = (0.0, 0.0, 0usize);
        for t in 0..y.len() {
            if !y[t][i].is_nan() {
                num += y[t][i] * factor[t];
                den += second[t];
                count += 1;
            }
        }
        if count == 0 || den <= 0.0 {
            continue;
        }
        let l = num / den;
        let resid: f64 = (0..y.len())
            .filter(|&t| !y[t][i].is_nan())
            .map(|t| y[t][i] * y[t][i] - 2.0 * y[t][i] * l * factor[t] + l * l * second[t])
            .sum();
        loadings[i] = l;
        idiosyncratic_var[i] = (resid / count as f64).max(MIN_IDIOSYNCRATIC_VAR);
    }

    FactorState {
        loadings,
        idiosyncratic_var,
        ar_coefficients,
    }
}

struct EmFit {
    state: FactorState,
    log_likelihood: f64,
    iterations: usize,
    converged: bool,
}

fn fit_em(y: &[Vec<f64>], init: FactorState, max_iter: usize, tol: f64) -> Result<EmFit, String> {
    let p = init.loadings.len();
    let order = init.ar_coefficients.len();
    let mut state = init;
    let mut previous = f64::NEG_INFINITY;
    let mut iterations = 0;
    let mut converged = false;

    for it in 1..=max_iter {
        let smoothed = smooth(y, &state).map_err(|e| format!("{e} at iteration {it}"))?;
        let ll = smoothed.log_likelihood;
        if !ll.is_finite() {
            return Err(format!("non-finite log-likelihood at iteration {it}"));
        }
        iterations = it;
        if previous.is_finite() && (ll - previous).abs() < tol * (1.0 + previous.abs()) {
            converged = true;
            break;
        }
        previous = ll;
        state = m_step(y, &smoothed, p, order);
        if !state.is_finite() {
            return Err(format!("non-finite parameters at iteration {it}"));
        }
    }

    let log_likelihood = smooth(y, &state)?.log_likelihood;
    if !log_likelihood.is_finite() {
        return Err("non-finite final log-likelihood".into());
    }
    Ok(EmFit {
        state,
        log_likelihood,
        iterations,
        converged,
    })
}

// ─── Builder ─────────────────────────────────────────────────────────

/// Everything `transform` needs to rerun the smoother on new rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedFactorModel {
    /// Names of the modelled (non-constant) columns.
    pub columns: Vec<String>,
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
    pub state: FactorState,
    pub output: Option<Cadence>,
}

impl FittedFactorModel {
    /// Standardized rows of the modelled columns, all-missing rows dropped.
    fn observations(&self, matrix: &VariableMatrix) -> Result<(Vec<NaiveDate>, Vec<Vec<f64>>), BuildError> {
        let positions: Option<Vec<usize>> =
            self.columns.iter().map(|c| matrix.column_index(c)).collect();
        let positions = positions.ok_or_else(|| BuildError::ColumnMismatch {
            expected: self.columns.clone(),
            found: matrix.columns().to_vec(),
        })?;

        let mut dates = Vec::new();
        let mut rows = Vec::new();
        for (date, row) in matrix.dates().iter().zip(matrix.rows()) {
            let obs: Vec<f64> = positions
                .iter()
                .enumerate()
                .map(|(k, &j)| {
                    let v = row[j];
                    if v.is_finite() {
                        (v - self.means[k]) / self.stds[k]
                    } else {
                        f64::NAN
                    }
                })
                .collect();
            if obs.iter().any(|v| !v.is_nan()) {
                dates.push(*date);
                rows.push(obs);
            }
        }
        Ok((dates, rows))
    }

    fn factor(&self, dates: Vec<NaiveDate>, rows: &[Vec<f64>]) -> Result<TimeSeries, BuildError> {
        let smoothed = smooth(rows, &self.state).map_err(fit_failure)?;
        let series = TimeSeries::new(dates, smoothed.factor())?;
        Ok(match self.output {
            Some(cadence) => series.resample(cadence),
            None => series,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DfmBuilder {
    params: DfmParams,
    fitted: Option<FittedFactorModel>,
}

impl DfmBuilder {
    pub fn new(params: DfmParams) -> Self {
        Self {
            params,
            fitted: None,
        }
    }

    pub fn model(&self) -> Option<&FittedFactorModel> {
        self.fitted.as_ref()
    }
}

fn fit_failure(reason: impl Into<String>) -> BuildError {
    BuildError::FitFailure {
        builder: BuilderKind::Dfm,
        reason: reason.into(),
    }
}

/// NaN-aware column moments: `(mean, sample std)`, `None` when constant.
fn column_moments(values: &[f64]) -> Option<(f64, f64)> {
    let observed: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if observed.len() < 2 {
        return None;
    }
    let n = observed.len() as f64;
    let mean = observed.iter().sum::<f64>() / n;
    let var = observed.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (var > CONSTANT_EPS).then(|| (mean, var.sqrt()))
}

impl IndexBuilder for DfmBuilder {
    fn kind(&self) -> BuilderKind {
        BuilderKind::Dfm
    }

    fn build(&mut self, matrix: &VariableMatrix) -> Result<BuildOutput, BuildError> {
        ensure_target_blind(matrix)?;
        let order = self.params.factor_order;
        if order == 0 {
            return Err(fit_failure("factor order must be at least 1"));
        }

        let mut columns = Vec::new();
        let mut means = Vec::new();
        let mut stds = Vec::new();
        for (j, name) in matrix.columns().iter().enumerate() {
            if let Some((m, s)) = column_moments(&matrix.column_values(j)) {
                columns.push(name.clone());
                means.push(m);
                stds.push(s);
            }
        }
        if columns.is_empty() {
            return Err(fit_failure("every column is constant"));
        }
        let p = columns.len();
        let mut model = FittedFactorModel {
            columns,
            means,
            stds,
            state: FactorState {
                loadings: vec![0.0; p],
                idiosyncratic_var: vec![1.0; p],
                ar_coefficients: vec![0.0; order],
            },
            output: self.params.output,
        };
        let (dates, rows) = model.observations(matrix)?;
        require_rows(BuilderKind::Dfm, rows.len(), MIN_FIT_ROWS)?;

        let hierarchy = RngHierarchy::new(self.params.seed);
        let mut best: Option<EmFit> = None;
        let mut succeeded = 0;
        for restart in 0..self.params.restarts.max(1) {
            let mut rng = hierarchy.rng_for("dfm_restart", restart as u64);
            let init = FactorState {
                loadings: (0..p)
                    .map(|_| {
                        let magnitude = rng.gen_range(0.2..1.0);
                        if rng.gen_bool(0.5) { magnitude } else { -magnitude }
                    })
                    .collect(),
                idiosyncratic_var: vec![0.5; p],
                ar_coefficients: std::iter::once(rng.gen_range(0.0..0.9))
                    .chain(std::iter::repeat(0.0))
                    .take(order)
                    .collect(),
            };
            match fit_em(&rows, init, self.params.max_iter, self.params.tol) {
                Ok(fit) => {
                    succeeded += 1;
                    if best.as_ref().map_or(true, |b| fit.log_likelihood > b.log_likelihood) {
                        best = Some(fit);
                    }
                }
                Err(reason) => tracing::warn!(restart, %reason, "dfm restart failed"),
            }
        }
        let mut fit = best.ok_or_else(|| fit_failure("every EM restart failed"))?;
        if !fit.converged {
            tracing::warn!(iterations = fit.iterations, "dfm EM hit the iteration cap");
        }
        if fit.state.loadings.iter().all(|l| l.abs() < 1e-8) {
            return Err(fit_failure("degenerate factor: all loadings vanish"));
        }
        canonical_sign(&mut fit.state.loadings);
        model.state = fit.state;

        let index = model.factor(dates, &rows)?;
        let spread = crate::stats::std_population(index.values());
        if !(spread.is_finite() && spread > 1e-8) {
            return Err(fit_failure("degenerate factor: smoothed factor is flat"));
        }

        let n = rows.len() as f64;
        let k = (2 * p + order) as f64;
        let aic = 2.0 * k - 2.0 * fit.log_likelihood;
        let bic = k * n.ln() - 2.0 * fit.log_likelihood;

        let mut loadings: LoadingVector = matrix.columns().iter().map(|c| (c.clone(), 0.0)).collect();
        for (name, l) in model.columns.iter().zip(&model.state.loadings) {
            loadings.insert(name.clone(), *l);
        }
        tracing::info!(
            n_obs = rows.len(),
            log_likelihood = fit.log_likelihood,
            aic,
            restarts_succeeded = succeeded,
            "dfm fitted"
        );

        let output = BuildOutput {
            kind: BuilderKind::Dfm,
            n_observations: index.len(),
            index,
            loadings,
            diagnostics: BuildDiagnostics::Dfm {
                factor_order: order,
                ar_coefficients: model.state.ar_coefficients.clone(),
                log_likelihood: fit.log_likelihood,
                aic,
                bic,
                restarts_succeeded: succeeded,
                iterations: fit.iterations,
                converged: fit.converged,
                n_grid_rows: rows.len(),
            },
        };
        self.fitted = Some(model);
        Ok(output)
    }

    fn transform(&self, matrix: &VariableMatrix) -> Result<TimeSeries, BuildError> {
        let model = self.fitted.as_ref().ok_or(BuildError::NotFitted {
            builder: BuilderKind::Dfm,
        })?;
        let (dates, rows) = model.observations(matrix)?;
        model.factor(dates, &rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::monthly_dates;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn gaussian(rng: &mut StdRng) -> f64 {
        let u1: f64 = rng.gen_range(1e-12..1.0);
        let u2: f64 = rng.gen_range(0.0..1.0);
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    /// AR(0.9) factor seen through three noisy columns.
    fn factor_data(n: usize, seed: u64) -> (Vec<f64>, Vec<Vec<f64>>) {
        ar_factor_data(&[0.9], n, seed)
    }

    fn ar_factor_data(phi: &[f64], n: usize, seed: u64) -> (Vec<f64>, Vec<Vec<f64>>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut f: Vec<f64> = Vec::with_capacity(n);
        for t in 0..n {
            let ar: f64 = phi
                .iter()
                .enumerate()
                .filter(|(j, _)| t > *j)
                .map(|(j, c)| c * f[t - 1 - j])
                .sum();
            f.push(ar + gaussian(&mut rng));
        }
        let rows = f
            .iter()
            .map(|v| {
                vec![
                    v + 0.3 * gaussian(&mut rng),
                    0.7 * v + 0.3 * gaussian(&mut rng),
                    -0.5 * v + 0.3 * gaussian(&mut rng),
                ]
            })
            .collect();
        (f, rows)
    }

    fn monthly(columns: &[&str], rows: Vec<Vec<f64>>) -> VariableMatrix {
        let dates = monthly_dates(d(2005, 1, 1), rows.len());
        VariableMatrix::new(columns.iter().map(|s| s.to_string()).collect(), dates, rows).unwrap()
    }

    fn unresampled() -> DfmParams {
        DfmParams {
            output: None,
            ..DfmParams::default()
        }
    }

    #[test]
    fn recovers_latent_factor() {
        let (f, rows) = factor_data(150, 7);
        let m = monthly(&["net_liquidity", "m2", "hy"], rows);
        let out = DfmBuilder::new(unresampled()).build(&m).unwrap();
        let r = crate::stats::pearson(out.index.values(), &f).unwrap();
        assert!(r.abs() > 0.9, "factor correlation {r}");
        match out.diagnostics {
            BuildDiagnostics::Dfm {
                ar_coefficients,
                log_likelihood,
                aic,
                bic,
                ..
            } => {
                assert_eq!(ar_coefficients.len(), 1);
                assert!(ar_coefficients[0] > 0.6, "phi {ar_coefficients:?}");
                assert!(log_likelihood.is_finite());
                assert!(bic > aic);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(out.loadings["hy"] < 0.0);
        assert!(out.loadings["net_liquidity"] > 0.0);
    }

    #[test]
    fn tolerates_missing_observations() {
        let (_, mut rows) = factor_data(120, 11);
        for (t, row) in rows.iter_mut().enumerate() {
            if t % 3 != 0 {
                row[1] = f64::NAN;
            }
        }
        rows[5] = vec![f64::NAN; 3];
        let m = monthly(&["a", "b", "c"], rows);
        let out = DfmBuilder::new(unresampled()).build(&m).unwrap();
        assert_eq!(out.n_observations, 119);
        assert!(out.index.values().iter().all(|v| v.is_finite()));
        assert!(matches!(out.diagnostics, BuildDiagnostics::Dfm { n_grid_rows: 119, .. }));
    }

    #[test]
    fn seeded_fit_is_deterministic() {
        let (_, rows) = factor_data(80, 3);
        let m = monthly(&["a", "b", "c"], rows);
        let a = DfmBuilder::new(unresampled()).build(&m).unwrap();
        let b = DfmBuilder::new(unresampled()).build(&m).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn transform_reruns_smoother() {
        let (_, rows) = factor_data(90, 5);
        let m = monthly(&["a", "b", "c"], rows);
        let mut dfm = DfmBuilder::new(unresampled());
        let out = dfm.build(&m).unwrap();
        assert_eq!(out.index, dfm.transform(&m).unwrap());
    }

    #[test]
    fn second_order_factor_is_fitted() {
        let (f, rows) = ar_factor_data(&[0.5, 0.3], 200, 13);
        let m = monthly(&["net_liquidity", "m2", "hy"], rows);
        let params = DfmParams {
            factor_order: 2,
            ..unresampled()
        };
        let mut dfm = DfmBuilder::new(params);
        let out = dfm.build(&m).unwrap();
        let r = crate::stats::pearson(out.index.values(), &f).unwrap();
        assert!(r.abs() > 0.9, "factor correlation {r}");
        match &out.diagnostics {
            BuildDiagnostics::Dfm { factor_order, ar_coefficients, .. } => {
                assert_eq!(*factor_order, 2);
                assert_eq!(ar_coefficients.len(), 2);
                let persistence: f64 = ar_coefficients.iter().sum();
                assert!(persistence > 0.5 && persistence < 1.0, "phi {ar_coefficients:?}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(out.index, dfm.transform(&m).unwrap());
    }

    #[test]
    fn third_order_factor_builds() {
        let (_, rows) = factor_data(100, 4);
        let m = monthly(&["a", "b", "c"], rows);
        let params = DfmParams {
            factor_order: 3,
            ..unresampled()
        };
        let out = DfmBuilder::new(params).build(&m).unwrap();
        assert!(out.index.values().iter().all(|v| v.is_finite()));
        assert!(matches!(&out.diagnostics, BuildDiagnostics::Dfm { ar_coefficients, .. } if ar_coefficients.len() == 3));
    }

    #[test]
    fn zero_factor_order_is_fit_failure() {
        let (_, rows) = factor_data(40, 1);
        let m = monthly(&["a", "b", "c"], rows);
        let params = DfmParams {
            factor_order: 0,
            ..DfmParams::default()
        };
        let err = DfmBuilder::new(params).build(&m).unwrap_err();
        assert!(matches!(err, BuildError::FitFailure { builder: BuilderKind::Dfm, .. }));
        assert!(err.allows_fallback());
    }

    #[test]
    fn stationary_covariance_matches_closed_forms() {
        let p = stationary_covariance(&[0.5]).unwrap();
        assert!((p[(0, 0)] - 1.0 / 0.75).abs() < 1e-12);

        // AR(2): γ0 = (1 − φ2) / ((1 + φ2)((1 − φ2)² − φ1²))
        let (a, b) = (0.5, 0.3);
        let gamma0 = (1.0 - b) / ((1.0 + b) * ((1.0 - b) * (1.0 - b) - a * a));
        let p = stationary_covariance(&[a, b]).unwrap();
        assert!((p[(0, 0)] - gamma0).abs() < 1e-9);
        assert!((p[(1, 1)] - gamma0).abs() < 1e-9);

        assert!(stationary_covariance(&[1.2]).is_none());
        assert!(stationary_covariance(&[0.7, 0.5]).is_none());
    }

    #[test]
    fn explosive_coefficients_are_damped() {
        let phi = stabilize(vec![0.7, 0.5]);
        assert!(stationary_covariance(&phi).is_some());
        assert!(phi[0] < 0.7 && phi[1] < 0.5);
        assert_eq!(stabilize(vec![0.4, 0.2]), vec![0.4, 0.2]);
    }

    #[test]
    fn iteration_cap_is_reported_as_not_converged() {
        let (_, rows) = factor_data(60, 8);
        let m = monthly(&["a", "b", "c"], rows);
        let params = DfmParams {
            max_iter: 2,
            tol: 0.0,
            ..unresampled()
        };
        let out = DfmBuilder::new(params).build(&m).unwrap();
        assert!(!out.diagnostics.converged());
        let out = DfmBuilder::new(unresampled()).build(&m).unwrap();
        assert!(out.diagnostics.converged());
    }

    #[test]
    fn constant_column_gets_zero_loading() {
        let (_, rows) = factor_data(60, 9);
        let rows = rows
            .into_iter()
            .map(|mut r| {
                r.push(4.0);
                r
            })
            .collect();
        let m = monthly(&["a", "b", "c", "flat"], rows);
        let out = DfmBuilder::new(unresampled()).build(&m).unwrap();
        assert_eq!(out.loadings["flat"], 0.0);
        assert_eq!(out.loadings.len(), 4);
    }

    #[test]
    fn daily_grid_rolls_weekends_forward() {
        // 2024-03-02 is a Saturday, 2024-03-04 a Monday
        let daily = TimeSeries::from_pairs(vec![(d(2024, 3, 1), 1.0), (d(2024, 3, 2), 2.0), (d(2024, 3, 6), 3.0)]);
        let monthly = TimeSeries::from_pairs(vec![(d(2024, 3, 1), 10.0)]);
        let m = prepare_daily_matrix(vec![("sofr".into(), daily), ("m2".into(), monthly)]).unwrap();

        assert_eq!(m.dates(), &[d(2024, 3, 1), d(2024, 3, 4), d(2024, 3, 5), d(2024, 3, 6)]);
        assert_eq!(m.rows()[1][0], 2.0);
        assert!(m.rows()[2][0].is_nan());
        assert_eq!(m.rows()[0][1], 10.0);
        assert!(m.rows()[3][1].is_nan());
    }

    #[test]
    fn daily_factor_resamples_to_months() {
        let (_, rows) = factor_data(130, 21);
        let mut dates = Vec::new();
        let mut day = d(2023, 1, 2);
        while dates.len() < rows.len() {
            if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
                dates.push(day);
            }
            day += Duration::days(1);
        }
        let series = (0..3)
            .map(|j| {
                let s = TimeSeries::new(dates.clone(), rows.iter().map(|r| r[j]).collect()).unwrap();
                (format!("v{j}"), s)
            })
            .collect();
        let grid = prepare_daily_matrix(series).unwrap();
        let out = DfmBuilder::new(DfmParams::default()).build(&grid).unwrap();
        assert!(out.index.dates().iter().all(|date| date.day() == 1));
        assert_eq!(out.index.dates()[0], d(2023, 1, 1));
        assert_eq!(out.index.len(), 6);
    }
}
