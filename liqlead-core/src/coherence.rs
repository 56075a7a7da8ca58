//! Spectral coherence between index and target.
//!
//! Optional diagnostic: when the pair is too short or carries no power the
//! result is [`Availability::Unavailable`] with a reason, and the pipeline
//! carries on.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

use crate::series::TimeSeries;

/// Result of an optional analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Availability<T> {
    Available(T),
    Unavailable { reason: String },
}

impl<T> Availability<T> {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Availability::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available(_))
    }

    pub fn as_option(&self) -> Option<&T> {
        match self {
            Availability::Available(v) => Some(v),
            Availability::Unavailable { .. } => None,
        }
    }
}

/// Welch coherence summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoherenceSummary {
    pub segment_length: usize,
    pub n_segments: usize,
    /// Period (in observations) of the strongest cross-spectral peak.
    pub dominant_period: f64,
    pub coherence_at_dominant: f64,
    pub mean_coherence: f64,
    /// Index lead implied by the cross-spectrum phase at the dominant period.
    pub phase_lead_periods: f64,
}

const MIN_SEGMENT: usize = 8;
const MAX_SEGMENT: usize = 64;
const MIN_SEGMENTS: usize = 3;

/// Welch magnitude-squared coherence with Hann windows and 50% overlap.
pub fn spectral_coherence(index: &TimeSeries, target: &TimeSeries) -> Availability<CoherenceSummary> {
    let (idx, tgt) = index.align(target);
    let (x, y): (Vec<f64>, Vec<f64>) = idx
        .into_iter()
        .zip(tgt)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .unzip();
    let n = x.len();

    let half = n / 2;
    if half < MIN_SEGMENT {
        return Availability::unavailable(format!("{n} aligned observations, need {}", 2 * MIN_SEGMENT));
    }
    let mut seg = MIN_SEGMENT;
    while seg * 2 <= half && seg * 2 <= MAX_SEGMENT {
        seg *= 2;
    }
    let step = seg / 2;
    let n_segments = (n - seg) / step + 1;
    if n_segments < MIN_SEGMENTS {
        return Availability::unavailable(format!("only {n_segments} Welch segments"));
    }

    let window: Vec<f64> = (0..seg)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / seg as f64).cos())
        .collect();
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(seg);

    let bins = seg / 2;
    let mut pxx = vec![0.0; bins + 1];
    let mut pyy = vec![0.0; bins + 1];
    let mut pxy = vec![Complex::new(0.0, 0.0); bins + 1];

    let spectrum = |data: &[f64]| {
        let m = data.iter().sum::<f64>() / data.len() as f64;
        let mut buf: Vec<Complex<f64>> = data
            .iter()
            .zip(&window)
            .map(|(v, w)| Complex::new((v - m) * w, 0.0))
            .collect();
        fft.process(&mut buf);
        buf
    };

    for s in 0..n_segments {
        let start = s * step;
        let fx = spectrum(&x[start..start + seg]);
        let fy = spectrum(&y[start..start + seg]);
        for k in 0..=bins {
            pxx[k] += fx[k].norm_sqr();
            pyy[k] += fy[k].norm_sqr();
            pxy[k] += fx[k] * fy[k].conj();
        }
    }

    let coherence: Vec<f64> = (1..=bins)
        .map(|k| {
            let denom = pxx[k] * pyy[k];
            if denom > 0.0 {
                (pxy[k].norm_sqr() / denom).clamp(0.0, 1.0)
            } else {
                0.0
            }
        })
        .collect();

    let total_x: f64 = pxx[1..].iter().sum();
    let total_y: f64 = pyy[1..].iter().sum();
    if total_x <= 1e-20 || total_y <= 1e-20 {
        return Availability::unavailable("zero spectral power in one series");
    }

    let mut peak = 1;
    for k in 2..=bins {
        if pxy[k].norm() > pxy[peak].norm() {
            peak = k;
        }
    }
    let omega = 2.0 * std::f64::consts::PI * peak as f64 / seg as f64;

    Availability::Available(CoherenceSummary {
        segment_length: seg,
        n_segments,
        dominant_period: seg as f64 / peak as f64,
        coherence_at_dominant: coherence[peak - 1],
        mean_coherence: coherence.iter().sum::<f64>() / coherence.len() as f64,
        phase_lead_periods: pxy[peak].arg() / omega,
    })
}
