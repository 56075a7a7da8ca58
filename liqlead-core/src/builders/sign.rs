//! Sign convention: an extracted index points the same way as the anchor.

use serde::{Deserialize, Serialize};

use crate::series::TimeSeries;
use crate::stats;

/// Overlapping observations needed before the sign is trusted.
pub const MIN_SIGN_OVERLAP: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignCorrection {
    pub flipped: bool,
    /// Correlation with the anchor after correction.
    pub anchor_correlation: Option<f64>,
    pub n_overlap: usize,
    /// Correction skipped: too little overlap or undefined correlation.
    pub low_confidence: bool,
}

/// Flip `index` if it correlates negatively with `anchor`.
///
/// Idempotent: a corrected index correlates non-negatively, so a second
/// pass never flips.
pub fn sign_correct(index: &TimeSeries, anchor: &TimeSeries) -> (TimeSeries, SignCorrection) {
    let (x, y) = index.align(anchor);
    let (x, y): (Vec<f64>, Vec<f64>) = x
        .into_iter()
        .zip(y)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .unzip();
    let n_overlap = x.len();

    if n_overlap < MIN_SIGN_OVERLAP {
        tracing::warn!(
            n_overlap,
            required = MIN_SIGN_OVERLAP,
            "sign correction skipped: low confidence"
        );
        return (
            index.clone(),
            SignCorrection {
                flipped: false,
                anchor_correlation: None,
                n_overlap,
                low_confidence: true,
            },
        );
    }

    match stats::pearson(&x, &y) {
        Some(r) if r < 0.0 => {
            tracing::info!(anchor_correlation = r, "index sign flipped");
            (
                index.negated(),
                SignCorrection {
                    flipped: true,
                    anchor_correlation: Some(-r),
                    n_overlap,
                    low_confidence: false,
                },
            )
        }
        Some(r) => (
            index.clone(),
            SignCorrection {
                flipped: false,
                anchor_correlation: Some(r),
                n_overlap,
                low_confidence: false,
            },
        ),
        None => {
            tracing::warn!(n_overlap, "sign correction skipped: undefined anchor correlation");
            (
                index.clone(),
                SignCorrection {
                    flipped: false,
                    anchor_correlation: None,
                    n_overlap,
                    low_confidence: true,
                },
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::monthly_dates;
    use chrono::NaiveDate;

    fn series(values: Vec<f64>) -> TimeSeries {
        let dates = monthly_dates(NaiveDate::from_ymd_opt(2018, 1, 1).unwrap(), values.len());
        TimeSeries::new(dates, values).unwrap()
    }

    fn wave(n: usize) -> Vec<f64> {
        (0..n).map(|i| (i as f64 * 0.5).sin()).collect()
    }

    #[test]
    fn flips_negative_index() {
        let anchor = series(wave(24));
        let index = anchor.negated();
        let (fixed, info) = sign_correct(&index, &anchor);
        assert!(info.flipped);
        assert_eq!(fixed, anchor);
        assert!(info.anchor_correlation.unwrap() > 0.99);
    }

    #[test]
    fn idempotent() {
        let anchor = series(wave(30));
        let index = series(wave(30).iter().map(|v| -2.0 * v + 0.1).collect());
        let (once, _) = sign_correct(&index, &anchor);
        let (twice, info) = sign_correct(&once, &anchor);
        assert_eq!(once, twice);
        assert!(!info.flipped);
    }

    #[test]
    fn short_overlap_is_low_confidence() {
        let anchor = series(wave(8));
        let index = anchor.negated();
        let (out, info) = sign_correct(&index, &anchor);
        assert!(info.low_confidence);
        assert!(!info.flipped);
        assert_eq!(out, index);
    }

    #[test]
    fn constant_anchor_is_low_confidence() {
        let anchor = series(vec![1.0; 20]);
        let index = series(wave(20));
        let (_, info) = sign_correct(&index, &anchor);
        assert!(info.low_confidence);
        assert!(info.anchor_correlation.is_none());
    }
}
