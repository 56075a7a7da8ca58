//! Period-keyed scalar series.
//!
//! A `TimeSeries` is the unit every stage exchanges: builders emit one, the
//! target arrives as one, metrics align two of them. Keys are strictly
//! ascending `NaiveDate`s; monthly periods are keyed by the first day of the
//! month. Missing observations are `NaN`.

use std::collections::BTreeMap;

use chrono::{Datelike, Duration, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from series construction.
#[derive(Debug, Error, PartialEq)]
pub enum SeriesError {
    #[error("length mismatch: {dates} dates vs {values} values")]
    LengthMismatch { dates: usize, values: usize },
    #[error("dates not strictly ascending at position {position}")]
    Unordered { position: usize },
}

/// Coarser cadence a daily series can be resampled to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cadence {
    /// Keyed by the Monday of each week.
    Weekly,
    /// Keyed by the first day of each month.
    Monthly,
}

impl Cadence {
    /// Period key a date belongs to.
    pub fn period_key(self, date: NaiveDate) -> NaiveDate {
        match self {
            Cadence::Weekly => {
                date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
            }
            Cadence::Monthly => date.with_day(1).unwrap_or(date),
        }
    }
}

/// Scalar series keyed by period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    dates: Vec<NaiveDate>,
    values: Vec<f64>,
}

impl TimeSeries {
    /// Build from parallel vectors. Dates must be strictly ascending.
    pub fn new(dates: Vec<NaiveDate>, values: Vec<f64>) -> Result<Self, SeriesError> {
        if dates.len() != values.len() {
            return Err(SeriesError::LengthMismatch {
                dates: dates.len(),
                values: values.len(),
            });
        }
        if let Some(position) = dates.windows(2).position(|w| w[0] >= w[1]) {
            return Err(SeriesError::Unordered {
                position: position + 1,
            });
        }
        Ok(Self { dates, values })
    }

    /// Build from unordered pairs; a repeated date keeps the last value.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (NaiveDate, f64)>,
    {
        let map: BTreeMap<NaiveDate, f64> = pairs.into_iter().collect();
        let (dates, values) = map.into_iter().unzip();
        Self { dates, values }
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Value at `date`, if the key exists.
    pub fn get(&self, date: NaiveDate) -> Option<f64> {
        self.dates
            .binary_search(&date)
            .ok()
            .map(|i| self.values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (NaiveDate, f64)> + '_ {
        self.dates.iter().copied().zip(self.values.iter().copied())
    }

    /// Sign-flipped copy.
    pub fn negated(&self) -> Self {
        Self {
            dates: self.dates.clone(),
            values: self.values.iter().map(|v| -v).collect(),
        }
    }

    /// Values of both series on their common keys, in key order.
    ///
    /// `NaN` values are kept; callers that need complete pairs drop them
    /// after any shifting they apply.
    pub fn align(&self, other: &TimeSeries) -> (Vec<f64>, Vec<f64>) {
        let mut left = Vec::new();
        let mut right = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.dates.len() && j < other.dates.len() {
            match self.dates[i].cmp(&other.dates[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    left.push(self.values[i]);
                    right.push(other.values[j]);
                    i += 1;
                    j += 1;
                }
            }
        }
        (left, right)
    }

    /// Copy without `NaN` observations.
    pub fn dropna(&self) -> Self {
        let (dates, values) = self.iter().filter(|(_, v)| !v.is_nan()).unzip();
        Self { dates, values }
    }

    /// Last non-missing observation per period of `cadence`.
    pub fn resample(&self, cadence: Cadence) -> Self {
        let mut buckets: BTreeMap<NaiveDate, f64> = BTreeMap::new();
        for (date, value) in self.dropna().iter() {
            buckets.insert(cadence.period_key(date), value);
        }
        let (dates, values) = buckets.into_iter().unzip();
        Self { dates, values }
    }
}

/// `n` consecutive month keys starting at `start`'s month.
pub fn monthly_dates(start: NaiveDate, n: usize) -> Vec<NaiveDate> {
    let first = Cadence::Monthly.period_key(start);
    (0..n)
        .map(|i| {
            u32::try_from(i)
                .ok()
                .and_then(|m| first.checked_add_months(Months::new(m)))
                .unwrap_or(NaiveDate::MAX)
        })
        .collect()
}
