//! Complete builder rows paired with the target on the same period keys.

use liqlead_core::matrix::VariableMatrix;
use liqlead_core::series::{SeriesError, TimeSeries};

/// Complete matrix rows with an observed target, in date order.
#[derive(Debug, Clone)]
pub struct AlignedSample {
    pub matrix: VariableMatrix,
    pub target: Vec<f64>,
}

impl AlignedSample {
    pub fn new(matrix: &VariableMatrix, target: &TimeSeries) -> Self {
        let complete = matrix.complete_rows();
        let mut keep = Vec::new();
        let mut values = Vec::new();
        for (i, date) in complete.dates().iter().enumerate() {
            if let Some(v) = target.get(*date).filter(|v| v.is_finite()) {
                keep.push(i);
                values.push(v);
            }
        }
        Self {
            matrix: complete.select_rows(&keep),
            target: values,
        }
    }

    pub fn len(&self) -> usize {
        self.target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
    }

    /// Rows at `indices`, keeping their original dates.
    pub fn subset(&self, indices: &[usize]) -> Result<(VariableMatrix, TimeSeries), SeriesError> {
        let matrix = self.matrix.select_rows(indices);
        let target = TimeSeries::new(
            matrix.dates().to_vec(),
            indices.iter().map(|&i| self.target[i]).collect(),
        )?;
        Ok((matrix, target))
    }

    /// Rows at `indices` (repeats allowed) under fresh consecutive keys.
    pub fn resample(&self, indices: &[usize]) -> Result<(VariableMatrix, TimeSeries), SeriesError> {
        let matrix = self.matrix.select_rows(indices).with_sequential_dates();
        let target = TimeSeries::new(
            matrix.dates().to_vec(),
            indices.iter().map(|&i| self.target[i]).collect(),
        )?;
        Ok((matrix, target))
    }
}
