//! Reductions across ensemble members at the reference step.

use ndarray::{Array2, ArrayView2};

use super::{fold_nan, Analysis, FxParams, InputKind, Product, Stack};
use crate::{
    error::{HatError, Result},
    reading::Field,
};

/// Quantiles of each row of `members` (`[cells, members]`), linear
/// interpolation between order statistics. NaN members are left out; a
/// row without values gives NaN.
pub fn quantiles(members: ArrayView2<f64>, probabilities: &[f64]) -> Array2<f64> {
    let mut table = Array2::from_elem((members.nrows(), probabilities.len()), f64::NAN);

    for (row, mut out) in members.rows().into_iter().zip(table.rows_mut()) {
        let mut sorted: Vec<f64> = row.iter().copied().filter(|v| !v.is_nan()).collect();
        if sorted.is_empty() {
            continue;
        }
        sorted.sort_by(f64::total_cmp);

        let last = (sorted.len() - 1) as f64;
        for (target, q) in out.iter_mut().zip(probabilities) {
            let pos = q * last;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            *target = sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo]);
        }
    }

    table
}

fn members_by_cell(stack: &Stack) -> Array2<f64> {
    let (rows, cols) = stack.shape();
    let mut members = Array2::from_elem((rows * cols, stack.fields.len()), f64::NAN);
    for (k, field) in stack.fields.iter().enumerate() {
        for (cell, value) in field.values.iter().enumerate() {
            members[[cell, k]] = *value;
        }
    }
    members
}

#[derive(Debug)]
pub struct Quantile {
    probabilities: Vec<f64>,
}

impl Quantile {
    pub fn build(params: &FxParams) -> Result<Box<dyn Analysis>> {
        let probabilities = params
            .numbers("quantiles")?
            .ok_or_else(|| HatError::config("quantile needs a `quantiles` list"))?;
        if probabilities.is_empty() || probabilities.iter().any(|q| !(0.0..=1.0).contains(q)) {
            return Err(HatError::config(
                "`quantiles` must be a non-empty list of values in [0, 1]",
            ));
        }

        Ok(Box::new(Quantile { probabilities }))
    }
}

impl Analysis for Quantile {
    fn input(&self) -> InputKind {
        InputKind::Members
    }

    fn apply(&self, stack: &Stack) -> Result<Product> {
        let table = quantiles(members_by_cell(stack).view(), &self.probabilities);
        let columns = self.probabilities.iter().map(|q| format!("q{}", q)).collect();

        Ok(Product::new(Field::new(table).with_columns(columns))
            .with_attr("members", stack.fields.len()))
    }
}

/// Mean over members, NaN skipped.
#[derive(Debug)]
pub struct EnsembleAverage;

impl EnsembleAverage {
    pub fn build(_params: &FxParams) -> Result<Box<dyn Analysis>> {
        Ok(Box::new(EnsembleAverage))
    }
}

impl Analysis for EnsembleAverage {
    fn input(&self) -> InputKind {
        InputKind::Members
    }

    fn apply(&self, stack: &Stack) -> Result<Product> {
        let (mut sum, counts) = fold_nan(stack, |a, v| a + v);
        ndarray::Zip::from(&mut sum).and(&counts).for_each(|s, &n| {
            if n > 0 {
                *s /= n as f64;
            }
        });

        Ok(Product::new(stack.like(sum)).with_attr("members", stack.fields.len()))
    }
}

// -- Tests -------------------------------------------------------------------
