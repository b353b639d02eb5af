//! Reductions of one entity's time steps.

use std::ops::Range;

use ndarray::Array2;

use super::{fold_nan, Analysis, FxParams, Product, Stack, WindowSpec, ATTR_TIME_FORMAT};
use crate::{
    error::{HatError, Result},
    reading::Field,
    time_window::TimeWindow,
};

/// How a window of fields collapses into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Value at the reference step.
    Snapshot,
    Accumulation,
    Average,
    Maximum,
}

impl Reduction {
    pub fn from_params(params: &FxParams, default: Reduction) -> Result<Self> {
        match params.text("reduction")? {
            None => Ok(default),
            Some("snapshot") => Ok(Reduction::Snapshot),
            Some("accumulation") => Ok(Reduction::Accumulation),
            Some("average") => Ok(Reduction::Average),
            Some("maximum") => Ok(Reduction::Maximum),
            Some(other) => Err(HatError::config(format!("unknown reduction `{}`", other))),
        }
    }

    pub fn range(&self, window: &TimeWindow, spec: &WindowSpec) -> Range<usize> {
        match self {
            Reduction::Snapshot => window.idx_reference()..window.idx_reference() + 1,
            _ => window.slice(spec.size, spec.side),
        }
    }

    pub fn reduce(&self, stack: &Stack) -> Field {
        let values = match self {
            Reduction::Snapshot => stack
                .fields
                .iter()
                .zip(&stack.steps)
                .find(|(_, step)| **step == stack.idx_reference)
                .map(|(field, _)| field.values.clone())
                .unwrap_or_else(|| Array2::from_elem(stack.shape(), f64::NAN)),
            Reduction::Accumulation => fold_nan(stack, |a, v| a + v).0,
            Reduction::Average => {
                let (mut sum, counts) = fold_nan(stack, |a, v| a + v);
                ndarray::Zip::from(&mut sum).and(&counts).for_each(|s, &n| {
                    if n > 0 {
                        *s /= n as f64;
                    }
                });
                sum
            }
            Reduction::Maximum => fold_nan(stack, f64::max).0,
        };

        stack.like(values)
    }
}

macro_rules! reduction_fx {
    ($name:ident, $reduction:expr) => {
        #[derive(Debug)]
        pub struct $name;

        impl $name {
            pub fn build(_params: &FxParams) -> Result<Box<dyn Analysis>> {
                Ok(Box::new($name))
            }
        }

        impl Analysis for $name {
            fn range(&self, window: &TimeWindow, spec: &WindowSpec) -> Range<usize> {
                $reduction.range(window, spec)
            }

            fn apply(&self, stack: &Stack) -> Result<Product> {
                Ok(Product::new($reduction.reduce(stack)))
            }
        }
    };
}

reduction_fx!(Snapshot, Reduction::Snapshot);
reduction_fx!(Accumulation, Reduction::Accumulation);
reduction_fx!(Average, Reduction::Average);
reduction_fx!(Maximum, Reduction::Maximum);

/// Hydrograph: one row per available step, one column per cell.
#[derive(Debug)]
pub struct Series;

impl Series {
    pub fn build(_params: &FxParams) -> Result<Box<dyn Analysis>> {
        Ok(Box::new(Series))
    }
}

impl Analysis for Series {
    fn apply(&self, stack: &Stack) -> Result<Product> {
        let (rows, cols) = stack.shape();
        let cells = rows * cols;

        let mut values = Array2::from_elem((stack.fields.len(), cells), f64::NAN);
        for (mut row, field) in values.rows_mut().into_iter().zip(&stack.fields) {
            for (target, value) in row.iter_mut().zip(field.values.iter()) {
                *target = *value;
            }
        }

        let columns = stack
            .fields
            .first()
            .filter(|field| field.columns.len() == cells)
            .map(|field| field.columns.clone())
            .unwrap_or_default();

        Ok(Product::new(
            Field::new(values)
                .with_times(stack.times.clone())
                .with_columns(columns),
        ))
    }
}

/// Peak value of each cell and its offset in steps from the reference.
#[derive(Debug)]
pub struct Peak;

impl Peak {
    pub fn build(_params: &FxParams) -> Result<Box<dyn Analysis>> {
        Ok(Box::new(Peak))
    }
}

impl Analysis for Peak {
    fn apply(&self, stack: &Stack) -> Result<Product> {
        let (rows, cols) = stack.shape();
        let cells = rows * cols;

        let mut values = Array2::from_elem((cells, 2), f64::NAN);
        let mut overall: Option<(f64, usize)> = None;

        for (k, field) in stack.fields.iter().enumerate() {
            for (cell, &value) in field.values.iter().enumerate() {
                if value.is_nan() {
                    continue;
                }
                let peak = values[[cell, 0]];
                if peak.is_nan() || value > peak {
                    values[[cell, 0]] = value;
                    values[[cell, 1]] = stack.steps[k] as f64 - stack.idx_reference as f64;
                }
                if overall.map_or(true, |(max, _)| value > max) {
                    overall = Some((value, k));
                }
            }
        }

        let field = Field::new(values).with_columns(vec!["peak".to_string(), "offset".to_string()]);
        let product = Product::new(field);
        Ok(match overall {
            Some((_, k)) => product.with_attr("time_peak", stack.times[k].format(ATTR_TIME_FORMAT)),
            None => product,
        })
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod test {
    use std::path::Path;

    use ndarray::array;
    use serde_json::json;

    use crate::{
        analysis::test::{at, plan_for},
        time_window::Frequency,
    };

    use super::*;

    fn window() -> TimeWindow {
        TimeWindow::build(at(11), 2, 1, Frequency::Hourly).unwrap()
    }

    fn stack_of(fields: &[Field]) -> Vec<Vec<Option<&Field>>> {
        fields.iter().map(|field| vec![Some(field)]).collect()
    }

    #[test]
    fn should_take_reference_and_nan_aware_maximum() {
        let nan = f64::NAN;
        let a = Field::new(array![[1.0, 5.0, nan]]);
        let b = Field::new(array![[2.0, nan, nan]]);
        let c = Field::new(array![[0.5, 4.0, nan]]);
        let fields = [a, b, c];
        let slots = stack_of(&fields);

        let reference = plan_for("snapshot", json!({}));
        let snapshot_slots = vec![vec![Some(&fields[1])]];
        let product = reference
            .run(&window(), &snapshot_slots, None, Path::new("q_ref.asc"))
            .unwrap()
            .unwrap();
        assert_eq!(product.field.values[[0, 0]], 2.0);
        assert_eq!(product.attrs["time_from"], "2024-10-01 11:00");
        assert_eq!(product.attrs["time_window"], "1");

        let maximum = plan_for("maximum", json!({}));
        let product = maximum
            .run(&window(), &slots, None, Path::new("q_max.asc"))
            .unwrap()
            .unwrap();
        let values = product.field.values;
        assert_eq!(values[[0, 0]], 2.0);
        assert_eq!(values[[0, 1]], 5.0);
        assert!(values[[0, 2]].is_nan());
        assert_eq!(product.attrs["time_window"], "3");
    }

    #[test]
    fn should_accumulate_and_average_skipping_nan() {
        let nan = f64::NAN;
        let fields = [
            Field::new(array![[1.0, nan]]),
            Field::new(array![[2.0, nan]]),
            Field::new(array![[nan, nan]]),
        ];
        let slots = stack_of(&fields);

        let sum = plan_for("accumulation", json!({}))
            .run(&window(), &slots, None, Path::new("rain.asc"))
            .unwrap()
            .unwrap();
        assert_eq!(sum.field.values[[0, 0]], 3.0);
        assert!(sum.field.values[[0, 1]].is_nan());

        let mean = plan_for("average", json!({}))
            .run(&window(), &slots, None, Path::new("rain.asc"))
            .unwrap()
            .unwrap();
        assert_eq!(mean.field.values[[0, 0]], 1.5);
    }

    #[test]
    fn should_look_right_of_reference() {
        let fields = [Field::new(array![[4.0]]), Field::new(array![[6.0]])];
        let slots = stack_of(&fields);

        let product = plan_for("accumulation", json!({ "time_window": 2, "time_direction": "right" }))
            .run(&window(), &slots, None, Path::new("rain.asc"))
            .unwrap()
            .unwrap();

        assert_eq!(product.field.values[[0, 0]], 10.0);
        assert_eq!(product.attrs["time_from"], "2024-10-01 11:00");
        assert_eq!(product.attrs["time_to"], "2024-10-01 12:00");
        assert_eq!(product.attrs["time_direction"], "right");
    }

    #[test]
    fn should_stack_series_with_times() {
        let fields = [
            Field::new(array![[1.0, 2.0]]).with_columns(vec!["a".into(), "b".into()]),
            Field::new(array![[3.0, 4.0]]).with_columns(vec!["a".into(), "b".into()]),
        ];
        let slots = vec![vec![Some(&fields[0])], vec![None], vec![Some(&fields[1])]];

        let product = plan_for("series", json!({}))
            .run(&window(), &slots, None, Path::new("q.csv"))
            .unwrap()
            .unwrap();

        assert_eq!(product.field.values, array![[1.0, 2.0], [3.0, 4.0]]);
        assert_eq!(product.field.times, vec![at(10), at(12)]);
        assert_eq!(product.field.columns, vec!["a", "b"]);
    }

    #[test]
    fn should_find_peak_and_offset() {
        let fields = [
            Field::new(array![[1.0, 9.0]]),
            Field::new(array![[3.0, 2.0]]),
            Field::new(array![[2.0, 1.0]]),
        ];
        let slots = stack_of(&fields);

        let product = plan_for("peak", json!({}))
            .run(&window(), &slots, None, Path::new("peak.csv"))
            .unwrap()
            .unwrap();

        assert_eq!(product.field.values, array![[3.0, 0.0], [9.0, -1.0]]);
        assert_eq!(product.attrs["time_peak"], "2024-10-01 10:00");
    }
}
