//! Cell-wise transforms of a reduced window: GEV return period and
//! threshold classes.

use std::ops::Range;

use ndarray::{Array2, Zip};

use super::{
    temporal::Reduction, Analysis, FxParams, Product, Stack, WindowSpec,
};
use crate::{
    error::{HatError, Result},
    reading::Field,
    time_window::TimeWindow,
};

const RP_MIN: f64 = 1.0;
const RP_MAX: f64 = 1000.0;

/// GEV parameters of one domain, one value per cell.
///
/// `shape` follows the convention where a positive value means a heavy
/// upper tail (Fréchet type).
#[derive(Debug, Clone, PartialEq)]
pub struct GevGrids {
    pub shape: Array2<f64>,
    pub scale: Array2<f64>,
    pub location: Array2<f64>,
}

impl GevGrids {
    pub fn uniform(dim: (usize, usize), shape: f64, scale: f64, location: f64) -> Self {
        GevGrids {
            shape: Array2::from_elem(dim, shape),
            scale: Array2::from_elem(dim, scale),
            location: Array2::from_elem(dim, location),
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.shape.dim()
    }

    pub fn check(&self) -> Result<()> {
        let dim = self.dim();
        if self.scale.dim() != dim || self.location.dim() != dim {
            return Err(HatError::config(format!(
                "GEV grids differ in shape: {:?}, {:?}, {:?}",
                dim,
                self.scale.dim(),
                self.location.dim()
            )));
        }
        Ok(())
    }
}

pub fn gev_cdf(x: f64, shape: f64, scale: f64, location: f64) -> f64 {
    if x.is_nan() || !(scale > 0.0) {
        return f64::NAN;
    }
    let s = (x - location) / scale;
    if shape.abs() < 1e-9 {
        return (-(-s).exp()).exp();
    }
    let t = 1.0 + shape * s;
    if t <= 0.0 {
        return if shape > 0.0 { 0.0 } else { 1.0 };
    }
    (-t.powf(-1.0 / shape)).exp()
}

/// Return period in years of a value, `1 / (1 - F(x))`.
pub fn return_period(x: f64, shape: f64, scale: f64, location: f64) -> f64 {
    let f = gev_cdf(x, shape, scale, location);
    if f.is_nan() {
        return f64::NAN;
    }
    if f >= 1.0 {
        return f64::INFINITY;
    }
    1.0 / (1.0 - f)
}

#[derive(Debug)]
pub struct ReturnPeriod {
    reduction: Reduction,
    rp_min: f64,
    rp_max: f64,
    scalar: Option<(f64, f64, f64)>,
}

impl ReturnPeriod {
    pub fn build(params: &FxParams) -> Result<Box<dyn Analysis>> {
        let rp_min = params.number("rp_min")?.unwrap_or(RP_MIN);
        let rp_max = params.number("rp_max")?.unwrap_or(RP_MAX);
        if rp_min > rp_max {
            return Err(HatError::config("rp_min must not exceed rp_max"));
        }

        let scalar = match (
            params.number("gev_shape")?,
            params.number("gev_scale")?,
            params.number("gev_location")?,
        ) {
            (Some(shape), Some(scale), Some(location)) => Some((shape, scale, location)),
            (None, None, None) => None,
            _ => {
                return Err(HatError::config(
                    "gev_shape, gev_scale and gev_location go together",
                ))
            }
        };

        Ok(Box::new(ReturnPeriod {
            reduction: Reduction::from_params(params, Reduction::Maximum)?,
            rp_min,
            rp_max,
            scalar,
        }))
    }
}

impl Analysis for ReturnPeriod {
    fn range(&self, window: &TimeWindow, spec: &WindowSpec) -> Range<usize> {
        self.reduction.range(window, spec)
    }

    fn needs_gev(&self) -> bool {
        self.scalar.is_none()
    }

    fn apply(&self, stack: &Stack) -> Result<Product> {
        let reduced = self.reduction.reduce(stack);

        let uniform;
        let grids = match (self.scalar, stack.gev) {
            (Some((shape, scale, location)), _) => {
                uniform = GevGrids::uniform(reduced.shape(), shape, scale, location);
                &uniform
            }
            (None, Some(grids)) => grids,
            (None, None) => {
                return Err(HatError::config(
                    "return_period needs GEV grids in the static data or scalar parameters",
                ))
            }
        };
        if grids.dim() != reduced.shape() {
            return Err(HatError::format(
                stack.origin,
                format!(
                    "GEV grids are {:?} but the data is {:?}",
                    grids.dim(),
                    reduced.shape()
                ),
            ));
        }

        let mut values = Array2::from_elem(reduced.shape(), f64::NAN);
        Zip::from(&mut values)
            .and(&reduced.values)
            .and(&grids.shape)
            .and(&grids.scale)
            .and(&grids.location)
            .for_each(|rp, &x, &shape, &scale, &location| {
                let period = return_period(x, shape, scale, location);
                if !period.is_nan() {
                    *rp = period.clamp(self.rp_min, self.rp_max);
                }
            });

        Ok(Product::new(Field {
            values,
            ..reduced
        })
        .with_attr("rp_min", self.rp_min)
        .with_attr("rp_max", self.rp_max))
    }
}

/// Class of each cell: the number of thresholds at or below its value.
#[derive(Debug)]
pub struct Threshold {
    reduction: Reduction,
    thresholds: Vec<f64>,
}

impl Threshold {
    pub fn build(params: &FxParams) -> Result<Box<dyn Analysis>> {
        let thresholds = params
            .numbers("thresholds")?
            .ok_or_else(|| HatError::config("threshold needs a `thresholds` list"))?;
        if thresholds.is_empty() || thresholds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(HatError::config("`thresholds` must be strictly ascending"));
        }

        Ok(Box::new(Threshold {
            reduction: Reduction::from_params(params, Reduction::Maximum)?,
            thresholds,
        }))
    }
}

impl Analysis for Threshold {
    fn range(&self, window: &TimeWindow, spec: &WindowSpec) -> Range<usize> {
        self.reduction.range(window, spec)
    }

    fn apply(&self, stack: &Stack) -> Result<Product> {
        let mut field = self.reduction.reduce(stack);
        field.values.mapv_inplace(|v| {
            if v.is_nan() {
                v
            } else {
                self.thresholds.iter().filter(|t| **t <= v).count() as f64
            }
        });

        let thresholds: Vec<String> = self.thresholds.iter().map(f64::to_string).collect();
        Ok(Product::new(field).with_attr("thresholds", thresholds.join(",")))
    }
}

// -- Tests -------------------------------------------------------------------
