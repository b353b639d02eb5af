//! Time window around the run's reference time.

use std::{collections::BTreeSet, fmt, ops::Range};

use chrono::{DurationRound, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};

use crate::error::{HatError, Result};

/// Largest number of steps on either side of the reference.
pub const MAX_WINDOW_STEPS: i64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Hourly,
    Daily,
}

impl Frequency {
    pub fn from_code(code: &str) -> Result<Self> {
        match code.trim().to_lowercase().as_str() {
            "h" | "hourly" => Ok(Frequency::Hourly),
            "d" | "daily" => Ok(Frequency::Daily),
            other => Err(HatError::config(format!(
                "time frequency `{}` is not supported (expected H or D)",
                other
            ))),
        }
    }

    pub fn step(&self) -> TimeDelta {
        match self {
            Frequency::Hourly => TimeDelta::hours(1),
            Frequency::Daily => TimeDelta::days(1),
        }
    }
}

/// Processing order of the time steps, fixed for a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

/// Side of the reference a windowed analysis looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowSide {
    #[default]
    Left,
    Right,
}

impl fmt::Display for WindowSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowSide::Left => write!(f, "left"),
            WindowSide::Right => write!(f, "right"),
        }
    }
}

/// Floors `time` to the frequency unit.
pub fn round_down(time: NaiveDateTime, frequency: Frequency) -> Result<NaiveDateTime> {
    time.duration_trunc(frequency.step())
        .map_err(|e| HatError::config(format!("can't round {}: {}", time, e)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeWindow {
    steps: Vec<NaiveDateTime>,
    idx_reference: usize,
}

impl TimeWindow {
    /// `left` steps ending at `reference` (inclusive) plus `right` steps after it.
    pub fn build(
        reference: NaiveDateTime,
        left: i64,
        right: i64,
        frequency: Frequency,
    ) -> Result<Self> {
        if left > MAX_WINDOW_STEPS || right > MAX_WINDOW_STEPS {
            return Err(HatError::config(format!(
                "time window {} + {} steps exceeds {} steps per side",
                left, right, MAX_WINDOW_STEPS
            )));
        }
        let offset = |i: i64| -> Result<TimeDelta> {
            i32::try_from(i)
                .ok()
                .and_then(|i| frequency.step().checked_mul(i))
                .ok_or_else(|| HatError::config(format!("time window offset {} is out of range", i)))
        };
        let out_of_range =
            || HatError::config(format!("time window around {} leaves the calendar", reference));

        let mut steps = BTreeSet::new();
        for i in (0..left.max(1)).rev() {
            let time = reference.checked_sub_signed(offset(i)?).ok_or_else(out_of_range)?;
            steps.insert(time);
        }
        for i in 1..=right.max(0) {
            let time = reference.checked_add_signed(offset(i)?).ok_or_else(out_of_range)?;
            steps.insert(time);
        }

        let steps: Vec<NaiveDateTime> = steps.into_iter().collect();
        let idx_reference = steps
            .iter()
            .position(|t| *t == reference)
            .ok_or_else(|| {
                HatError::config(format!("reference time {} is not part of its window", reference))
            })?;

        Ok(TimeWindow {
            steps,
            idx_reference,
        })
    }

    pub fn steps(&self) -> &[NaiveDateTime] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn idx_reference(&self) -> usize {
        self.idx_reference
    }

    pub fn reference(&self) -> NaiveDateTime {
        self.steps[self.idx_reference]
    }

    pub fn ordered(&self, direction: Direction) -> Vec<NaiveDateTime> {
        match direction {
            Direction::Forward => self.steps.clone(),
            Direction::Backward => self.steps.iter().rev().copied().collect(),
        }
    }

    /// Index range of a sub-window of `size` steps anchored at the reference.
    ///
    /// `None` selects the whole window. A left sub-window ends at the
    /// reference, a right one starts at it; both are clamped to the window.
    pub fn slice(&self, size: Option<usize>, side: WindowSide) -> Range<usize> {
        let idx = self.idx_reference;
        match size {
            None => 0..self.steps.len(),
            Some(size) => {
                let size = size.max(1);
                match side {
                    WindowSide::Left => (idx + 1).saturating_sub(size)..idx + 1,
                    WindowSide::Right => idx..(idx + size).min(self.steps.len()),
                }
            }
        }
    }
}

// -- Tests -------------------------------------------------------------------
