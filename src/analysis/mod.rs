//! Analysis functions selected by name from the fx table.
//!
//! Each destination role names one function of [`REGISTRY`], the source
//! roles it reads and its parameters. The table is checked once, when the
//! driver is built: an unknown name or a malformed parameter stops the run
//! before any file is touched.

pub mod ensemble;
pub mod temporal;
pub mod transform;

use std::{collections::BTreeMap, fmt, ops::Range, path::Path};

use chrono::NaiveDateTime;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    collection::DatasetRole,
    entity::EntityScope,
    error::{HatError, Result},
    reading::Field,
    time_window::{TimeWindow, WindowSide},
};

pub use transform::GevGrids;

pub(crate) const ATTR_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Builds an analysis from its parameters.
pub type Builder = fn(&FxParams) -> Result<Box<dyn Analysis>>;

pub static REGISTRY: &[(&str, Builder)] = &[
    ("snapshot", temporal::Snapshot::build),
    ("accumulation", temporal::Accumulation::build),
    ("average", temporal::Average::build),
    ("maximum", temporal::Maximum::build),
    ("series", temporal::Series::build),
    ("peak", temporal::Peak::build),
    ("quantile", ensemble::Quantile::build),
    ("ensemble_average", ensemble::EnsembleAverage::build),
    ("return_period", transform::ReturnPeriod::build),
    ("threshold", transform::Threshold::build),
];

pub fn lookup(name: &str) -> Option<Builder> {
    REGISTRY
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, builder)| *builder)
}

/// What one input slot of an analysis stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// One field per time step of one entity.
    Steps,
    /// One field per ensemble member at the reference step.
    Members,
}

/// Available fields an analysis reduces, all of the same shape.
#[derive(Debug)]
pub struct Stack<'a> {
    pub fields: Vec<&'a Field>,
    /// Window index of each field (members all sit at the reference).
    pub steps: Vec<usize>,
    pub times: Vec<NaiveDateTime>,
    pub idx_reference: usize,
    pub gev: Option<&'a GevGrids>,
    pub origin: &'a Path,
}

impl<'a> Stack<'a> {
    pub fn shape(&self) -> (usize, usize) {
        self.fields
            .first()
            .map(|field| field.shape())
            .unwrap_or((0, 0))
    }

    /// Template for results: header and columns of the first field.
    pub fn like(&self, values: Array2<f64>) -> Field {
        let first = self.fields.first();
        Field::new(values)
            .with_header(first.and_then(|field| field.header.clone()))
            .with_columns(first.map(|field| field.columns.clone()).unwrap_or_default())
    }

    fn check_shapes(&self) -> Result<()> {
        let shape = self.shape();
        match self.fields.iter().find(|field| field.shape() != shape) {
            Some(field) => Err(HatError::format(
                self.origin,
                format!("inputs of shape {:?} and {:?} can't be combined", shape, field.shape()),
            )),
            None => Ok(()),
        }
    }
}

/// Output of an analysis with the attributes it adds on its own.
#[derive(Debug, Clone)]
pub struct Product {
    pub field: Field,
    pub attrs: BTreeMap<String, String>,
}

impl Product {
    pub fn new(field: Field) -> Self {
        Product {
            field,
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, key: &str, value: impl ToString) -> Self {
        self.attrs.insert(key.to_string(), value.to_string());
        self
    }
}

pub trait Analysis: fmt::Debug + Send + Sync {
    fn input(&self) -> InputKind {
        InputKind::Steps
    }

    /// Window steps the analysis reads.
    fn range(&self, window: &TimeWindow, spec: &WindowSpec) -> Range<usize> {
        match self.input() {
            InputKind::Steps => window.slice(spec.size, spec.side),
            InputKind::Members => window.idx_reference()..window.idx_reference() + 1,
        }
    }

    /// True when the analysis reads the per-domain GEV grids.
    fn needs_gev(&self) -> bool {
        false
    }

    fn apply(&self, stack: &Stack) -> Result<Product>;
}

/// Parameters of one fx entry after `@` bindings are resolved.
#[derive(Debug, Clone, Default)]
pub struct FxParams {
    destination: String,
    values: BTreeMap<String, Value>,
}

impl FxParams {
    pub fn new(destination: &str, values: BTreeMap<String, Value>) -> Self {
        FxParams {
            destination: destination.to_string(),
            values,
        }
    }

    fn invalid(&self, key: &str, expected: &str) -> HatError {
        HatError::config(format!(
            "fx parameter `{}` of `{}` must be {}",
            key, self.destination, expected
        ))
    }

    pub fn number(&self, key: &str) -> Result<Option<f64>> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_f64().map(Some).ok_or_else(|| self.invalid(key, "a number")),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(key, "a number")),
            Some(_) => Err(self.invalid(key, "a number")),
        }
    }

    pub fn count(&self, key: &str) -> Result<Option<usize>> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(|n| Some(n as usize))
                .ok_or_else(|| self.invalid(key, "a non-negative integer")),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(key, "a non-negative integer")),
            Some(_) => Err(self.invalid(key, "a non-negative integer")),
        }
    }

    pub fn numbers(&self, key: &str) -> Result<Option<Vec<f64>>> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| item.as_f64().ok_or_else(|| self.invalid(key, "a list of numbers")))
                .collect::<Result<Vec<f64>>>()
                .map(Some),
            Some(_) => Err(self.invalid(key, "a list of numbers")),
        }
    }

    pub fn text(&self, key: &str) -> Result<Option<&str>> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(self.invalid(key, "a string")),
        }
    }
}

/// Sub-window a temporal analysis reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSpec {
    /// Number of steps, `None` for the whole window.
    pub size: Option<usize>,
    pub side: WindowSide,
}

impl WindowSpec {
    fn from_params(params: &FxParams) -> Result<Self> {
        let side = match params.text("time_direction")? {
            None | Some("left") => WindowSide::Left,
            Some("right") => WindowSide::Right,
            Some(_) => return Err(params.invalid("time_direction", "`left` or `right`")),
        };
        Ok(WindowSpec {
            size: params.count("time_window")?,
            side,
        })
    }
}

/// Bounds applied to every output value, NaN is left alone.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Clamp {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Clamp {
    fn from_params(params: &FxParams) -> Result<Self> {
        let clamp = Clamp {
            min: params.number("value_min")?,
            max: params.number("value_max")?,
        };
        if let (Some(min), Some(max)) = (clamp.min, clamp.max) {
            if min > max {
                return Err(params.invalid("value_min", "lower than value_max"));
            }
        }
        Ok(clamp)
    }

    pub fn apply(&self, values: &mut Array2<f64>) {
        if self.min.is_none() && self.max.is_none() {
            return;
        }
        values.mapv_inplace(|v| {
            let mut v = v;
            if let Some(min) = self.min {
                if v < min {
                    v = min;
                }
            }
            if let Some(max) = self.max {
                if v > max {
                    v = max;
                }
            }
            v
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FxEntry {
    pub fx: String,
    pub inputs: Vec<String>,
    #[serde(default)]
    pub min_inputs: Option<usize>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

/// Destination role name → analysis entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FxTable(pub BTreeMap<String, FxEntry>);

impl FxTable {
    /// Validates the table against the configured roles and builds one
    /// plan per destination.
    pub fn plan(&self, sources: &[DatasetRole], destinations: &[DatasetRole]) -> Result<Vec<FxPlan>> {
        for name in self.0.keys() {
            if !destinations.iter().any(|role| &role.name == name) {
                return Err(HatError::config(format!(
                    "fx entry `{}` has no destination role",
                    name
                )));
            }
        }

        destinations
            .iter()
            .map(|destination| {
                let entry = self.0.get(&destination.name).ok_or_else(|| {
                    HatError::config(format!("destination `{}` has no fx entry", destination.name))
                })?;
                FxPlan::new(destination, entry, sources)
            })
            .collect()
    }
}

/// A validated fx entry, ready to run.
#[derive(Debug)]
pub struct FxPlan {
    pub destination: String,
    pub name: String,
    pub inputs: Vec<String>,
    pub min_inputs: usize,
    pub window: WindowSpec,
    pub clamp: Clamp,
    analysis: Box<dyn Analysis>,
}

impl FxPlan {
    fn new(destination: &DatasetRole, entry: &FxEntry, sources: &[DatasetRole]) -> Result<Self> {
        let builder = lookup(&entry.fx).ok_or_else(|| {
            HatError::config(format!(
                "unknown fx `{}` for destination `{}`",
                entry.fx, destination.name
            ))
        })?;

        if entry.inputs.is_empty() {
            return Err(HatError::config(format!(
                "fx of destination `{}` has no inputs",
                destination.name
            )));
        }
        let inputs = entry
            .inputs
            .iter()
            .map(|name| {
                sources.iter().find(|role| &role.name == name).ok_or_else(|| {
                    HatError::config(format!(
                        "fx of destination `{}` reads unknown source `{}`",
                        destination.name, name
                    ))
                })
            })
            .collect::<Result<Vec<&DatasetRole>>>()?;

        let min_inputs = entry.min_inputs.unwrap_or(1);
        if min_inputs == 0 || min_inputs > inputs.len() {
            return Err(HatError::config(format!(
                "min_inputs of destination `{}` must be between 1 and {}",
                destination.name,
                inputs.len()
            )));
        }

        let params = FxParams::new(&destination.name, bind(&entry.parameters, inputs[0])?);
        let analysis = builder(&params)?;
        check_scopes(destination, &inputs, analysis.input())?;

        Ok(FxPlan {
            destination: destination.name.clone(),
            name: entry.fx.clone(),
            inputs: entry.inputs.clone(),
            min_inputs,
            window: WindowSpec::from_params(&params)?,
            clamp: Clamp::from_params(&params)?,
            analysis,
        })
    }

    pub fn input(&self) -> InputKind {
        self.analysis.input()
    }

    pub fn needs_gev(&self) -> bool {
        self.analysis.needs_gev()
    }

    pub fn range(&self, window: &TimeWindow) -> Range<usize> {
        self.analysis.range(window, &self.window)
    }

    /// Runs the analysis over `slots`, indexed `[slot][input]`.
    ///
    /// For [`InputKind::Steps`] a slot is one step of [`FxPlan::range`], for
    /// [`InputKind::Members`] one ensemble member. The first input with data
    /// fills a slot. Returns `None` when too few inputs have data.
    pub fn run(
        &self,
        window: &TimeWindow,
        slots: &[Vec<Option<&Field>>],
        gev: Option<&GevGrids>,
        origin: &Path,
    ) -> Result<Option<Product>> {
        let range = self.range(window);

        let with_data = (0..self.inputs.len())
            .filter(|i| slots.iter().any(|slot| slot.get(*i).map_or(false, Option::is_some)))
            .count();
        if with_data < self.min_inputs {
            return Ok(None);
        }

        let mut stack = Stack {
            fields: Vec::new(),
            steps: Vec::new(),
            times: Vec::new(),
            idx_reference: window.idx_reference(),
            gev,
            origin,
        };
        for (i, slot) in slots.iter().enumerate() {
            let Some(field) = slot.iter().flatten().next().copied() else {
                continue;
            };
            let step = match self.input() {
                InputKind::Steps => range.start + i,
                InputKind::Members => window.idx_reference(),
            };
            stack.fields.push(field);
            stack.steps.push(step);
            stack.times.push(window.steps()[step]);
        }
        if stack.fields.is_empty() {
            return Ok(None);
        }
        stack.check_shapes()?;

        let mut product = self.analysis.apply(&stack)?;
        self.clamp.apply(&mut product.field.values);

        let steps = window.steps();
        let time_from = steps[range.start];
        let time_to = steps[range.end - 1];
        let side = match self.input() {
            InputKind::Steps => self.window.side,
            InputKind::Members => WindowSide::Left,
        };
        Ok(Some(
            product
                .with_attr("fx", &self.name)
                .with_attr("time_from", time_from.format(ATTR_TIME_FORMAT))
                .with_attr("time_to", time_to.format(ATTR_TIME_FORMAT))
                .with_attr("time_window", range.len())
                .with_attr("time_direction", side),
        ))
    }
}

/// Resolves `@name` parameters against the attributes of `source`.
fn bind(parameters: &BTreeMap<String, Value>, source: &DatasetRole) -> Result<BTreeMap<String, Value>> {
    parameters
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) if s.starts_with('@') => {
                let attr = &s[1..];
                source
                    .attributes
                    .get(attr)
                    .cloned()
                    .map(|bound| (key.clone(), bound))
                    .ok_or_else(|| {
                        HatError::config(format!(
                            "parameter `{}` is bound to `{}` but source `{}` has no such attribute",
                            key, attr, source.name
                        ))
                    })
            }
            _ => Ok((key.clone(), value.clone())),
        })
        .collect()
}

fn check_scopes(destination: &DatasetRole, inputs: &[&DatasetRole], kind: InputKind) -> Result<()> {
    let mismatch = |input: &DatasetRole, expected: EntityScope| {
        HatError::config(format!(
            "destination `{}` reads `{}` which is {}-scoped, expected {}-scoped",
            destination.name, input.name, input.entity, expected
        ))
    };

    for input in inputs {
        match kind {
            InputKind::Steps if input.entity != destination.entity => {
                return Err(mismatch(input, destination.entity));
            }
            InputKind::Members if input.entity != EntityScope::Ensemble => {
                return Err(mismatch(input, EntityScope::Ensemble));
            }
            _ => {}
        }
    }
    if kind == InputKind::Members && destination.entity != EntityScope::Domain {
        return Err(HatError::config(format!(
            "ensemble destination `{}` must be domain-scoped",
            destination.name
        )));
    }

    Ok(())
}

/// Per-cell fold over the stack skipping NaN; cells never seen stay NaN.
pub(crate) fn fold_nan<F>(stack: &Stack, mut fold: F) -> (Array2<f64>, Array2<usize>)
where
    F: FnMut(f64, f64) -> f64,
{
    let mut acc = Array2::from_elem(stack.shape(), f64::NAN);
    let mut counts = Array2::zeros(stack.shape());

    for field in &stack.fields {
        ndarray::Zip::from(&mut acc)
            .and(&mut counts)
            .and(&field.values)
            .for_each(|a, n, &v| {
                if v.is_nan() {
                    return;
                }
                *a = if *n == 0 { v } else { fold(*a, v) };
                *n += 1;
            });
    }

    (acc, counts)
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test {
    use chrono::NaiveDate;
    use ndarray::array;
    use serde_json::json;

    use super::*;
    use crate::{
        collection::{RoleGroup, SubPathRef},
        reading::Format,
        time_window::Frequency,
    };

    pub fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 10, 1)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    pub fn role(name: &str, group: RoleGroup, entity: EntityScope) -> DatasetRole {
        DatasetRole {
            name: name.to_string(),
            group,
            folder: "/data".to_string(),
            filename: format!("{}.json", name),
            variable: None,
            format: Format::Json,
            compression: false,
            scale_factor: 1.0,
            sub_path_ref: SubPathRef::SubPathTime,
            entity,
            attributes: BTreeMap::new(),
        }
    }

    pub fn plan_for(fx: &str, parameters: Value) -> FxPlan {
        let sources = vec![role("discharge", RoleGroup::Source, EntityScope::Domain)];
        let destinations = vec![role("product", RoleGroup::Destination, EntityScope::Domain)];
        let table: FxTable = serde_json::from_value(json!({
            "product": { "fx": fx, "inputs": ["discharge"], "parameters": parameters }
        }))
        .unwrap();

        table.plan(&sources, &destinations).unwrap().remove(0)
    }

    fn window() -> TimeWindow {
        TimeWindow::build(at(11), 2, 1, Frequency::Hourly).unwrap()
    }

    #[test]
    fn should_reject_unknown_fx() {
        let sources = vec![role("discharge", RoleGroup::Source, EntityScope::Domain)];
        let destinations = vec![role("product", RoleGroup::Destination, EntityScope::Domain)];
        let table: FxTable = serde_json::from_value(json!({
            "product": { "fx": "median_filter", "inputs": ["discharge"] }
        }))
        .unwrap();

        let err = table.plan(&sources, &destinations).unwrap_err();
        assert!(err.to_string().contains("unknown fx `median_filter`"));
    }

    #[test]
    fn should_require_entry_per_destination() {
        let sources = vec![role("discharge", RoleGroup::Source, EntityScope::Domain)];
        let destinations = vec![role("product", RoleGroup::Destination, EntityScope::Domain)];

        assert!(FxTable::default().plan(&sources, &destinations).is_err());
    }

    #[test]
    fn should_reject_unknown_input() {
        let sources = vec![role("discharge", RoleGroup::Source, EntityScope::Domain)];
        let destinations = vec![role("product", RoleGroup::Destination, EntityScope::Domain)];
        let table: FxTable = serde_json::from_value(json!({
            "product": { "fx": "maximum", "inputs": ["rain"] }
        }))
        .unwrap();

        assert!(table.plan(&sources, &destinations).is_err());
    }

    #[test]
    fn should_reject_scope_mismatch() {
        let sources = vec![role("discharge", RoleGroup::Source, EntityScope::Section)];
        let destinations = vec![role("product", RoleGroup::Destination, EntityScope::Domain)];
        let table: FxTable = serde_json::from_value(json!({
            "product": { "fx": "maximum", "inputs": ["discharge"] }
        }))
        .unwrap();

        assert!(table.plan(&sources, &destinations).is_err());
    }

    #[test]
    fn should_bind_parameters_to_source_attributes() {
        let mut source = role("discharge", RoleGroup::Source, EntityScope::Domain);
        source.attributes.insert("window".to_string(), json!(2));
        let destinations = vec![role("product", RoleGroup::Destination, EntityScope::Domain)];
        let table: FxTable = serde_json::from_value(json!({
            "product": { "fx": "maximum", "inputs": ["discharge"],
                         "parameters": { "time_window": "@window" } }
        }))
        .unwrap();

        let plan = table.plan(&[source], &destinations).unwrap().remove(0);
        assert_eq!(plan.window.size, Some(2));

        let unbound: FxTable = serde_json::from_value(json!({
            "product": { "fx": "maximum", "inputs": ["discharge"],
                         "parameters": { "time_window": "@missing" } }
        }))
        .unwrap();
        let sources = vec![role("discharge", RoleGroup::Source, EntityScope::Domain)];
        assert!(unbound.plan(&sources, &destinations).is_err());
    }

    #[test]
    fn should_reject_malformed_parameter() {
        let sources = vec![role("discharge", RoleGroup::Source, EntityScope::Domain)];
        let destinations = vec![role("product", RoleGroup::Destination, EntityScope::Domain)];
        let table: FxTable = serde_json::from_value(json!({
            "product": { "fx": "maximum", "inputs": ["discharge"],
                         "parameters": { "time_direction": "sideways" } }
        }))
        .unwrap();

        assert!(table.plan(&sources, &destinations).is_err());
    }

    #[test]
    fn should_attach_window_attributes() {
        let plan = plan_for("maximum", json!({ "time_window": 2 }));
        let a = Field::new(array![[1.0]]);
        let b = Field::new(array![[3.0]]);
        let slots = vec![vec![Some(&a)], vec![Some(&b)]];

        let product = plan
            .run(&window(), &slots, None, Path::new("out.json"))
            .unwrap()
            .unwrap();

        assert_eq!(product.field.values, array![[3.0]]);
        assert_eq!(product.attrs["fx"], "maximum");
        assert_eq!(product.attrs["time_from"], "2024-10-01 10:00");
        assert_eq!(product.attrs["time_to"], "2024-10-01 11:00");
        assert_eq!(product.attrs["time_window"], "2");
        assert_eq!(product.attrs["time_direction"], "left");
    }

    #[test]
    fn should_clamp_values_and_keep_nan() {
        let plan = plan_for("snapshot", json!({ "value_min": 0.0, "value_max": 10.0 }));
        let field = Field::new(array![[-2.0, 5.0, 12.0, f64::NAN]]);
        let slots = vec![vec![Some(&field)]];

        let product = plan
            .run(&window(), &slots, None, Path::new("out.json"))
            .unwrap()
            .unwrap();

        let values = product.field.values;
        assert_eq!(values[[0, 0]], 0.0);
        assert_eq!(values[[0, 1]], 5.0);
        assert_eq!(values[[0, 2]], 10.0);
        assert!(values[[0, 3]].is_nan());
    }

    #[test]
    fn should_prefer_first_input_with_data() {
        let sources = vec![
            role("observed", RoleGroup::Source, EntityScope::Domain),
            role("simulated", RoleGroup::Source, EntityScope::Domain),
        ];
        let destinations = vec![role("product", RoleGroup::Destination, EntityScope::Domain)];
        let table: FxTable = serde_json::from_value(json!({
            "product": { "fx": "series", "inputs": ["observed", "simulated"],
                         "parameters": { "time_window": 2 } }
        }))
        .unwrap();
        let plan = table.plan(&sources, &destinations).unwrap().remove(0);

        let obs = Field::new(array![[1.0]]);
        let sim_a = Field::new(array![[7.0]]);
        let sim_b = Field::new(array![[8.0]]);
        let slots = vec![vec![None, Some(&sim_a)], vec![Some(&obs), Some(&sim_b)]];

        let product = plan
            .run(&window(), &slots, None, Path::new("out.csv"))
            .unwrap()
            .unwrap();

        assert_eq!(product.field.values, array![[7.0], [1.0]]);
    }

    #[test]
    fn should_skip_when_too_few_inputs_have_data() {
        let sources = vec![
            role("observed", RoleGroup::Source, EntityScope::Domain),
            role("simulated", RoleGroup::Source, EntityScope::Domain),
        ];
        let destinations = vec![role("product", RoleGroup::Destination, EntityScope::Domain)];
        let table: FxTable = serde_json::from_value(json!({
            "product": { "fx": "maximum", "inputs": ["observed", "simulated"], "min_inputs": 2 }
        }))
        .unwrap();
        let plan = table.plan(&sources, &destinations).unwrap().remove(0);

        let obs = Field::new(array![[1.0]]);
        let slots = vec![vec![Some(&obs), None], vec![None, None], vec![None, None]];

        assert!(plan
            .run(&window(), &slots, None, Path::new("out.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn should_fail_on_shape_mismatch() {
        let plan = plan_for("maximum", json!({}));
        let a = Field::new(array![[1.0, 2.0]]);
        let b = Field::new(array![[1.0]]);
        let slots = vec![vec![Some(&a)], vec![Some(&b)], vec![None]];

        let err = plan
            .run(&window(), &slots, None, Path::new("out.json"))
            .unwrap_err();
        assert!(matches!(err, HatError::Format { .. }));
    }
}
