//! Settings file of a run.
//!
//! One JSON document holds the cleaning flags, the template tags, the time
//! window, the static and dynamic datasets and the fx table. Everything is
//! checked by [`Settings::validate`] right after loading so that a settings
//! mismatch stops the run before any data is read.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use chrono::{Local, NaiveDateTime};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    analysis::{FxPlan, FxTable},
    collection::{expand_home, DatasetRole, EntitySet, RoleGroup, SubPathRef},
    entity::{
        enumerate_ensembles, enumerate_sections, EntityScope, SectionColumns, SectionTable,
        TAG_DOMAIN, TAG_ENSEMBLE, TAG_SECTION, TAG_SECTION_DOMAIN,
    },
    error::{HatError, Result},
    reading::Format,
    template::TagRegistry,
    time_window::{round_down, Direction, Frequency, TimeWindow, MAX_WINDOW_STEPS},
};

const TIME_FORMATS: [&str; 4] = ["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S", "%Y%m%d%H%M", "%Y-%m-%dT%H:%M:%S"];

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub flags: Flags,
    #[serde(default)]
    pub template: TemplateSettings,
    #[serde(default)]
    pub time: TimeSettings,
    pub data: DataSettings,
    #[serde(default)]
    pub fx: FxSettings,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct Flags {
    pub cleaning_ancillary: bool,
    pub cleaning_destination: bool,
    pub cleaning_tmp: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TemplateSettings {
    /// Datetime tag → strftime pattern.
    pub datetime: BTreeMap<String, String>,
    /// Plain text tags.
    pub string: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeSettings {
    pub time_now: Option<String>,
    pub time_frequency: String,
    pub time_rounding: Option<String>,
    pub time_window_left: i64,
    pub time_window_right: i64,
    pub time_direction: Direction,
}

impl Default for TimeSettings {
    fn default() -> Self {
        TimeSettings {
            time_now: None,
            time_frequency: "H".to_string(),
            time_rounding: None,
            time_window_left: 1,
            time_window_right: 0,
            time_direction: Direction::Forward,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataSettings {
    #[serde(rename = "static")]
    pub static_data: StaticSettings,
    #[serde(default)]
    pub dynamic: DynamicSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticSettings {
    pub domains: Vec<String>,
    #[serde(default)]
    pub sections: Option<SectionSettings>,
    #[serde(default)]
    pub ensemble: Option<EnsembleSettings>,
    #[serde(default)]
    pub gev: Option<GevSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SectionSettings {
    pub file: String,
    #[serde(default)]
    pub columns: SectionColumns,
    #[serde(default)]
    pub type_filter: Option<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnsembleSettings {
    pub n_min: u32,
    pub n_max: u32,
    #[serde(default = "default_ensemble_format")]
    pub format: String,
}

/// Templates of the per-domain GEV parameter grids (ascii grids).
#[derive(Debug, Clone, Deserialize)]
pub struct GevSettings {
    pub shape: String,
    pub scale: String,
    pub location: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DynamicSettings {
    pub source: BTreeMap<String, RoleSettings>,
    pub ancillary: BTreeMap<String, RoleSettings>,
    pub destination: BTreeMap<String, RoleSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleSettings {
    pub folder: String,
    pub filename: String,
    #[serde(default)]
    pub variable: Option<String>,
    #[serde(default = "default_format")]
    pub format: Format,
    #[serde(default)]
    pub compression: bool,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    #[serde(default)]
    pub sub_path_ref: SubPathRef,
    #[serde(default)]
    pub entity: EntityScope,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

/// The fx table inline, or the path of a JSON file holding it.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FxSettings {
    File(String),
    Table(FxTable),
}

impl Default for FxSettings {
    fn default() -> Self {
        FxSettings::Table(FxTable::default())
    }
}

fn default_delimiter() -> char { ',' }
fn default_ensemble_format() -> String { "{:03d}".into() }
fn default_format() -> Format { Format::Json }
fn default_scale_factor() -> f64 { 1.0 }

/// Parses a time given on the command line or in the settings.
pub fn parse_time(s: &str) -> Result<NaiveDateTime> {
    TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s.trim(), format).ok())
        .ok_or_else(|| {
            HatError::config(format!("`{}` is not a time (expected YYYY-MM-DD HH:MM)", s))
        })
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Settings> {
        if !path.is_file() {
            return Err(HatError::config(format!(
                "settings file {} not found",
                path.display()
            )));
        }
        let text = fs::read_to_string(path)?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

        Settings::from_json(&text, base_dir)
            .map_err(|e| HatError::config(format!("settings file {}: {}", path.display(), e)))
    }

    pub fn from_json(text: &str, base_dir: PathBuf) -> Result<Settings> {
        let mut settings: Settings =
            serde_json::from_str(text).map_err(|e| HatError::config(e.to_string()))?;
        settings.base_dir = base_dir;
        settings.validate()?;
        Ok(settings)
    }

    /// Resolves a configured path: `~` expanded, relative to the settings file.
    pub fn path(&self, raw: &str) -> PathBuf {
        let path = expand_home(raw);
        if path.is_relative() {
            self.base_dir.join(path)
        } else {
            path
        }
    }

    /// Recognized tags: the configured ones plus the entity tags.
    pub fn registry(&self) -> Result<TagRegistry> {
        let mut registry = TagRegistry::new()
            .with_text(TAG_DOMAIN)
            .with_text(TAG_SECTION_DOMAIN)
            .with_text(TAG_SECTION)
            .with_text(TAG_ENSEMBLE);
        for (tag, pattern) in &self.template.datetime {
            registry = registry.with_datetime(tag, pattern)?;
        }
        for tag in &self.template.string {
            registry = registry.with_text(tag);
        }
        Ok(registry)
    }

    pub fn frequency(&self) -> Result<Frequency> {
        Frequency::from_code(&self.time.time_frequency)
    }

    pub fn rounding(&self) -> Result<Frequency> {
        match &self.time.time_rounding {
            Some(code) => Frequency::from_code(code),
            None => self.frequency(),
        }
    }

    /// Reference time of the run: the given one, else `time_now`, else the
    /// local clock, rounded down.
    pub fn reference_time(&self, given: Option<&str>) -> Result<NaiveDateTime> {
        let time = match given.or(self.time.time_now.as_deref()) {
            Some(s) => parse_time(s)?,
            None => Local::now().naive_local(),
        };
        round_down(time, self.rounding()?)
    }

    pub fn window(&self, reference: NaiveDateTime) -> Result<TimeWindow> {
        TimeWindow::build(
            reference,
            self.time.time_window_left,
            self.time.time_window_right,
            self.frequency()?,
        )
    }

    pub fn roles(&self, group: RoleGroup) -> Vec<DatasetRole> {
        let map = match group {
            RoleGroup::Source => &self.data.dynamic.source,
            RoleGroup::Ancillary => &self.data.dynamic.ancillary,
            RoleGroup::Destination => &self.data.dynamic.destination,
        };
        map.iter()
            .map(|(name, settings)| DatasetRole::from_settings(name, group, settings))
            .collect()
    }

    pub fn fx_table(&self) -> Result<FxTable> {
        match &self.fx {
            FxSettings::Table(table) => Ok(table.clone()),
            FxSettings::File(raw) => {
                let path = self.path(raw);
                let text = fs::read_to_string(&path).map_err(|e| {
                    HatError::config(format!("fx table {}: {}", path.display(), e))
                })?;
                serde_json::from_str(&text)
                    .map_err(|e| HatError::config(format!("fx table {}: {}", path.display(), e)))
            }
        }
    }

    pub fn fx_plans(&self) -> Result<Vec<FxPlan>> {
        self.fx_table()?.plan(
            &self.roles(RoleGroup::Source),
            &self.roles(RoleGroup::Destination),
        )
    }

    pub fn section_table(&self) -> Result<Option<SectionTable>> {
        let Some(sections) = &self.data.static_data.sections else {
            return Ok(None);
        };
        let delimiter = u8::try_from(sections.delimiter).map_err(|_| {
            HatError::config(format!("delimiter `{}` is not ascii", sections.delimiter))
        })?;
        SectionTable::from_csv(&self.path(&sections.file), &sections.columns, delimiter).map(Some)
    }

    /// Entities of `domain` from the static data loaded once per run.
    pub fn entity_set(&self, domain: &str, sections: Option<&SectionTable>) -> Result<EntitySet> {
        let mut set = EntitySet::new(domain);
        if let (Some(table), Some(config)) = (sections, &self.data.static_data.sections) {
            set = set.with_sections(enumerate_sections(
                table,
                domain,
                config.type_filter.as_deref(),
            ));
        }
        if let Some(ensemble) = &self.data.static_data.ensemble {
            set = set.with_ensembles(enumerate_ensembles(
                ensemble.n_min,
                ensemble.n_max,
                &ensemble.format,
            )?);
        }
        Ok(set)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data.static_data.domains.is_empty() {
            return Err(HatError::config("data.static.domains is empty"));
        }
        self.frequency()?;
        self.rounding()?;
        for (name, steps) in [
            ("time_window_left", self.time.time_window_left),
            ("time_window_right", self.time.time_window_right),
        ] {
            if steps > MAX_WINDOW_STEPS {
                return Err(HatError::config(format!(
                    "{} is {} but at most {} steps are allowed",
                    name, steps, MAX_WINDOW_STEPS
                )));
            }
        }
        if let Some(time_now) = &self.time.time_now {
            parse_time(time_now)?;
        }
        let registry = self.registry()?;

        let sources = self.roles(RoleGroup::Source);
        let ancillaries = self.roles(RoleGroup::Ancillary);
        let destinations = self.roles(RoleGroup::Destination);
        if sources.is_empty() || destinations.is_empty() {
            return Err(HatError::config(
                "data.dynamic needs at least one source and one destination",
            ));
        }

        for source in &sources {
            if !source.format.is_readable() {
                return Err(HatError::config(format!(
                    "source `{}` can't be read as {}",
                    source.name, source.format
                )));
            }
            let ancillary = ancillaries
                .iter()
                .find(|role| role.name == source.name)
                .ok_or_else(|| {
                    HatError::config(format!("source `{}` has no ancillary role", source.name))
                })?;
            if ancillary.entity != source.entity {
                return Err(HatError::config(format!(
                    "ancillary `{}` is {}-scoped but its source is {}-scoped",
                    ancillary.name, ancillary.entity, source.entity
                )));
            }
        }
        for ancillary in &ancillaries {
            if ancillary.format != Format::Json {
                return Err(HatError::config(format!(
                    "ancillary `{}` must be stored as json",
                    ancillary.name
                )));
            }
        }

        for role in sources.iter().chain(&ancillaries).chain(&destinations) {
            role.validate(&registry)?;
            let configured = match role.entity {
                EntityScope::Domain => true,
                EntityScope::Section => self.data.static_data.sections.is_some(),
                EntityScope::Ensemble => self.data.static_data.ensemble.is_some(),
            };
            if !configured {
                return Err(HatError::config(format!(
                    "{} role `{}` is {}-scoped but data.static has no {} list",
                    role.group, role.name, role.entity, role.entity
                )));
            }
        }

        if let Some(ensemble) = &self.data.static_data.ensemble {
            enumerate_ensembles(ensemble.n_min, ensemble.n_max, &ensemble.format)?;
        }
        if let Some(sections) = &self.data.static_data.sections {
            if !sections.delimiter.is_ascii() {
                return Err(HatError::config(format!(
                    "delimiter `{}` is not ascii",
                    sections.delimiter
                )));
            }
        }

        let plans = self.fx_plans()?;
        if self.data.static_data.gev.is_none() {
            if let Some(plan) = plans.iter().find(|plan| plan.needs_gev()) {
                return Err(HatError::config(format!(
                    "fx `{}` of destination `{}` needs data.static.gev or scalar gev_* parameters",
                    plan.name, plan.destination
                )));
            }
        }
        Ok(())
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test {
    use chrono::NaiveDate;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    pub fn settings_json(root: &Path) -> Value {
        json!({
            "flags": { "cleaning_ancillary": false, "cleaning_destination": false, "cleaning_tmp": false },
            "template": {
                "datetime": {
                    "source_datetime": "%Y%m%d%H%M",
                    "source_sub_path_time": "%Y/%m/%d/",
                    "ancillary_datetime": "%Y%m%d%H%M",
                    "ancillary_sub_path_time": "%Y/%m/%d/",
                    "destination_datetime": "%Y%m%d%H%M",
                    "destination_sub_path_time": "%Y/%m/%d/"
                },
                "string": []
            },
            "time": {
                "time_now": "2024-10-01 11:23",
                "time_frequency": "H",
                "time_rounding": "H",
                "time_window_left": 3,
                "time_window_right": 0
            },
            "data": {
                "static": { "domains": ["marche"] },
                "dynamic": {
                    "source": {
                        "discharge": {
                            "folder": format!("{}/source/{{source_sub_path_time}}", root.display()),
                            "filename": "q_{domain_name}_{source_datetime}.asc",
                            "format": "ascii"
                        }
                    },
                    "ancillary": {
                        "discharge": {
                            "folder": format!("{}/ancillary/{{ancillary_sub_path_time}}", root.display()),
                            "filename": "q_{domain_name}_{ancillary_datetime}.json",
                            "sub_path_ref": "sub_path_run"
                        }
                    },
                    "destination": {
                        "discharge_max": {
                            "folder": format!("{}/destination/{{destination_sub_path_time}}", root.display()),
                            "filename": "q_max_{domain_name}_{destination_datetime}.asc",
                            "format": "ascii"
                        }
                    }
                }
            },
            "fx": { "discharge_max": { "fx": "maximum", "inputs": ["discharge"] } }
        })
    }

    fn load(value: &Value) -> Result<Settings> {
        Settings::from_json(&value.to_string(), PathBuf::from("/etc/hat"))
    }

    #[test]
    fn should_load_and_round_reference_time() {
        let dir = TempDir::new().unwrap();
        let settings = load(&settings_json(dir.path())).unwrap();

        let expected = NaiveDate::from_ymd_opt(2024, 10, 1)
            .unwrap()
            .and_hms_opt(11, 0, 0)
            .unwrap();
        assert_eq!(settings.reference_time(None).unwrap(), expected);
        assert_eq!(
            settings.reference_time(Some("2024-10-02 08:59")).unwrap(),
            expected + chrono::TimeDelta::hours(21)
        );
        assert_eq!(settings.window(expected).unwrap().len(), 3);
    }

    #[test]
    fn should_build_roles_with_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = load(&settings_json(dir.path())).unwrap();

        let ancillary = settings.roles(RoleGroup::Ancillary).remove(0);
        assert_eq!(ancillary.format, Format::Json);
        assert_eq!(ancillary.sub_path_ref, SubPathRef::SubPathRun);
        assert_eq!(ancillary.scale_factor, 1.0);
        assert_eq!(ancillary.entity, EntityScope::Domain);
    }

    #[test]
    fn should_require_ancillary_per_source() {
        let dir = TempDir::new().unwrap();
        let mut value = settings_json(dir.path());
        value["data"]["dynamic"]["ancillary"] = json!({});

        let err = load(&value).unwrap_err();
        assert!(err.to_string().contains("no ancillary role"));
    }

    #[test]
    fn should_reject_unknown_frequency() {
        let dir = TempDir::new().unwrap();
        let mut value = settings_json(dir.path());
        value["time"]["time_frequency"] = json!("M");

        assert!(matches!(load(&value), Err(HatError::Configuration(_))));
    }

    #[test]
    fn should_reject_unsupported_format() {
        let dir = TempDir::new().unwrap();
        let mut value = settings_json(dir.path());
        value["data"]["dynamic"]["source"]["discharge"]["format"] = json!("netcdf");

        let err = load(&value).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn should_reject_section_role_without_sections() {
        let dir = TempDir::new().unwrap();
        let mut value = settings_json(dir.path());
        value["data"]["dynamic"]["destination"]["discharge_max"]["entity"] = json!("section");
        value["data"]["dynamic"]["destination"]["discharge_max"]["filename"] =
            json!("{section_name}.csv");

        assert!(load(&value).is_err());
    }

    #[test]
    fn should_require_gev_for_return_period() {
        let dir = TempDir::new().unwrap();
        let mut value = settings_json(dir.path());
        value["fx"] = json!({ "discharge_max": { "fx": "return_period", "inputs": ["discharge"] } });

        let err = load(&value).unwrap_err();
        assert!(err.to_string().contains("data.static.gev"));

        value["fx"]["discharge_max"]["parameters"] =
            json!({ "gev_shape": 0.1, "gev_scale": 20.0, "gev_location": 50.0 });
        assert!(load(&value).is_ok());

        value["fx"]["discharge_max"]["parameters"] = json!({});
        value["data"]["static"]["gev"] =
            json!({ "shape": "gev/shape.asc", "scale": "gev/scale.asc", "location": "gev/location.asc" });
        assert!(load(&value).is_ok());
    }

    #[test]
    fn should_reject_oversized_window() {
        let dir = TempDir::new().unwrap();
        let mut value = settings_json(dir.path());
        value["time"]["time_window_left"] = json!(200_000_000);

        let err = load(&value).unwrap_err();
        assert!(err.to_string().contains("time_window_left"));
    }

    #[test]
    fn should_read_fx_table_from_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("fx.json"),
            json!({ "discharge_max": { "fx": "maximum", "inputs": ["discharge"] } }).to_string(),
        )
        .unwrap();
        let mut value = settings_json(dir.path());
        value["fx"] = json!("fx.json");
        let path = dir.path().join("settings.json");
        fs::write(&path, value.to_string()).unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.fx_plans().unwrap()[0].name, "maximum");
    }

    #[test]
    fn should_report_missing_settings_file() {
        let err = Settings::from_file(Path::new("/nonexistent/settings.json")).unwrap_err();
        assert!(matches!(err, HatError::Configuration(_)));
    }

    #[test]
    fn should_resolve_relative_paths_against_settings_dir() {
        let dir = TempDir::new().unwrap();
        let settings = load(&settings_json(dir.path())).unwrap();

        assert_eq!(settings.path("static/sections.csv"), PathBuf::from("/etc/hat/static/sections.csv"));
        assert_eq!(settings.path("/abs/x.csv"), PathBuf::from("/abs/x.csv"));
    }

    #[test]
    fn should_parse_supported_time_formats() {
        assert!(parse_time("2024-10-01 10:00").is_ok());
        assert!(parse_time("202410011000").is_ok());
        assert!(parse_time("yesterday").is_err());
    }
}
