//! The dynamic driver: for every domain, resolve the file collection,
//! organize the source data through the ancillary cache, analyze it and
//! dump the products.
//!
//! Domains, time steps and entities are processed one after the other in
//! a fixed order: time steps in the configured direction, entities in the
//! order the enumerator yields them.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use chrono::NaiveDateTime;
use indicatif::ProgressBar;
use log::{debug, info};
use serde_json::Value;

use crate::{
    analysis::{FxPlan, GevGrids, InputKind, Product, ATTR_TIME_FORMAT},
    cache::{get_or_compute, remove_if_exists, AncillaryEntry, CacheOutcome},
    collection::{resolve_all, DatasetRole, EntitySet, FileCollection, RoleGroup},
    dump::{dump_product, DumpOutcome},
    entity::{Entity, EntityScope, SectionTable},
    error::{HatError, Result},
    reading::{read_field, Field, Format},
    report::{Outcome, RunReport},
    settings::Settings,
    template::{extract, resolve, FillPolicy, TagRegistry, TemplateContext},
    time_window::TimeWindow,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Unresolved,
    PathResolved,
    CacheChecked,
    Loaded,
    Computed,
    Analyzed,
    AnalyzedSkipped,
    Dumped,
    Failed,
}

impl CellState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CellState::AnalyzedSkipped | CellState::Dumped | CellState::Failed
        )
    }

    pub fn can_become(self, next: CellState) -> bool {
        use CellState::*;

        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Unresolved, PathResolved)
                | (PathResolved, CacheChecked)
                | (CacheChecked, Loaded | Computed | AnalyzedSkipped)
                | (Loaded, Analyzed | AnalyzedSkipped | Dumped)
                | (Computed, Analyzed | AnalyzedSkipped)
                | (Analyzed, Dumped | AnalyzedSkipped)
        )
    }
}

/// One (role, time step, entity) combination.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CellKey {
    pub role: String,
    pub time: NaiveDateTime,
    pub entity: String,
}

impl CellKey {
    pub fn new(role: &str, time: NaiveDateTime, entity: &str) -> Self {
        CellKey {
            role: role.to_string(),
            time,
            entity: entity.to_string(),
        }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.role,
            self.time.format(ATTR_TIME_FORMAT),
            self.entity
        )
    }
}

#[derive(Debug, Default)]
pub struct Cells {
    states: BTreeMap<CellKey, CellState>,
}

impl Cells {
    pub fn state(&self, key: &CellKey) -> CellState {
        self.states
            .get(key)
            .copied()
            .unwrap_or(CellState::Unresolved)
    }

    pub fn advance(&mut self, key: &CellKey, next: CellState) -> Result<()> {
        let current = self.state(key);
        if !current.can_become(next) {
            return Err(HatError::config(format!(
                "cell {} can't go from {:?} to {:?}",
                key, current, next
            )));
        }
        self.states.insert(key.clone(), next);
        Ok(())
    }

    pub fn count(&self, state: CellState) -> usize {
        self.states.values().filter(|s| **s == state).count()
    }
}

type DataKey = (String, NaiveDateTime, String);

/// Everything one domain's run holds between phases.
#[derive(Debug)]
pub struct DomainRun {
    pub domain: String,
    pub entities: EntitySet,
    pub collection: FileCollection,
    pub cells: Cells,
    /// Organized source fields by (source role, time step, entity).
    data: BTreeMap<DataKey, Field>,
    gev: Option<GevGrids>,
}

/// An analyzed product waiting to be dumped.
#[derive(Debug)]
pub struct Pending {
    pub destination: String,
    pub entity: String,
    pub path: PathBuf,
    pub product: Product,
}

#[derive(Debug, Default)]
struct Tally {
    steps: usize,
    loaded: usize,
    computed: usize,
    missing: usize,
    failure: Option<String>,
}

impl Tally {
    fn outcome(&self) -> (Outcome, Option<String>) {
        if let Some(failure) = &self.failure {
            return (Outcome::Failed, Some(failure.clone()));
        }
        let detail = (self.missing > 0)
            .then(|| format!("{} of {} steps missing", self.missing, self.steps));
        let outcome = if self.loaded + self.computed == 0 {
            Outcome::Skipped
        } else if self.computed > 0 {
            Outcome::Done
        } else {
            Outcome::Loaded
        };
        (outcome, detail)
    }
}

pub struct DriverDynamic {
    settings: Settings,
    registry: TagRegistry,
    window: TimeWindow,
    roles: Vec<DatasetRole>,
    plans: Vec<FxPlan>,
    sections: Option<SectionTable>,
}

impl DriverDynamic {
    /// Builds the tag registry, the time window and the fx plans, and loads
    /// the static data shared by every domain.
    pub fn new(settings: Settings, reference: NaiveDateTime) -> Result<Self> {
        let registry = settings.registry()?;
        let window = settings.window(reference)?;
        let roles = [RoleGroup::Source, RoleGroup::Ancillary, RoleGroup::Destination]
            .into_iter()
            .flat_map(|group| settings.roles(group))
            .collect();
        let plans = settings.fx_plans()?;
        let sections = settings.section_table()?;

        if let (Some(first), Some(last)) = (window.steps().first(), window.steps().last()) {
            info!(
                "reference time {}, window of {} steps from {} to {}",
                window.reference().format(ATTR_TIME_FORMAT),
                window.len(),
                first.format(ATTR_TIME_FORMAT),
                last.format(ATTR_TIME_FORMAT)
            );
        }

        Ok(DriverDynamic {
            settings,
            registry,
            window,
            roles,
            plans,
            sections,
        })
    }

    pub fn domains(&self) -> &[String] {
        &self.settings.data.static_data.domains
    }

    fn roles_of(&self, group: RoleGroup) -> impl Iterator<Item = &DatasetRole> {
        self.roles.iter().filter(move |role| role.group == group)
    }

    fn role(&self, group: RoleGroup, name: &str) -> Result<&DatasetRole> {
        self.roles_of(group)
            .find(|role| role.name == name)
            .ok_or_else(|| HatError::config(format!("no {} role `{}`", group, name)))
    }

    /// Entities and resolved paths of one domain.
    pub fn resolve(&self, domain: &str) -> Result<(EntitySet, FileCollection)> {
        let entities = self.settings.entity_set(domain, self.sections.as_ref())?;
        let collection = resolve_all(&self.roles, &self.registry, &self.window, &entities)?;
        Ok((entities, collection))
    }

    fn role_by_key(&self, key: &str) -> Result<&DatasetRole> {
        self.roles
            .iter()
            .find(|role| role.key() == key)
            .ok_or_else(|| HatError::config(format!("no role `{}`", key)))
    }

    /// Path template of a role with the reference time filled in and the
    /// entity tags left in place.
    pub fn pattern(&self, key: &str) -> Result<String> {
        let role = self.role_by_key(key)?;
        let context = TemplateContext::new().with_time(&self.registry, self.window.reference());
        let folder = resolve(&role.folder, &self.registry, &context, FillPolicy::Partial)?;
        let filename = resolve(&role.filename, &self.registry, &context, FillPolicy::Partial)?;

        Ok(Path::new(&folder).join(filename).display().to_string())
    }

    /// Tag values carried by the file name of a resolved path.
    pub fn filename_tags(&self, key: &str, path: &Path) -> Option<BTreeMap<String, String>> {
        let role = self.role_by_key(key).ok()?;
        let name = path.file_name()?.to_str()?;
        extract(&role.filename, &self.registry, name)
    }

    pub fn prepare(&self, domain: &str) -> Result<DomainRun> {
        let (entities, collection) = self.resolve(domain)?;

        let mut cells = Cells::default();
        for (role, time, entity, _) in collection.iter() {
            cells.advance(&CellKey::new(role, time, entity), CellState::PathResolved)?;
        }
        let gev = self.load_gev(&entities)?;

        Ok(DomainRun {
            domain: domain.to_string(),
            entities,
            collection,
            cells,
            data: BTreeMap::new(),
            gev,
        })
    }

    fn load_gev(&self, entities: &EntitySet) -> Result<Option<GevGrids>> {
        let Some(gev) = &self.settings.data.static_data.gev else {
            return Ok(None);
        };
        if !self.plans.iter().any(FxPlan::needs_gev) {
            return Ok(None);
        }

        let context = entities.domain.context();
        let read = |template: &str| -> Result<ndarray::Array2<f64>> {
            let resolved = resolve(template, &self.registry, &context, FillPolicy::Strict)?;
            let path = self.settings.path(&resolved);
            read_field(&path, Format::AsciiGrid, false, None)
                .map(|field| field.values)
                .map_err(|e| match e {
                    HatError::DataUnavailable(path) => HatError::config(format!(
                        "GEV grid {} not found",
                        path.display()
                    )),
                    e => e,
                })
        };

        let grids = GevGrids {
            shape: read(&gev.shape)?,
            scale: read(&gev.scale)?,
            location: read(&gev.location)?,
        };
        grids.check()?;
        Ok(Some(grids))
    }

    /// Fills the ancillary cache from the source files and keeps the
    /// fields for the analysis.
    pub fn organize(&self, run: &mut DomainRun, report: &mut RunReport) -> Result<()> {
        let steps = self.window.ordered(self.settings.time.time_direction);

        for source in self.roles_of(RoleGroup::Source) {
            let ancillary = self.role(RoleGroup::Ancillary, &source.name)?;
            let (source_key, ancillary_key) = (source.key(), ancillary.key());
            let entities = run.entities.for_scope(source.entity)?;
            let mut tallies: BTreeMap<String, Tally> = BTreeMap::new();

            for step in &steps {
                for entity in &entities {
                    let key = entity.key();
                    let (Some(source_path), Some(ancillary_path)) = (
                        run.collection.get(&source_key, *step, &key),
                        run.collection.get(&ancillary_key, *step, &key),
                    ) else {
                        return Err(HatError::config(format!(
                            "no path for {} {} at {}",
                            source.name, key, step
                        )));
                    };

                    let cell = CellKey::new(&ancillary_key, *step, &key);
                    run.cells.advance(&cell, CellState::CacheChecked)?;
                    let tally = tallies.entry(key.clone()).or_default();
                    tally.steps += 1;

                    let result = get_or_compute(
                        ancillary_path,
                        self.settings.flags.cleaning_ancillary,
                        || read_source(source, source_path, *step, &key),
                    )
                    .and_then(|(entry, outcome)| Ok((entry.into_field(ancillary_path)?.0, outcome)));

                    match result {
                        Ok((field, outcome)) => {
                            let state = match outcome {
                                CacheOutcome::Loaded => {
                                    tally.loaded += 1;
                                    CellState::Loaded
                                }
                                CacheOutcome::Computed => {
                                    tally.computed += 1;
                                    CellState::Computed
                                }
                            };
                            debug!("{} ... {:?}", cell, state);
                            run.cells.advance(&cell, state)?;
                            run.data.insert((source.name.clone(), *step, key), field);
                        }
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) if e.is_recoverable() => {
                            debug!("{} ... skipped: {}", cell, e);
                            tally.missing += 1;
                            run.cells.advance(&cell, CellState::AnalyzedSkipped)?;
                        }
                        Err(e) => {
                            tally.failure.get_or_insert_with(|| e.to_string());
                            run.cells.advance(&cell, CellState::Failed)?;
                        }
                    }
                }
            }

            for entity in &entities {
                let key = entity.key();
                if let Some(tally) = tallies.get(&key) {
                    let (outcome, detail) = tally.outcome();
                    report.record(&run.domain, &source_key, &key, outcome, detail);
                }
            }
        }

        Ok(())
    }

    /// Runs every fx plan for every entity of its destination.
    pub fn analyze(&self, run: &mut DomainRun, report: &mut RunReport) -> Result<Vec<Pending>> {
        let reference = self.window.reference();
        let mut pending = Vec::new();

        for plan in &self.plans {
            let destination = self.role(RoleGroup::Destination, &plan.destination)?;
            let destination_key = destination.key();

            for entity in run.entities.for_scope(destination.entity)? {
                let key = entity.key();
                let path = run
                    .collection
                    .get(&destination_key, reference, &key)
                    .map(Path::to_path_buf)
                    .ok_or_else(|| {
                        HatError::config(format!("no path for {} {}", destination.name, key))
                    })?;

                let cell = CellKey::new(&destination_key, reference, &key);
                run.cells.advance(&cell, CellState::CacheChecked)?;

                if !self.settings.flags.cleaning_destination && path.exists() {
                    run.cells.advance(&cell, CellState::Loaded)?;
                    run.cells.advance(&cell, CellState::Dumped)?;
                    report.record(&run.domain, &destination_key, &key, Outcome::Loaded, None);
                    continue;
                }
                run.cells.advance(&cell, CellState::Computed)?;

                let slots = slots(&run.data, &run.entities, plan, &self.window, &entity)?;
                match plan.run(&self.window, &slots, run.gev.as_ref(), &path) {
                    Ok(Some(product)) => {
                        run.cells.advance(&cell, CellState::Analyzed)?;
                        pending.push(Pending {
                            destination: destination.name.clone(),
                            entity: key,
                            path,
                            product,
                        });
                    }
                    Ok(None) => {
                        run.cells.advance(&cell, CellState::AnalyzedSkipped)?;
                        report.record(
                            &run.domain,
                            &destination_key,
                            &key,
                            Outcome::Skipped,
                            Some(format!("fewer than {} inputs with data", plan.min_inputs)),
                        );
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        let (state, outcome) = if e.is_recoverable() {
                            (CellState::AnalyzedSkipped, Outcome::Skipped)
                        } else {
                            (CellState::Failed, Outcome::Failed)
                        };
                        run.cells.advance(&cell, state)?;
                        report.record(&run.domain, &destination_key, &key, outcome, Some(e.to_string()));
                    }
                }
            }
        }

        Ok(pending)
    }

    pub fn dump(&self, run: &mut DomainRun, pending: Vec<Pending>, report: &mut RunReport) -> Result<()> {
        let reference = self.window.reference();

        for item in pending {
            let destination = self.role(RoleGroup::Destination, &item.destination)?;
            let destination_key = destination.key();
            let cell = CellKey::new(&destination_key, reference, &item.entity);

            let result = dump_product(
                &item.product,
                destination,
                &item.entity,
                &item.path,
                self.settings.flags.cleaning_destination,
            );
            let (state, outcome, detail) = match result {
                Ok(DumpOutcome::Written) => {
                    debug!("saved {}", item.path.display());
                    (CellState::Dumped, Outcome::Done, None)
                }
                Ok(DumpOutcome::Kept) => (CellState::Dumped, Outcome::Loaded, None),
                Ok(DumpOutcome::Empty) => (
                    CellState::AnalyzedSkipped,
                    Outcome::Skipped,
                    Some("all values undefined".to_string()),
                ),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) if e.is_recoverable() => {
                    (CellState::AnalyzedSkipped, Outcome::Skipped, Some(e.to_string()))
                }
                Err(e) => (CellState::Failed, Outcome::Failed, Some(e.to_string())),
            };
            run.cells.advance(&cell, state)?;
            report.record(&run.domain, &destination_key, &item.entity, outcome, detail);
        }

        Ok(())
    }

    /// Deletes this run's ancillary files when `cleaning_tmp` is set.
    pub fn clean_tmp(&self, run: &DomainRun) -> Result<usize> {
        if !self.settings.flags.cleaning_tmp {
            return Ok(0);
        }
        remove_group(&run.collection, RoleGroup::Ancillary)
    }

    pub fn run_domain(&self, domain: &str, report: &mut RunReport) -> Result<DomainRun> {
        info!("domain {} ... organize", domain);
        let mut run = self.prepare(domain)?;
        self.organize(&mut run, report)?;

        info!("domain {} ... analyze", domain);
        let pending = self.analyze(&mut run, report)?;
        self.dump(&mut run, pending, report)?;

        let removed = self.clean_tmp(&run)?;
        if removed > 0 {
            debug!("domain {} ... removed {} ancillary files", domain, removed);
        }

        Ok(run)
    }

    pub fn run(&self, report: &mut RunReport, progress: &ProgressBar) -> Result<()> {
        progress.set_length(self.domains().len() as u64);

        for domain in self.domains() {
            progress.set_message(format!("Processing {}", domain));
            self.run_domain(domain, report)?;
            progress.inc(1);
        }

        progress.finish_with_message(report.summary());
        Ok(())
    }

    /// Deletes the ancillary and destination files of this reference time.
    pub fn clean(&self) -> Result<usize> {
        let mut removed = 0;
        for domain in self.domains() {
            let (_, collection) = self.resolve(domain)?;
            removed += remove_group(&collection, RoleGroup::Ancillary)?;
            removed += remove_group(&collection, RoleGroup::Destination)?;
        }
        Ok(removed)
    }
}

fn remove_group(collection: &FileCollection, group: RoleGroup) -> Result<usize> {
    let prefix = format!("{}/", group);
    let mut removed = 0;
    for (role, _, _, path) in collection.iter() {
        if role.starts_with(&prefix) && remove_if_exists(path)? {
            removed += 1;
        }
    }
    Ok(removed)
}

fn read_source(
    source: &DatasetRole,
    path: &Path,
    step: NaiveDateTime,
    entity: &str,
) -> Result<AncillaryEntry> {
    let field = read_field(path, source.format, source.compression, source.variable.as_deref())?
        .scaled(source.scale_factor);

    let mut attrs = BTreeMap::new();
    for (key, value) in &source.attributes {
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        attrs.insert(key.clone(), value);
    }
    attrs.insert("source".to_string(), path.display().to_string());
    attrs.insert("time".to_string(), step.format(ATTR_TIME_FORMAT).to_string());
    attrs.insert("entity".to_string(), entity.to_string());

    Ok(field.to_record(attrs))
}

/// Inputs of `plan` for one destination entity, indexed `[slot][input]`.
fn slots<'a>(
    data: &'a BTreeMap<DataKey, Field>,
    entities: &EntitySet,
    plan: &FxPlan,
    window: &TimeWindow,
    entity: &Entity,
) -> Result<Vec<Vec<Option<&'a Field>>>> {
    let lookup = |time: NaiveDateTime, key: &str| -> Vec<Option<&'a Field>> {
        plan.inputs
            .iter()
            .map(|input| data.get(&(input.clone(), time, key.to_string())))
            .collect()
    };

    Ok(match plan.input() {
        InputKind::Steps => {
            let key = entity.key();
            plan.range(window)
                .map(|i| lookup(window.steps()[i], &key))
                .collect()
        }
        InputKind::Members => entities
            .for_scope(EntityScope::Ensemble)?
            .iter()
            .map(|member| lookup(window.reference(), &member.key()))
            .collect(),
    })
}

// -- Tests -------------------------------------------------------------------
