//! Resolution of dataset roles into concrete file paths, per time step and
//! per entity.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
};

use chrono::NaiveDateTime;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
    entity::{Entity, EntityScope},
    error::{HatError, Result},
    reading::Format,
    settings::RoleSettings,
    template::{resolve, tags_in, FillPolicy, TagRegistry, TemplateContext},
    time_window::TimeWindow,
};

/// Which time fills the datetime tags of the folder template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubPathRef {
    /// Folders are keyed by the run's reference time.
    SubPathRun,
    /// Folders are keyed by each processed time step.
    #[default]
    SubPathTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RoleGroup {
    Source,
    Ancillary,
    Destination,
}

impl fmt::Display for RoleGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleGroup::Source => write!(f, "source"),
            RoleGroup::Ancillary => write!(f, "ancillary"),
            RoleGroup::Destination => write!(f, "destination"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeScope {
    /// One file per step of the window.
    Window,
    /// One file at the reference time.
    Reference,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRole {
    pub name: String,
    pub group: RoleGroup,
    pub folder: String,
    pub filename: String,
    pub variable: Option<String>,
    pub format: Format,
    pub compression: bool,
    pub scale_factor: f64,
    pub sub_path_ref: SubPathRef,
    pub entity: EntityScope,
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl DatasetRole {
    pub fn from_settings(name: &str, group: RoleGroup, settings: &RoleSettings) -> Self {
        DatasetRole {
            name: name.to_string(),
            group,
            folder: settings.folder.clone(),
            filename: settings.filename.clone(),
            variable: settings.variable.clone(),
            format: settings.format,
            compression: settings.compression,
            scale_factor: settings.scale_factor,
            sub_path_ref: settings.sub_path_ref,
            entity: settings.entity,
            attributes: settings.attributes.clone(),
        }
    }

    /// Unique key across groups, e.g. `ancillary/discharge`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.group, self.name)
    }

    pub fn time_scope(&self) -> TimeScope {
        match self.group {
            RoleGroup::Destination => TimeScope::Reference,
            RoleGroup::Source | RoleGroup::Ancillary => TimeScope::Window,
        }
    }

    /// Checks the templates carry exactly the entity tags the scope implies.
    pub fn validate(&self, registry: &TagRegistry) -> Result<()> {
        let mut tags: BTreeSet<String> = tags_in(&self.folder, registry);
        tags.extend(tags_in(&self.filename, registry));

        for scope in [EntityScope::Section, EntityScope::Ensemble] {
            if let Some(tag) = scope.tag() {
                if tags.contains(tag) && self.entity != scope {
                    return Err(HatError::config(format!(
                        "{} role `{}` uses tag `{}` but is {}-scoped",
                        self.group, self.name, tag, self.entity
                    )));
                }
            }
        }
        if let Some(tag) = self.entity.tag() {
            if !tags.contains(tag) {
                return Err(HatError::config(format!(
                    "{} role `{}` is {}-scoped but its templates lack tag `{}`",
                    self.group, self.name, self.entity, tag
                )));
            }
        }
        if let Some(implied) = self.mismatched_extension() {
            warn!(
                "{} role `{}` is stored as {} but its file name ends in .{}",
                self.group, self.name, self.format, implied
            );
        }

        Ok(())
    }

    /// Format the file name extension implies, when it differs from the configured one.
    pub fn mismatched_extension(&self) -> Option<Format> {
        Format::from_file(Path::new(&self.filename)).filter(|implied| *implied != self.format)
    }

    /// Path of this role for one step and one entity context.
    pub fn resolve(
        &self,
        registry: &TagRegistry,
        step: NaiveDateTime,
        reference: NaiveDateTime,
        entity_context: &TemplateContext,
    ) -> Result<PathBuf> {
        let folder_time = match self.sub_path_ref {
            SubPathRef::SubPathRun => reference,
            SubPathRef::SubPathTime => step,
        };
        let folder_context = TemplateContext::new()
            .with_time(registry, folder_time)
            .merge(entity_context);
        let file_context = TemplateContext::new()
            .with_time(registry, step)
            .merge(entity_context);

        let folder = resolve(&self.folder, registry, &folder_context, FillPolicy::Strict)?;
        let filename = resolve(&self.filename, registry, &file_context, FillPolicy::Strict)?;

        Ok(expand_home(&folder).join(filename))
    }
}

/// Expands a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(path),
    };
    match dirs::home_dir() {
        Some(home) if rest.is_empty() => home,
        Some(home) => home.join(rest),
        None => PathBuf::from(path),
    }
}

/// Entities of one domain, as produced by the entity enumerator.
#[derive(Debug, Clone)]
pub struct EntitySet {
    pub domain: Entity,
    pub sections: Option<Vec<Entity>>,
    pub ensembles: Option<Vec<Entity>>,
}

impl EntitySet {
    pub fn new(domain: &str) -> Self {
        EntitySet {
            domain: Entity::Domain(domain.to_string()),
            sections: None,
            ensembles: None,
        }
    }

    pub fn with_sections(mut self, sections: Vec<Entity>) -> Self {
        self.sections = Some(sections);
        self
    }

    pub fn with_ensembles(mut self, ensembles: Vec<Entity>) -> Self {
        self.ensembles = Some(ensembles);
        self
    }

    /// Entities a role of `scope` is repeated over, in enumeration order.
    pub fn for_scope(&self, scope: EntityScope) -> Result<Vec<Entity>> {
        let list = match scope {
            EntityScope::Domain => return Ok(vec![self.domain.clone()]),
            EntityScope::Section => self.sections.as_ref(),
            EntityScope::Ensemble => self.ensembles.as_ref(),
        };
        list.cloned().ok_or_else(|| {
            HatError::config(format!(
                "a {}-scoped role needs a {} list but none is configured",
                scope, scope
            ))
        })
    }

    /// Domain tags merged with the entity's own tags.
    pub fn context(&self, entity: &Entity) -> TemplateContext {
        self.domain.context().merge(&entity.context())
    }
}

type StepPaths = BTreeMap<NaiveDateTime, BTreeMap<String, PathBuf>>;

/// Resolved paths: role key → time step → entity key → path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileCollection {
    paths: BTreeMap<String, StepPaths>,
}

impl FileCollection {
    pub fn get(&self, role: &str, time: NaiveDateTime, entity: &str) -> Option<&Path> {
        self.paths
            .get(role)?
            .get(&time)?
            .get(entity)
            .map(PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, NaiveDateTime, &str, &Path)> {
        self.paths.iter().flat_map(|(role, steps)| {
            steps.iter().flat_map(move |(time, entities)| {
                entities
                    .iter()
                    .map(move |(entity, path)| (role.as_str(), *time, entity.as_str(), path.as_path()))
            })
        })
    }
}

/// Resolves every role over its time steps and entities.
pub fn resolve_all(
    roles: &[DatasetRole],
    registry: &TagRegistry,
    window: &TimeWindow,
    entities: &EntitySet,
) -> Result<FileCollection> {
    let reference = window.reference();
    let mut paths = BTreeMap::new();

    for role in roles {
        role.validate(registry)?;
        let role_entities = entities.for_scope(role.entity)?;
        let steps: Vec<NaiveDateTime> = match role.time_scope() {
            TimeScope::Window => window.steps().to_vec(),
            TimeScope::Reference => vec![reference],
        };

        let mut role_paths = StepPaths::new();
        for step in steps {
            let mut step_paths = BTreeMap::new();
            for entity in &role_entities {
                let context = entities.context(entity);
                let path = role.resolve(registry, step, reference, &context)?;
                step_paths.insert(entity.key(), path);
            }
            role_paths.insert(step, step_paths);
        }
        paths.insert(role.key(), role_paths);
    }

    Ok(FileCollection { paths })
}

// -- Tests -------------------------------------------------------------------
