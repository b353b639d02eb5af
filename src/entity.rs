//! Entities a dataset role is repeated over: domains, river sections and
//! ensemble members.

use std::{
    collections::BTreeSet,
    fmt,
    fs::File,
    io::Read,
    path::Path,
};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{HatError, Result},
    template::TemplateContext,
};

pub const TAG_DOMAIN: &str = "domain_name";
pub const TAG_SECTION_DOMAIN: &str = "section_domain";
pub const TAG_SECTION: &str = "section_name";
pub const TAG_ENSEMBLE: &str = "ensemble_name";

lazy_static! {
    static ref ENSEMBLE_FORMAT_RE: Regex =
        Regex::new(r"^([^{}]*)\{(?::(0?)(\d*)d?)?\}([^{}]*)$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityScope {
    #[default]
    Domain,
    Section,
    Ensemble,
}

impl EntityScope {
    /// Tag that must appear in the templates of a role with this scope.
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            EntityScope::Domain => None,
            EntityScope::Section => Some(TAG_SECTION),
            EntityScope::Ensemble => Some(TAG_ENSEMBLE),
        }
    }
}

impl fmt::Display for EntityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityScope::Domain => write!(f, "domain"),
            EntityScope::Section => write!(f, "section"),
            EntityScope::Ensemble => write!(f, "ensemble"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Entity {
    Domain(String),
    Section { domain: String, name: String },
    Ensemble(String),
}

impl Entity {
    /// Identifier used as key in file collections and reports.
    pub fn key(&self) -> String {
        match self {
            Entity::Domain(name) => name.clone(),
            Entity::Section { domain, name } => format!("{}:{}", domain, name),
            Entity::Ensemble(id) => id.clone(),
        }
    }

    pub fn scope(&self) -> EntityScope {
        match self {
            Entity::Domain(_) => EntityScope::Domain,
            Entity::Section { .. } => EntityScope::Section,
            Entity::Ensemble(_) => EntityScope::Ensemble,
        }
    }

    pub fn context(&self) -> TemplateContext {
        match self {
            Entity::Domain(name) => TemplateContext::new().with(TAG_DOMAIN, name.as_str()),
            Entity::Section { domain, name } => TemplateContext::new()
                .with(TAG_SECTION_DOMAIN, domain.as_str())
                .with(TAG_SECTION, name.as_str()),
            Entity::Ensemble(id) => TemplateContext::new().with(TAG_ENSEMBLE, id.as_str()),
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Column names of the static sections table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SectionColumns {
    pub domain: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for SectionColumns {
    fn default() -> Self {
        SectionColumns {
            domain: "section_domain".to_string(),
            name: "section_name".to_string(),
            kind: "section_type".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SectionRecord {
    pub domain: String,
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, Default)]
pub struct SectionTable {
    records: Vec<SectionRecord>,
}

impl SectionTable {
    pub fn from_csv(path: &Path, columns: &SectionColumns, delimiter: u8) -> Result<Self> {
        let file = File::open(path).map_err(|_| {
            HatError::config(format!("sections table {} not found", path.display()))
        })?;
        Self::from_reader(file, columns, delimiter, path)
    }

    pub fn from_reader<R: Read>(
        reader: R,
        columns: &SectionColumns,
        delimiter: u8,
        origin: &Path,
    ) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = reader.headers()?.clone();
        let column_index = |name: &str| {
            headers.iter().position(|h| h == name).ok_or_else(|| {
                HatError::config(format!(
                    "sections table {} has no column `{}`",
                    origin.display(),
                    name
                ))
            })
        };
        let idx_domain = column_index(&columns.domain)?;
        let idx_name = column_index(&columns.name)?;
        let idx_kind = column_index(&columns.kind)?;

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            let field = |idx: usize| row.get(idx).unwrap_or_default().to_string();
            records.push(SectionRecord {
                domain: field(idx_domain),
                name: field(idx_name),
                kind: field(idx_kind),
            });
        }

        Ok(SectionTable { records })
    }

    pub fn records(&self) -> &[SectionRecord] {
        &self.records
    }
}

/// Sections of `domain` whose type matches `type_filter`, sorted and deduplicated.
pub fn enumerate_sections(table: &SectionTable, domain: &str, type_filter: Option<&str>) -> Vec<Entity> {
    let domain = domain.to_lowercase();

    let keys: BTreeSet<(String, String)> = table
        .records()
        .iter()
        .filter(|r| match type_filter {
            Some(filter) => r.kind.eq_ignore_ascii_case(filter),
            None => true,
        })
        .map(|r| (r.domain.to_lowercase(), r.name.to_lowercase()))
        .filter(|(d, n)| *d == domain && !n.is_empty())
        .collect();

    keys.into_iter()
        .map(|(domain, name)| Entity::Section { domain, name })
        .collect()
}

/// Ensemble members `n_min..=n_max`, named with a `{:03d}`-style format.
pub fn enumerate_ensembles(n_min: u32, n_max: u32, format: &str) -> Result<Vec<Entity>> {
    if n_min > n_max {
        return Err(HatError::config(format!(
            "ensemble range {}..{} is empty",
            n_min, n_max
        )));
    }
    let caps = ENSEMBLE_FORMAT_RE.captures(format).ok_or_else(|| {
        HatError::config(format!("ensemble format `{}` is not supported", format))
    })?;

    let prefix = caps.get(1).map_or("", |m| m.as_str());
    let zero_pad = caps.get(2).map_or(false, |m| m.as_str() == "0");
    let width: usize = caps
        .get(3)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    let suffix = caps.get(4).map_or("", |m| m.as_str());

    let members = (n_min..=n_max)
        .map(|n| {
            let number = if zero_pad {
                format!("{:0width$}", n, width = width)
            } else {
                format!("{:width$}", n, width = width)
            };
            Entity::Ensemble(format!("{}{}{}", prefix, number, suffix))
        })
        .collect();

    Ok(members)
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    const SECTIONS: &str = "section_domain,section_name,section_type
Marche,Esino_Foce,River
marche,Chienti,River
marche,Esino_Foce,River
marche,Diga_Castreccioni,Dam
lazio,Tevere,River
";

    const SECTIONS_SHUFFLED: &str = "section_domain,section_name,section_type
marche,Diga_Castreccioni,Dam
lazio,Tevere,River
marche,Esino_Foce,River
marche,Chienti,River
";

    fn table(content: &str) -> SectionTable {
        SectionTable::from_reader(
            content.as_bytes(),
            &SectionColumns::default(),
            b',',
            Path::new("sections.csv"),
        )
        .unwrap()
    }

    #[test]
    fn should_enumerate_river_sections_of_domain() {
        let sections = enumerate_sections(&table(SECTIONS), "marche", Some("river"));
        let keys: Vec<String> = sections.iter().map(Entity::key).collect();

        assert_eq!(keys, vec!["marche:chienti", "marche:esino_foce"]);
    }

    #[test]
    fn should_enumerate_all_types_without_filter() {
        let sections = enumerate_sections(&table(SECTIONS), "marche", None);
        assert_eq!(sections.len(), 3);
    }

    #[test]
    fn should_be_independent_of_row_order() {
        let a = enumerate_sections(&table(SECTIONS), "marche", Some("River"));
        let b = enumerate_sections(&table(SECTIONS_SHUFFLED), "marche", Some("River"));

        assert_eq!(a, b);
    }

    #[test]
    fn should_fail_on_missing_column() {
        let err = SectionTable::from_reader(
            "section_domain,section_name\nmarche,esino\n".as_bytes(),
            &SectionColumns::default(),
            b',',
            Path::new("sections.csv"),
        )
        .unwrap_err();

        assert!(matches!(err, HatError::Configuration(_)));
    }

    #[test]
    fn should_enumerate_padded_ensembles() {
        let members = enumerate_ensembles(1, 3, "{:03d}").unwrap();
        let keys: Vec<String> = members.iter().map(Entity::key).collect();

        assert_eq!(keys, vec!["001", "002", "003"]);
    }

    #[test]
    fn should_enumerate_ensembles_with_prefix() {
        let members = enumerate_ensembles(9, 10, "member_{:02}").unwrap();
        let keys: Vec<String> = members.iter().map(Entity::key).collect();

        assert_eq!(keys, vec!["member_09", "member_10"]);
        assert_eq!(enumerate_ensembles(5, 5, "{}").unwrap()[0].key(), "5");
    }

    #[test]
    fn should_reject_bad_ensemble_config() {
        assert!(enumerate_ensembles(3, 1, "{:03d}").is_err());
        assert!(enumerate_ensembles(1, 3, "{:x}").is_err());
    }

    #[test]
    fn should_give_entity_context() {
        let section = Entity::Section {
            domain: "marche".to_string(),
            name: "esino".to_string(),
        };
        let context = section.context();

        assert_eq!(section.key(), "marche:esino");
        assert_eq!(
            context.get(TAG_SECTION),
            Some(&crate::template::TagValue::Text("esino".to_string()))
        );
        assert_eq!(section.scope().tag(), Some(TAG_SECTION));
    }
}
