//! Filename and folder templates.
//!
//! A template is a path string with `{tag}` placeholders. Only tags known to
//! the [`TagRegistry`] are placeholders, any other brace pair is kept as
//! literal text. Datetime tags render with their own strftime pattern.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{
    format::{Item, StrftimeItems},
    NaiveDateTime,
};
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{HatError, Result};

lazy_static! {
    static ref TAG_RE: Regex = Regex::new(r"\{([A-Za-z0-9_]+)\}").unwrap();
}

/// Pattern used when a timestamp is bound to a plain text tag.
const DEFAULT_TIME_PATTERN: &str = "%Y%m%d%H%M";

#[derive(Debug, Clone, PartialEq)]
pub enum TagKind {
    Datetime(String),
    Text,
}

/// The set of recognized tag names and how their values render.
#[derive(Debug, Clone, Default)]
pub struct TagRegistry {
    tags: BTreeMap<String, TagKind>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_datetime(mut self, name: &str, pattern: &str) -> Result<Self> {
        validate_pattern(name, pattern)?;
        self.tags
            .insert(name.to_string(), TagKind::Datetime(pattern.to_string()));
        Ok(self)
    }

    pub fn with_text(mut self, name: &str) -> Self {
        self.tags.insert(name.to_string(), TagKind::Text);
        self
    }

    pub fn kind(&self, name: &str) -> Option<&TagKind> {
        self.tags.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    pub fn datetime_tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().filter_map(|(name, kind)| match kind {
            TagKind::Datetime(_) => Some(name.as_str()),
            TagKind::Text => None,
        })
    }
}

fn validate_pattern(name: &str, pattern: &str) -> Result<()> {
    if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
        return Err(HatError::config(format!(
            "invalid datetime pattern `{}` for tag `{}`",
            pattern, name
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Time(NaiveDateTime),
    Text(String),
}

impl From<NaiveDateTime> for TagValue {
    fn from(time: NaiveDateTime) -> Self {
        TagValue::Time(time)
    }
}

impl From<&str> for TagValue {
    fn from(s: &str) -> Self {
        TagValue::Text(s.to_string())
    }
}

impl From<String> for TagValue {
    fn from(s: String) -> Self {
        TagValue::Text(s)
    }
}

/// Placeholder values for one resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateContext {
    values: BTreeMap<String, TagValue>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tag: &str, value: impl Into<TagValue>) -> Self {
        self.insert(tag, value);
        self
    }

    pub fn insert(&mut self, tag: &str, value: impl Into<TagValue>) {
        self.values.insert(tag.to_string(), value.into());
    }

    /// Sets every datetime tag of the registry to `time`.
    pub fn with_time(mut self, registry: &TagRegistry, time: NaiveDateTime) -> Self {
        for tag in registry.datetime_tags() {
            self.values.insert(tag.to_string(), TagValue::Time(time));
        }
        self
    }

    /// Values of `other` win over the ones already present.
    pub fn merge(mut self, other: &TemplateContext) -> Self {
        for (tag, value) in &other.values {
            self.values.insert(tag.clone(), value.clone());
        }
        self
    }

    pub fn get(&self, tag: &str) -> Option<&TagValue> {
        self.values.get(tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillPolicy {
    /// Every recognized tag must have a value.
    Strict,
    /// Recognized tags without a value stay in place.
    Partial,
}

pub fn resolve(
    template: &str,
    registry: &TagRegistry,
    context: &TemplateContext,
    policy: FillPolicy,
) -> Result<String> {
    let mut resolved = String::with_capacity(template.len() + 16);
    let mut last = 0;

    for caps in TAG_RE.captures_iter(template) {
        let (whole, tag) = match (caps.get(0), caps.get(1)) {
            (Some(whole), Some(tag)) => (whole, tag.as_str()),
            _ => continue,
        };
        let Some(kind) = registry.kind(tag) else {
            continue;
        };

        match context.get(tag) {
            Some(value) => {
                resolved.push_str(&template[last..whole.start()]);
                resolved.push_str(&render(kind, value));
                last = whole.end();
            }
            None if policy == FillPolicy::Partial => {}
            None => {
                return Err(HatError::MissingTag {
                    tag: tag.to_string(),
                    template: template.to_string(),
                })
            }
        }
    }
    resolved.push_str(&template[last..]);

    Ok(resolved)
}

fn render(kind: &TagKind, value: &TagValue) -> String {
    match (kind, value) {
        (TagKind::Datetime(pattern), TagValue::Time(time)) => time.format(pattern).to_string(),
        (TagKind::Text, TagValue::Time(time)) => time.format(DEFAULT_TIME_PATTERN).to_string(),
        (_, TagValue::Text(text)) => text.clone(),
    }
}

/// Recognized tags used by `template`.
pub fn tags_in(template: &str, registry: &TagRegistry) -> BTreeSet<String> {
    TAG_RE
        .captures_iter(template)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|tag| registry.contains(tag))
        .map(str::to_string)
        .collect()
}

/// Recovers the rendered value of each recognized tag from a resolved string.
///
/// Returns `None` when `resolved` does not match the template, or when a
/// repeated tag was rendered with different values.
pub fn extract(
    template: &str,
    registry: &TagRegistry,
    resolved: &str,
) -> Option<BTreeMap<String, String>> {
    let mut pattern = String::from("^");
    let mut order = Vec::new();
    let mut last = 0;

    for caps in TAG_RE.captures_iter(template) {
        let whole = caps.get(0)?;
        let tag = caps.get(1)?.as_str();
        if !registry.contains(tag) {
            continue;
        }
        pattern.push_str(&regex::escape(&template[last..whole.start()]));
        pattern.push_str("(.+?)");
        order.push(tag.to_string());
        last = whole.end();
    }
    pattern.push_str(&regex::escape(&template[last..]));
    pattern.push('$');

    let re = Regex::new(&pattern).ok()?;
    let caps = re.captures(resolved)?;

    let mut values = BTreeMap::new();
    for (idx, tag) in order.into_iter().enumerate() {
        let value = caps.get(idx + 1)?.as_str().to_string();
        match values.get(&tag) {
            Some(previous) if previous != &value => return None,
            _ => {
                values.insert(tag, value);
            }
        }
    }

    Some(values)
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod test {
    use chrono::NaiveDate;

    use super::*;

    fn registry() -> TagRegistry {
        TagRegistry::new()
            .with_datetime("source_datetime", "%Y%m%d%H%M")
            .unwrap()
            .with_datetime("source_sub_path_time", "%Y/%m/%d")
            .unwrap()
            .with_text("domain_name")
            .with_text("section_name")
    }

    fn time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(7, 0, 0)
            .unwrap()
    }

    #[test]
    fn should_resolve_time_and_text_tags() {
        let context = TemplateContext::new()
            .with_time(&registry(), time())
            .with("domain_name", "marche");

        let path = resolve(
            "/data/{source_sub_path_time}/q_{domain_name}_{source_datetime}.asc",
            &registry(),
            &context,
            FillPolicy::Strict,
        )
        .unwrap();

        assert_eq!(path, "/data/2024/03/05/q_marche_202403050700.asc");
    }

    #[test]
    fn should_replace_repeated_tags() {
        let context = TemplateContext::new().with("domain_name", "marche");
        let path = resolve(
            "{domain_name}/{domain_name}.json",
            &registry(),
            &context,
            FillPolicy::Strict,
        )
        .unwrap();

        assert_eq!(path, "marche/marche.json");
    }

    #[test]
    fn should_return_literal_template_unchanged() {
        let path = resolve(
            "/static/grid.asc",
            &registry(),
            &TemplateContext::new(),
            FillPolicy::Strict,
        )
        .unwrap();

        assert_eq!(path, "/static/grid.asc");
    }

    #[test]
    fn should_keep_unrecognized_braces() {
        let context = TemplateContext::new().with("domain_name", "marche");
        let path = resolve(
            "{unknown}/{domain_name}",
            &registry(),
            &context,
            FillPolicy::Strict,
        )
        .unwrap();

        assert_eq!(path, "{unknown}/marche");
    }

    #[test]
    fn should_fail_on_missing_tag_when_strict() {
        let context = TemplateContext::new().with("domain_name", "marche");
        let err = resolve(
            "{domain_name}/{section_name}.csv",
            &registry(),
            &context,
            FillPolicy::Strict,
        )
        .unwrap_err();

        assert!(matches!(err, HatError::MissingTag { ref tag, .. } if tag == "section_name"));
    }

    #[test]
    fn should_leave_missing_tag_when_partial() {
        let context = TemplateContext::new().with("domain_name", "marche");
        let path = resolve(
            "{domain_name}/{section_name}.csv",
            &registry(),
            &context,
            FillPolicy::Partial,
        )
        .unwrap();

        assert_eq!(path, "marche/{section_name}.csv");
    }

    #[test]
    fn should_reject_invalid_datetime_pattern() {
        assert!(TagRegistry::new().with_datetime("bad", "%Q%").is_err());
    }

    #[test]
    fn should_list_recognized_tags() {
        let tags = tags_in("{domain_name}/{other}/{section_name}", &registry());
        let expected: BTreeSet<String> = ["domain_name", "section_name"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        assert_eq!(tags, expected);
    }

    #[test]
    fn should_extract_substituted_values() {
        let template = "{domain_name}/{section_name}_{domain_name}.csv";
        let contexts = [("marche", "esino"), ("lazio", "tevere-ripetta"), ("a", "b")];

        for (domain, section) in contexts {
            let context = TemplateContext::new()
                .with("domain_name", domain)
                .with("section_name", section);
            let resolved = resolve(template, &registry(), &context, FillPolicy::Strict).unwrap();
            let values = extract(template, &registry(), &resolved).unwrap();

            assert_eq!(values["domain_name"], domain);
            assert_eq!(values["section_name"], section);
        }
    }

    #[test]
    fn should_not_extract_from_foreign_string() {
        assert!(extract("{domain_name}.csv", &registry(), "marche.asc").is_none());
    }
}
