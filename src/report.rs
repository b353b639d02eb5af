//! Narration of a run: one outcome per (role, entity).

use std::fmt;

use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Outcome {
    Done,
    Loaded,
    Skipped,
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Done => write!(f, "DONE"),
            Outcome::Loaded => write!(f, "LOADED"),
            Outcome::Skipped => write!(f, "SKIPPED"),
            Outcome::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportEntry {
    pub domain: String,
    /// Role key, e.g. `destination/discharge_max`.
    pub role: String,
    pub entity: String,
    pub outcome: Outcome,
    pub detail: Option<String>,
}

/// Owned by the command that starts a run and handed to the driver.
#[derive(Debug, Default)]
pub struct RunReport {
    entries: Vec<ReportEntry>,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        domain: &str,
        role: &str,
        entity: &str,
        outcome: Outcome,
        detail: Option<String>,
    ) {
        let suffix = detail
            .as_deref()
            .map(|d| format!(" ({})", d))
            .unwrap_or_default();
        match outcome {
            Outcome::Failed => warn!("{} {} {} ... {}{}", domain, role, entity, outcome, suffix),
            _ => info!("{} {} {} ... {}{}", domain, role, entity, outcome, suffix),
        }

        self.entries.push(ReportEntry {
            domain: domain.to_string(),
            role: role.to_string(),
            entity: entity.to_string(),
            outcome,
            detail,
        });
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.entries.iter().filter(|e| e.outcome == outcome).count()
    }

    /// Outcome of one role and entity, the last one recorded.
    pub fn outcome(&self, role: &str, entity: &str) -> Option<Outcome> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.role == role && e.entity == entity)
            .map(|e| e.outcome)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} done, {} loaded, {} skipped, {} failed",
            self.count(Outcome::Done),
            self.count(Outcome::Loaded),
            self.count(Outcome::Skipped),
            self.count(Outcome::Failed)
        )
    }
}

// -- Tests -------------------------------------------------------------------
