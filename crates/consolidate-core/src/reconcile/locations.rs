//! Exam location resolution.

use std::collections::BTreeMap;

use crate::identity::basic_key;

/// What to do with one exam location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationOutcome {
    Unchanged,
    Resolved(String),
    /// Opaque source id with no known display name.
    Unresolvable(String),
}

/// Maps opaque clinic ids and spelling variants to display names.
#[derive(Debug, Clone, Default)]
pub struct LocationResolver {
    clinic_names: BTreeMap<String, String>,
    /// basic name key of a spelling → canonical location
    aliases: BTreeMap<String, String>,
}

impl LocationResolver {
    pub fn new(clinic_names: &BTreeMap<String, String>, aliases: &BTreeMap<String, String>) -> Self {
        Self {
            clinic_names: clinic_names
                .iter()
                .map(|(id, name)| (id.to_ascii_lowercase(), name.clone()))
                .collect(),
            aliases: aliases
                .iter()
                .map(|(raw, canonical)| (basic_key(raw), canonical.clone()))
                .collect(),
        }
    }

    /// Resolve a stored location.
    ///
    /// `feed_clinic` is the clinic name the external feed gives for the
    /// same visit, used when the id is not configured.
    pub fn resolve(&self, raw: &str, feed_clinic: Option<&str>) -> LocationOutcome {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return match feed_clinic.map(|c| self.canonical(c)) {
                Some(name) if !name.is_empty() => LocationOutcome::Resolved(name),
                _ => LocationOutcome::Unchanged,
            };
        }

        if is_opaque_id(trimmed) {
            let known = self
                .clinic_names
                .get(&trimmed.to_ascii_lowercase())
                .cloned()
                .or_else(|| feed_clinic.map(|c| self.canonical(c)))
                .filter(|name| !name.is_empty());
            return match known {
                Some(name) => LocationOutcome::Resolved(name),
                None => LocationOutcome::Unresolvable(format!("unknown clinic id {trimmed}")),
            };
        }

        let canonical = self.canonical(trimmed);
        if canonical == raw {
            LocationOutcome::Unchanged
        } else {
            LocationOutcome::Resolved(canonical)
        }
    }

    fn canonical(&self, name: &str) -> String {
        self.aliases
            .get(&basic_key(name))
            .cloned()
            .unwrap_or_else(|| name.trim().to_string())
    }
}

/// 24 hex digits: an id from the external source, not a place name.
pub fn is_opaque_id(s: &str) -> bool {
    s.len() == 24 && s.chars().all(|c| c.is_ascii_hexdigit())
}
