//! Field reconciler.
//!
//! Decides the resulting value of each demographic field when a local
//! record meets an incoming version of the same person, either from the
//! external feed or from a duplicate record being merged.
//!
//! Rules per field:
//! - one side empty: take the other
//! - both equal after normalization: keep
//! - both differ: the priority side wins, unless the record is locked
//! - local value the external feed does not corroborate: unverifiable,
//!   kept or cleared by policy
//!
//! Disease flags merge by OR per key.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::{DiseaseFlags, Patient};

// ============================================================================
// Policies
// ============================================================================

/// Which side wins when both carry different values.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourcePriority {
    /// The incoming value corrects the local one.
    #[default]
    Incoming,
    /// The local value stays; the difference is reported.
    Existing,
}

/// What to do with a local value the external feed does not carry.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnverifiedPolicy {
    /// Keep it and flag it.
    #[default]
    Keep,
    /// Null it out.
    Clear,
}

/// Where the incoming side comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingSource {
    /// The external source-of-truth feed. Silence means "not corroborated".
    ExternalFeed,
    /// Another local record of the same person. Silence means nothing.
    DuplicateRecord,
}

// ============================================================================
// Outcomes
// ============================================================================

/// How a single field was resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Nothing to do.
    Kept,
    /// Local was empty; took the incoming value.
    Filled,
    /// Incoming value replaced a different local value.
    Corrected,
    /// Values differ but no write is allowed; reported only.
    Discrepancy,
    /// Local value with no external corroboration; kept.
    Unverifiable,
    /// Local value with no external corroboration; nulled by policy.
    Cleared,
}

impl Resolution {
    /// True when the field is written.
    pub fn changed(&self) -> bool {
        matches!(self, Resolution::Filled | Resolution::Corrected | Resolution::Cleared)
    }
}

/// Reconciled fields.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    Cpf,
    BirthDate,
    Gender,
    UnderlyingDiseases,
    OphthalmicDiseases,
}

impl FieldName {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldName::Cpf => "cpf",
            FieldName::BirthDate => "birth_date",
            FieldName::Gender => "gender",
            FieldName::UnderlyingDiseases => "underlying_diseases",
            FieldName::OphthalmicDiseases => "ophthalmic_diseases",
        }
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved value of one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldOutcome<T> {
    pub value: Option<T>,
    pub resolution: Resolution,
}

impl<T> FieldOutcome<T> {
    fn new(value: Option<T>, resolution: Resolution) -> Self {
        Self { value, resolution }
    }
}

/// One line of the per-patient reconciliation report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldReport {
    pub field: FieldName,
    pub resolution: Resolution,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// The reconciled patient and what happened to each field.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub patient: Patient,
    pub fields: Vec<FieldReport>,
}

impl Reconciliation {
    pub fn changed(&self) -> bool {
        self.fields.iter().any(|f| f.resolution.changed())
    }

    /// Fields that were not `Kept`.
    pub fn notable(&self) -> impl Iterator<Item = &FieldReport> {
        self.fields.iter().filter(|f| f.resolution != Resolution::Kept)
    }

    pub fn with_resolution(&self, resolution: Resolution) -> impl Iterator<Item = &FieldReport> {
        self.fields.iter().filter(move |f| f.resolution == resolution)
    }
}

// ============================================================================
// Normalization
// ============================================================================

const CPF_PLACEHOLDER_PREFIXES: &[&str] = &["AUTO-", "CONFLICT-"];
const CPF_PLACEHOLDERS: &[&str] = &["PENDENTE"];
const CPF_LEN: usize = 11;

/// Digits of a stored national ID, or `None` for blanks and placeholders.
pub fn cpf_digits(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let upper = trimmed.to_ascii_uppercase();
    if CPF_PLACEHOLDERS.contains(&upper.as_str())
        || CPF_PLACEHOLDER_PREFIXES.iter().any(|p| upper.starts_with(p))
    {
        return None;
    }
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    (!digits.is_empty()).then_some(digits)
}

/// A national ID accepted from an external source: exactly 11 digits.
pub fn normalize_cpf(raw: &str) -> Option<String> {
    cpf_digits(raw).filter(|d| d.len() == CPF_LEN)
}

/// Parse a feed birth date.
///
/// Accepts `YYYY-MM-DD`, full ISO timestamps (date part only) and
/// `DD/MM/YYYY`. Dates after `today` are rejected.
pub fn parse_feed_date(raw: &str, today: NaiveDate) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let date = trimmed
        .get(..10)
        .and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok())
        .or_else(|| NaiveDate::parse_from_str(trimmed, "%d/%m/%Y").ok())?;
    (date <= today).then_some(date)
}

/// Canonical gender for known synonyms.
pub fn canonical_gender(raw: &str) -> Option<&'static str> {
    match raw.trim().to_uppercase().as_str() {
        "M" | "MALE" | "MASCULINO" | "MASC" => Some("male"),
        "F" | "FEMALE" | "FEMININO" | "FEM" => Some("female"),
        _ => None,
    }
}

/// Comparison form of a gender: canonical when known, lowercased otherwise.
pub fn gender_key(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(
        canonical_gender(trimmed)
            .map(str::to_string)
            .unwrap_or_else(|| trimmed.to_lowercase()),
    )
}

// ============================================================================
// Reconciler
// ============================================================================

/// Per-field policy applied to one record.
#[derive(Debug, Clone, Copy)]
pub struct FieldPolicy {
    pub priority: SourcePriority,
    pub unverified: UnverifiedPolicy,
    pub source: IncomingSource,
    /// Locked records are never written.
    pub locked: bool,
}

/// Resolve one scalar field. Values must already be in comparison form.
pub fn reconcile_value<T: PartialEq + Clone>(
    existing: Option<T>,
    incoming: Option<T>,
    policy: FieldPolicy,
) -> FieldOutcome<T> {
    match (existing, incoming) {
        (None, None) => FieldOutcome::new(None, Resolution::Kept),
        (None, Some(_)) if policy.locked => FieldOutcome::new(None, Resolution::Discrepancy),
        (None, Some(i)) => FieldOutcome::new(Some(i), Resolution::Filled),
        (Some(e), None) => match policy.source {
            IncomingSource::DuplicateRecord => FieldOutcome::new(Some(e), Resolution::Kept),
            IncomingSource::ExternalFeed => {
                if policy.unverified == UnverifiedPolicy::Clear && !policy.locked {
                    FieldOutcome::new(None, Resolution::Cleared)
                } else {
                    FieldOutcome::new(Some(e), Resolution::Unverifiable)
                }
            }
        },
        (Some(e), Some(i)) if e == i => FieldOutcome::new(Some(e), Resolution::Kept),
        (Some(e), Some(i)) => {
            if policy.locked || policy.priority == SourcePriority::Existing {
                FieldOutcome::new(Some(e), Resolution::Discrepancy)
            } else {
                FieldOutcome::new(Some(i), Resolution::Corrected)
            }
        }
    }
}

/// OR-merge of two flag sets. A true flag never becomes false.
pub fn merge_flags(existing: &DiseaseFlags, incoming: &DiseaseFlags, locked: bool) -> FieldOutcome<DiseaseFlags> {
    let mut merged = existing.clone();
    for (condition, present) in incoming {
        let slot = merged.entry(condition.clone()).or_insert(false);
        *slot = *slot || *present;
    }

    if merged == *existing {
        FieldOutcome::new(Some(merged), Resolution::Kept)
    } else if locked {
        FieldOutcome::new(Some(existing.clone()), Resolution::Discrepancy)
    } else {
        FieldOutcome::new(Some(merged), Resolution::Filled)
    }
}

/// Incoming demographic values, already validated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatientFields {
    pub cpf: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub gender: Option<String>,
    pub underlying_diseases: DiseaseFlags,
    pub ophthalmic_diseases: DiseaseFlags,
}

impl From<&Patient> for PatientFields {
    fn from(patient: &Patient) -> Self {
        Self {
            cpf: patient.cpf.as_deref().and_then(cpf_digits),
            birth_date: patient.birth_date,
            gender: patient.gender.as_deref().and_then(gender_key),
            underlying_diseases: patient.underlying_diseases.clone(),
            ophthalmic_diseases: patient.ophthalmic_diseases.clone(),
        }
    }
}

/// Applies the per-field rules to whole patient records.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldReconciler {
    pub priority: SourcePriority,
    pub unverified: UnverifiedPolicy,
}

impl FieldReconciler {
    pub fn new(priority: SourcePriority, unverified: UnverifiedPolicy) -> Self {
        Self { priority, unverified }
    }

    /// Reconcile `existing` against `incoming`.
    ///
    /// The returned patient carries the resolved values; nothing is written.
    pub fn reconcile(&self, existing: &Patient, incoming: &PatientFields, source: IncomingSource) -> Reconciliation {
        let policy = FieldPolicy {
            priority: self.priority,
            unverified: self.unverified,
            source,
            locked: existing.manually_verified,
        };
        let mut patient = existing.clone();
        let mut fields = Vec::with_capacity(5);

        // National ID
        let current = existing.cpf.as_deref().and_then(cpf_digits);
        let outcome = reconcile_value(current, incoming.cpf.clone(), policy);
        if outcome.resolution.changed() {
            patient.cpf = outcome.value.clone();
        }
        fields.push(report(FieldName::Cpf, outcome.resolution, existing.cpf.clone(), outcome.value));

        // Birth date
        let outcome = reconcile_value(existing.birth_date, incoming.birth_date, policy);
        if outcome.resolution.changed() {
            patient.birth_date = outcome.value;
        }
        fields.push(report(
            FieldName::BirthDate,
            outcome.resolution,
            existing.birth_date.map(|d| d.to_string()),
            outcome.value.map(|d| d.to_string()),
        ));

        // Gender
        let current = existing.gender.as_deref().and_then(gender_key);
        let outcome = reconcile_value(current, incoming.gender.clone(), policy);
        if outcome.resolution.changed() {
            patient.gender = outcome.value.clone();
        }
        let after = if outcome.resolution.changed() {
            outcome.value
        } else {
            existing.gender.clone()
        };
        fields.push(report(FieldName::Gender, outcome.resolution, existing.gender.clone(), after));

        // Disease flags
        for (name, current, theirs) in [
            (
                FieldName::UnderlyingDiseases,
                &existing.underlying_diseases,
                &incoming.underlying_diseases,
            ),
            (
                FieldName::OphthalmicDiseases,
                &existing.ophthalmic_diseases,
                &incoming.ophthalmic_diseases,
            ),
        ] {
            let outcome = merge_flags(current, theirs, policy.locked);
            let merged = outcome.value.unwrap_or_default();
            let (before, after) = (flags_summary(current), flags_summary(&merged));
            if outcome.resolution.changed() {
                match name {
                    FieldName::UnderlyingDiseases => patient.underlying_diseases = merged,
                    _ => patient.ophthalmic_diseases = merged,
                }
            }
            fields.push(report(name, outcome.resolution, before, after));
        }

        Reconciliation { patient, fields }
    }
}

fn report(field: FieldName, resolution: Resolution, before: Option<String>, after: Option<String>) -> FieldReport {
    FieldReport {
        field,
        resolution,
        before,
        after,
    }
}

/// "glaucoma,diabetes" style list of true flags.
fn flags_summary(flags: &DiseaseFlags) -> Option<String> {
    let present: Vec<&str> = flags
        .iter()
        .filter(|(_, v)| **v)
        .map(|(k, _)| k.as_str())
        .collect();
    (!present.is_empty()).then(|| present.join(","))
}
