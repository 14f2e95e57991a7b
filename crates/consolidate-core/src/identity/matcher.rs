//! Identity matcher.
//!
//! Groups patient records into equivalence classes by normalized name,
//! optionally split by birth date. Distinct keys that look alike are
//! reported as near-matches for manual review, never merged.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::Serialize;

use super::normalizer::NameNormalizer;
use crate::models::Patient;

/// What the merger may do with a class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassKind {
    /// One record, nothing to merge.
    Singleton,
    /// Several records of the same person.
    Duplicate,
    /// Same key but cannot be safely reduced to one record.
    Ambiguous { reason: String },
}

/// A set of records believed to be the same person.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EquivalenceClass {
    /// Normalized name key shared by every member
    pub key: String,
    /// Birth date shared by the members, when split on it
    pub birth_date: Option<NaiveDate>,
    /// Patient ids, in input order
    pub members: Vec<String>,
    pub kind: ClassKind,
}

impl EquivalenceClass {
    pub fn is_duplicate(&self) -> bool {
        self.kind == ClassKind::Duplicate
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self.kind, ClassKind::Ambiguous { .. })
    }
}

/// Why two distinct keys were flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NearMatchReason {
    /// Every token of the shorter key appears in the longer one.
    TokenContainment,
    /// Jaro-Winkler similarity reached the threshold.
    Similarity,
}

/// Two name keys that probably belong to the same person.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearMatch {
    pub left_key: String,
    pub right_key: String,
    pub left_members: Vec<String>,
    pub right_members: Vec<String>,
    pub similarity: f64,
    pub reason: NearMatchReason,
}

/// Result of grouping a record set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchReport {
    pub classes: Vec<EquivalenceClass>,
    pub near_matches: Vec<NearMatch>,
}

impl MatchReport {
    pub fn duplicates(&self) -> impl Iterator<Item = &EquivalenceClass> {
        self.classes.iter().filter(|c| c.is_duplicate())
    }

    pub fn ambiguous(&self) -> impl Iterator<Item = &EquivalenceClass> {
        self.classes.iter().filter(|c| c.is_ambiguous())
    }
}

/// Groups patients into equivalence classes.
#[derive(Debug, Clone)]
pub struct IdentityMatcher {
    normalizer: NameNormalizer,
    split_on_birth_date: bool,
    near_match_threshold: Option<f64>,
}

impl Default for IdentityMatcher {
    fn default() -> Self {
        Self::new(NameNormalizer::default())
    }
}

impl IdentityMatcher {
    pub fn new(normalizer: NameNormalizer) -> Self {
        Self {
            normalizer,
            split_on_birth_date: true,
            near_match_threshold: None,
        }
    }

    pub fn split_on_birth_date(mut self, split: bool) -> Self {
        self.split_on_birth_date = split;
        self
    }

    pub fn near_match_threshold(mut self, threshold: Option<f64>) -> Self {
        self.near_match_threshold = threshold;
        self
    }

    pub fn normalizer(&self) -> &NameNormalizer {
        &self.normalizer
    }

    /// Group records into equivalence classes.
    ///
    /// Classes come out ordered by key. Records with an empty key are
    /// always singletons.
    pub fn group(&self, patients: &[Patient]) -> MatchReport {
        let mut by_key: BTreeMap<String, Vec<&Patient>> = BTreeMap::new();
        let mut unnamed = Vec::new();

        for patient in patients {
            let key = self.normalizer.normalize(&patient.name);
            if key.is_empty() {
                unnamed.push(patient);
            } else {
                by_key.entry(key).or_default().push(patient);
            }
        }

        let mut classes = Vec::new();
        for (key, members) in &by_key {
            self.classify(key, members, &mut classes);
        }
        for patient in unnamed {
            classes.push(EquivalenceClass {
                key: String::new(),
                birth_date: patient.birth_date,
                members: vec![patient.id.clone()],
                kind: ClassKind::Singleton,
            });
        }

        let near_matches = self.near_matches(&by_key);

        tracing::debug!(
            records = patients.len(),
            classes = classes.len(),
            near_matches = near_matches.len(),
            "grouped records"
        );

        MatchReport {
            classes,
            near_matches,
        }
    }

    fn classify(&self, key: &str, members: &[&Patient], out: &mut Vec<EquivalenceClass>) {
        let class = |birth_date, members: Vec<&Patient>, kind| EquivalenceClass {
            key: key.to_string(),
            birth_date,
            members: members.iter().map(|p| p.id.clone()).collect(),
            kind,
        };

        if members.len() == 1 {
            out.push(class(members[0].birth_date, members.to_vec(), ClassKind::Singleton));
            return;
        }

        let dates: BTreeSet<NaiveDate> = members.iter().filter_map(|p| p.birth_date).collect();
        if dates.len() <= 1 {
            let date = dates.into_iter().next();
            out.push(class(date, members.to_vec(), ClassKind::Duplicate));
            return;
        }

        if !self.split_on_birth_date {
            let reason = format!("{} conflicting birth dates", dates.len());
            out.push(class(None, members.to_vec(), ClassKind::Ambiguous { reason }));
            return;
        }

        let undated = members.iter().filter(|p| p.birth_date.is_none()).count();
        if undated > 0 {
            let reason = format!(
                "{undated} record(s) without birth date alongside {} distinct birth dates",
                dates.len()
            );
            out.push(class(None, members.to_vec(), ClassKind::Ambiguous { reason }));
            return;
        }

        for date in dates {
            let subgroup: Vec<&Patient> = members
                .iter()
                .copied()
                .filter(|p| p.birth_date == Some(date))
                .collect();
            let kind = if subgroup.len() == 1 {
                ClassKind::Singleton
            } else {
                ClassKind::Duplicate
            };
            out.push(class(Some(date), subgroup, kind));
        }
    }

    fn near_matches(&self, by_key: &BTreeMap<String, Vec<&Patient>>) -> Vec<NearMatch> {
        let keys: Vec<(&String, BTreeSet<&str>)> = by_key
            .keys()
            .map(|k| (k, k.split(' ').collect()))
            .collect();

        let mut found = Vec::new();
        for (i, (left, left_tokens)) in keys.iter().enumerate() {
            for (right, right_tokens) in &keys[i + 1..] {
                let similarity = strsim::jaro_winkler(left, right);
                let reason = if token_containment(left_tokens, right_tokens) {
                    NearMatchReason::TokenContainment
                } else if self.near_match_threshold.is_some_and(|t| similarity >= t) {
                    NearMatchReason::Similarity
                } else {
                    continue;
                };

                found.push(NearMatch {
                    left_key: (*left).clone(),
                    right_key: (*right).clone(),
                    left_members: ids(&by_key[*left]),
                    right_members: ids(&by_key[*right]),
                    similarity,
                    reason,
                });
            }
        }
        found
    }
}

/// Shorter key has at least two tokens, all present in the longer key.
fn token_containment(a: &BTreeSet<&str>, b: &BTreeSet<&str>) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    short.len() >= 2 && short.is_subset(long)
}

fn ids(patients: &[&Patient]) -> Vec<String> {
    patients.iter().map(|p| p.id.clone()).collect()
}
