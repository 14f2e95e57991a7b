//! External source-of-truth feed.
//!
//! A read-only snapshot keyed by external visit id. The on-disk form is the
//! downloader's state file: either `{"exam_details": {visit_id: {...}}}` or
//! the bare `{visit_id: {...}}` map.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use super::fields::{gender_key, normalize_cpf, parse_feed_date, PatientFields};
use crate::identity::NameNormalizer;
use crate::models::DiseaseFlags;

/// Feed loading errors.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("cannot read feed {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid feed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// One image listed for a visit.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FeedImage {
    /// Content id of the stored file
    #[serde(default)]
    pub uuid: Option<String>,
    /// Full storage URL, when the feed has it
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "type", alias = "image_type")]
    pub image_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

/// One visit as the external source describes it.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FeedVisit {
    #[serde(default)]
    pub patient_name: Option<String>,
    #[serde(default)]
    pub cpf: Option<String>,
    #[serde(default)]
    pub birthday: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default, deserialize_with = "lenient_flags")]
    pub underlying_diseases: DiseaseFlags,
    #[serde(default, deserialize_with = "lenient_flags")]
    pub ophthalmic_diseases: DiseaseFlags,
    #[serde(default)]
    pub clinic_name: Option<String>,
    #[serde(default)]
    pub exam_date: Option<String>,
    #[serde(default)]
    pub download_date: Option<String>,
    #[serde(default, alias = "images")]
    pub image_list: Vec<FeedImage>,
}

impl FeedVisit {
    /// Validated demographic values of this visit.
    pub fn fields(&self, today: NaiveDate) -> PatientFields {
        PatientFields {
            cpf: self.cpf.as_deref().and_then(normalize_cpf),
            birth_date: self.birthday.as_deref().and_then(|b| parse_feed_date(b, today)),
            gender: self.gender.as_deref().and_then(gender_key),
            underlying_diseases: self.underlying_diseases.clone(),
            ophthalmic_diseases: self.ophthalmic_diseases.clone(),
        }
    }

    /// Visit date, falling back to the download date.
    pub fn visit_date(&self) -> Option<&str> {
        self.exam_date
            .as_deref()
            .or(self.download_date.as_deref())
            .filter(|d| !d.trim().is_empty())
    }
}

/// Read access to an external feed.
pub trait ExternalFeed {
    /// Look up a visit by external id.
    fn visit(&self, visit_id: &str) -> Option<&FeedVisit>;

    /// Every visit, ordered by visit id.
    fn visits(&self) -> Box<dyn Iterator<Item = (&str, &FeedVisit)> + '_>;

    fn len(&self) -> usize {
        self.visits().count()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Snapshot {
    Wrapped { exam_details: BTreeMap<String, FeedVisit> },
    Bare(BTreeMap<String, FeedVisit>),
}

/// Feed backed by a JSON snapshot file.
#[derive(Debug, Clone, Default)]
pub struct JsonSnapshotFeed {
    visits: BTreeMap<String, FeedVisit>,
}

impl JsonSnapshotFeed {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, FeedError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| FeedError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let feed = Self::from_json_str(&raw)?;
        tracing::info!(path = %path.display(), visits = feed.visits.len(), "loaded feed snapshot");
        Ok(feed)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, FeedError> {
        let visits = match serde_json::from_str::<Snapshot>(raw)? {
            Snapshot::Wrapped { exam_details } => exam_details,
            Snapshot::Bare(visits) => visits,
        };
        Ok(Self { visits })
    }

    pub fn from_visits<I>(visits: I) -> Self
    where
        I: IntoIterator<Item = (String, FeedVisit)>,
    {
        Self {
            visits: visits.into_iter().collect(),
        }
    }
}

impl ExternalFeed for JsonSnapshotFeed {
    fn visit(&self, visit_id: &str) -> Option<&FeedVisit> {
        self.visits.get(visit_id)
    }

    fn visits(&self) -> Box<dyn Iterator<Item = (&str, &FeedVisit)> + '_> {
        Box::new(self.visits.iter().map(|(id, v)| (id.as_str(), v)))
    }

    fn len(&self) -> usize {
        self.visits.len()
    }
}

/// Name-key index over a feed.
pub struct FeedIndex<'a> {
    feed: &'a dyn ExternalFeed,
    by_name: HashMap<String, Vec<&'a str>>,
}

impl<'a> FeedIndex<'a> {
    pub fn build(feed: &'a dyn ExternalFeed, normalizer: &NameNormalizer) -> Self {
        let mut by_name: HashMap<String, Vec<&'a str>> = HashMap::new();
        for (id, visit) in feed.visits() {
            let key = visit
                .patient_name
                .as_deref()
                .map(|n| normalizer.normalize(n))
                .unwrap_or_default();
            if !key.is_empty() {
                by_name.entry(key).or_default().push(id);
            }
        }
        Self { feed, by_name }
    }

    pub fn feed(&self) -> &'a dyn ExternalFeed {
        self.feed
    }

    /// Visit ids whose patient name has this key.
    pub fn by_name_key(&self, key: &str) -> &[&'a str] {
        self.by_name.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Combine the values of several visits of one person.
///
/// Flags are OR-merged. Scalar fields must agree across visits; the
/// first disagreement is returned as an error message.
pub fn aggregate_visits(visits: &[&FeedVisit], today: NaiveDate) -> Result<PatientFields, String> {
    let mut combined = PatientFields::default();

    for visit in visits {
        let fields = visit.fields(today);
        agree("cpf", &mut combined.cpf, fields.cpf)?;
        agree("birth_date", &mut combined.birth_date, fields.birth_date)?;
        agree("gender", &mut combined.gender, fields.gender)?;

        for (target, source) in [
            (&mut combined.underlying_diseases, fields.underlying_diseases),
            (&mut combined.ophthalmic_diseases, fields.ophthalmic_diseases),
        ] {
            for (condition, present) in source {
                let slot = target.entry(condition).or_insert(false);
                *slot = *slot || present;
            }
        }
    }

    Ok(combined)
}

fn agree<T: PartialEq + std::fmt::Debug>(field: &str, slot: &mut Option<T>, value: Option<T>) -> Result<(), String> {
    let Some(value) = value else {
        return Ok(());
    };
    if let Some(current) = slot.as_ref() {
        if *current != value {
            return Err(format!("feed visits disagree on {field}: {current:?} vs {value:?}"));
        }
        return Ok(());
    }
    *slot = Some(value);
    Ok(())
}

/// Disease flags where the source may send `null` for unknown.
fn lenient_flags<'de, D>(deserializer: D) -> Result<DiseaseFlags, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, Option<bool>>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 6, 1).unwrap()
    }

    const WRAPPED: &str = r#"{
        "downloaded_exams": ["697001ce4e429636ed944c10"],
        "exam_details": {
            "697001ce4e429636ed944c10": {
                "patient_name": "Maria José da Silva",
                "clinic_name": "Tauá-CE",
                "birthday": "1958-03-14T00:00:00.000Z",
                "gender": "female",
                "cpf": "123.456.789-01",
                "underlying_diseases": {"diabetes": true, "smoker": null},
                "ophthalmic_diseases": {"glaucoma": false},
                "image_list": [{"uuid": "fa3f5498-ad73-4bd8-a530-b758e9f50580", "type": "COLOR"}]
            }
        }
    }"#;

    #[test]
    fn test_parse_wrapped_snapshot() {
        let feed = JsonSnapshotFeed::from_json_str(WRAPPED).unwrap();
        assert_eq!(feed.len(), 1);

        let visit = feed.visit("697001ce4e429636ed944c10").unwrap();
        assert_eq!(visit.clinic_name.as_deref(), Some("Tauá-CE"));
        assert_eq!(visit.underlying_diseases.get("diabetes"), Some(&true));
        assert!(!visit.underlying_diseases.contains_key("smoker"));
        assert_eq!(visit.image_list.len(), 1);

        let fields = visit.fields(today());
        assert_eq!(fields.cpf.as_deref(), Some("12345678901"));
        assert_eq!(fields.birth_date, NaiveDate::from_ymd_opt(1958, 3, 14));
        assert_eq!(fields.gender.as_deref(), Some("female"));
    }

    #[test]
    fn test_parse_bare_snapshot() {
        let feed = JsonSnapshotFeed::from_json_str(r#"{"abc": {"patient_name": "Ana"}}"#).unwrap();
        assert_eq!(feed.visit("abc").unwrap().patient_name.as_deref(), Some("Ana"));
    }

    #[test]
    fn test_invalid_cpf_is_absent() {
        let visit = FeedVisit {
            cpf: Some("123".into()),
            ..Default::default()
        };
        assert_eq!(visit.fields(today()).cpf, None);
    }

    #[test]
    fn test_from_path_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = JsonSnapshotFeed::from_path(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, FeedError::Read { .. }));
    }

    #[test]
    fn test_from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("download_state.json");
        std::fs::write(&path, WRAPPED).unwrap();
        assert_eq!(JsonSnapshotFeed::from_path(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_name_index() {
        let feed = JsonSnapshotFeed::from_json_str(WRAPPED).unwrap();
        let index = FeedIndex::build(&feed, &NameNormalizer::default());
        assert_eq!(index.by_name_key("MARIA JOSE SILVA"), &["697001ce4e429636ed944c10"]);
        assert!(index.by_name_key("ANA").is_empty());
    }

    #[test]
    fn test_aggregate_agreeing_visits() {
        let mut a = FeedVisit {
            cpf: Some("12345678901".into()),
            ..Default::default()
        };
        a.underlying_diseases.insert("diabetes".into(), true);
        let mut b = FeedVisit {
            birthday: Some("1958-03-14".into()),
            cpf: Some("123.456.789-01".into()),
            ..Default::default()
        };
        b.underlying_diseases.insert("diabetes".into(), false);

        let fields = aggregate_visits(&[&a, &b], today()).unwrap();
        assert_eq!(fields.cpf.as_deref(), Some("12345678901"));
        assert_eq!(fields.birth_date, NaiveDate::from_ymd_opt(1958, 3, 14));
        assert_eq!(fields.underlying_diseases.get("diabetes"), Some(&true));
    }

    #[test]
    fn test_aggregate_conflicting_visits() {
        let a = FeedVisit {
            gender: Some("M".into()),
            ..Default::default()
        };
        let b = FeedVisit {
            gender: Some("F".into()),
            ..Default::default()
        };
        let err = aggregate_visits(&[&a, &b], today()).unwrap_err();
        assert!(err.contains("gender"));
    }
}
