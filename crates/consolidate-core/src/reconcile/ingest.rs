//! Feed ingest: create exams for visits the store does not have yet.
//!
//! Idempotent by external visit id; images are skipped when their URL is
//! already stored.

use std::collections::HashMap;

use chrono::{Duration, SecondsFormat, Utc};

use super::feed::{ExternalFeed, FeedImage};
use super::locations::LocationOutcome;
use crate::config::PipelineConfig;
use crate::db::Database;
use crate::images::{file_name_from_url, stable_image_id};
use crate::models::{Exam, ExamImage, ImageType, Patient};
use crate::pipeline::{run_units, Finding, FindingKind, PassKind, PassSummary, RunMode, UnitReport};
use crate::Result;

/// Ingest every feed visit missing from the store.
pub fn ingest_pass(
    db: &Database,
    feed: &dyn ExternalFeed,
    config: &PipelineConfig,
    mode: RunMode,
) -> Result<PassSummary> {
    let today = Utc::now().date_naive();
    let locations = config.location_resolver();
    let normalizer = config.normalizer();

    // Patients by the same name key the merge pass groups on, so a visit
    // never gets a new patient that merge would then fold into an old one.
    let mut by_key: HashMap<String, Vec<Patient>> = HashMap::new();
    for patient in db.list_patients()? {
        let key = normalizer.normalize(&patient.name);
        if !key.is_empty() {
            by_key.entry(key).or_default().push(patient);
        }
    }

    let visit_ids: Vec<String> = feed.visits().map(|(id, _)| id.to_string()).collect();
    let mut summary = PassSummary::new(PassKind::Ingest, mode);

    run_units(db, &mut summary, config.batch_size, &visit_ids, Clone::clone, |db, visit_id| {
        if db.find_exam_by_external_id(visit_id)?.is_some() {
            return Ok(UnitReport::unchanged());
        }
        let Some(visit) = feed.visit(visit_id) else {
            return Ok(UnitReport::unchanged());
        };
        let Some(name) = visit.patient_name.as_deref() else {
            return Ok(UnitReport::ambiguous(visit_id.clone(), "visit has no patient name"));
        };
        let key = normalizer.normalize(name);
        if key.is_empty() {
            return Ok(UnitReport::ambiguous(visit_id.clone(), "visit has no patient name"));
        }

        let fields = visit.fields(today);

        // Same name, and no conflicting birth date.
        let candidates: Vec<&Patient> = by_key
            .get(&key)
            .into_iter()
            .flatten()
            .filter(|p| match (p.birth_date, fields.birth_date) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            })
            .collect();
        if candidates.len() > 1 {
            return Ok(UnitReport::ambiguous(
                visit_id.clone(),
                format!("{} local patients match '{name}'", candidates.len()),
            ));
        }

        let mut report = UnitReport::applied();
        let mut created = None;
        let patient = match candidates.into_iter().next() {
            Some(existing) => existing.clone(),
            None => {
                let mut patient = Patient::new(name.trim().to_string());
                patient.cpf = fields.cpf;
                patient.birth_date = fields.birth_date;
                patient.gender = fields.gender;
                patient.underlying_diseases = fields.underlying_diseases;
                patient.ophthalmic_diseases = fields.ophthalmic_diseases;
                report.push(Finding::new(FindingKind::Applied, patient.id.clone(), format!("new patient {name}")));
                if mode.is_execute() {
                    db.insert_patient(&patient)?;
                }
                created = Some(patient.clone());
                patient
            }
        };

        let mut exam = Exam::new(
            patient.id.clone(),
            visit
                .visit_date()
                .map(str::to_string)
                .unwrap_or_else(|| today.format("%Y-%m-%d").to_string()),
        );
        exam.external_id = Some(visit_id.clone());
        exam.location = visit.clinic_name.as_deref().map(|c| match locations.resolve(c, None) {
            LocationOutcome::Resolved(name) => name,
            _ => c.trim().to_string(),
        });
        report.push(Finding::new(
            FindingKind::Applied,
            visit_id.clone(),
            format!("new exam {} for {}", exam.id, patient.name),
        ));
        if mode.is_execute() {
            db.insert_exam(&exam)?;
        }

        for (position, listed) in visit.image_list.iter().enumerate() {
            match image_for(db, config, &exam, listed, position)? {
                Ok(image) => {
                    if mode.is_execute() {
                        db.insert_image(&image)?;
                    }
                }
                Err(reason) => report.push(Finding::new(FindingKind::Skipped, visit_id.clone(), reason)),
            }
        }

        if let Some(patient) = created {
            by_key.entry(key).or_default().push(patient);
        }
        Ok(report)
    })?;

    Ok(summary)
}

/// Build the image row for a listed feed image, or say why it is skipped.
fn image_for(
    db: &Database,
    config: &PipelineConfig,
    exam: &Exam,
    listed: &FeedImage,
    position: usize,
) -> Result<std::result::Result<ExamImage, String>> {
    let url = match (&listed.url, &listed.uuid, &config.image_base_url) {
        (Some(url), _, _) => url.clone(),
        (None, Some(uuid), Some(base)) => format!("{}/{}.jpg", base.trim_end_matches('/'), uuid),
        _ => return Ok(Err(format!("image #{position} has no resolvable URL"))),
    };

    if db.find_image_by_url(&url)?.is_some() {
        return Ok(Err(format!("image {url} already stored")));
    }

    let id = stable_image_id(&url).unwrap_or_else(|| format!("img-{}", uuid::Uuid::new_v4()));
    if db.get_image(&id)?.is_some() {
        return Ok(Err(format!("image id {id} already stored")));
    }

    let image_type = listed
        .image_type
        .as_deref()
        .and_then(ImageType::parse)
        .unwrap_or(ImageType::Color);
    let file_name = listed
        .file_name
        .clone()
        .or_else(|| file_name_from_url(&url))
        .unwrap_or_else(|| id.clone());

    Ok(Ok(ExamImage {
        id,
        exam_id: exam.id.clone(),
        url,
        file_name,
        image_type,
        // Listing order is capture order.
        uploaded_at: (Utc::now() + Duration::milliseconds(position as i64))
            .to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}
