//! Reconciliation pass: every patient against the external feed.

use chrono::Utc;

use super::feed::{aggregate_visits, ExternalFeed, FeedIndex, FeedVisit};
use super::fields::{IncomingSource, Resolution};
use super::locations::LocationOutcome;
use crate::config::PipelineConfig;
use crate::db::Database;
use crate::models::{Exam, Patient};
use crate::pipeline::{run_units, Finding, FindingKind, PassKind, PassSummary, RunMode, UnitOutcome, UnitReport};
use crate::Result;

/// Reconcile demographics and exam locations of every patient.
pub fn reconcile_pass(
    db: &Database,
    feed: &dyn ExternalFeed,
    config: &PipelineConfig,
    mode: RunMode,
) -> Result<PassSummary> {
    let normalizer = config.normalizer();
    let index = FeedIndex::build(feed, &normalizer);
    let reconciler = config.reconciler();
    let locations = config.location_resolver();
    let today = Utc::now().date_naive();

    let patient_ids: Vec<String> = db.list_patients()?.into_iter().map(|p| p.id).collect();
    let mut summary = PassSummary::new(PassKind::Reconcile, mode);

    run_units(db, &mut summary, config.batch_size, &patient_ids, Clone::clone, |db, id| {
        let Some(patient) = db.get_patient(id)? else {
            return Ok(UnitReport::unchanged());
        };
        let exams = db.list_exams_for_patient(id)?;
        let visits = visits_for(&index, &normalizer.normalize(&patient.name), &exams);

        let mut report = UnitReport::unchanged();
        let mut would_write = false;

        // Demographics
        let mut updated: Option<Patient> = None;
        if !visits.is_empty() {
            let incoming = match aggregate_visits(&visits, today) {
                Ok(fields) => fields,
                Err(reason) => return Ok(UnitReport::ambiguous(id.clone(), reason)),
            };
            let result = reconciler.reconcile(&patient, &incoming, IncomingSource::ExternalFeed);
            for field in result.notable() {
                let kind = match field.resolution {
                    Resolution::Unverifiable => FindingKind::Unverifiable,
                    Resolution::Discrepancy => FindingKind::Discrepancy,
                    _ => FindingKind::Applied,
                };
                let detail = format!(
                    "{} {:?}: {} -> {}",
                    field.field,
                    field.resolution,
                    field.before.as_deref().unwrap_or("-"),
                    field.after.as_deref().unwrap_or("-"),
                );
                report.push(Finding::new(kind, id.clone(), detail));
                would_write |= field.resolution == Resolution::Discrepancy && patient.manually_verified;
            }
            if result.changed() {
                updated = Some(result.patient);
            }
        }

        // Locations
        let mut relocations = Vec::new();
        for exam in &exams {
            let clinic = exam
                .external_id
                .as_deref()
                .and_then(|ext| feed.visit(ext))
                .and_then(|v| v.clinic_name.as_deref());
            match locations.resolve(exam.location.as_deref().unwrap_or(""), clinic) {
                LocationOutcome::Unchanged => {}
                LocationOutcome::Resolved(name) => {
                    let detail = format!(
                        "location {} -> {}",
                        exam.location.as_deref().unwrap_or("-"),
                        name
                    );
                    let kind = if patient.manually_verified {
                        FindingKind::Discrepancy
                    } else {
                        FindingKind::Applied
                    };
                    report.push(Finding::new(kind, exam.id.clone(), detail));
                    relocations.push((exam.id.clone(), name));
                }
                LocationOutcome::Unresolvable(reason) => {
                    report.push(Finding::new(FindingKind::Unresolved, exam.id.clone(), reason));
                }
            }
        }

        if patient.manually_verified {
            if would_write || !relocations.is_empty() {
                report.outcome = UnitOutcome::SkippedLocked;
                report.push(Finding::new(
                    FindingKind::Locked,
                    id.clone(),
                    "manually verified; differences reported only",
                ));
            }
            return Ok(report);
        }

        if updated.is_none() && relocations.is_empty() {
            return Ok(report);
        }

        report.outcome = UnitOutcome::Applied;
        if mode.is_execute() {
            if let Some(patient) = &updated {
                db.update_patient(patient)?;
            }
            for (exam_id, location) in &relocations {
                db.update_exam_location(exam_id, location)?;
            }
        }
        Ok(report)
    })?;

    Ok(summary)
}

/// Feed visits describing this patient.
///
/// Exams linked by external id win; the name key is the fallback.
fn visits_for<'f>(index: &FeedIndex<'f>, name_key: &str, exams: &[Exam]) -> Vec<&'f FeedVisit> {
    let feed = index.feed();
    let linked: Vec<&'f FeedVisit> = exams
        .iter()
        .filter_map(|e| e.external_id.as_deref())
        .filter_map(|ext| feed.visit(ext))
        .collect();
    if !linked.is_empty() {
        return linked;
    }

    index
        .by_name_key(name_key)
        .iter()
        .filter_map(|id| feed.visit(id))
        .collect()
}
