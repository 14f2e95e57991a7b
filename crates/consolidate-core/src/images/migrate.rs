//! Image id migration and derived-image pruning passes.

use std::collections::{HashMap, HashSet};

use super::ids::{is_legacy_id, stable_image_id};
use super::resolver::resolve_image_reference;
use crate::config::PipelineConfig;
use crate::db::Database;
use crate::models::{MedicalReport, SelectedImages};
use crate::pipeline::{
    run_units, Finding, FindingKind, PassKind, PassSummary, RunMode, UnitOutcome, UnitReport,
};
use crate::Result;

/// Reason stored in the audit trail for migrated pointers.
pub const MIGRATION_REASON: &str = "legacy image id migration";

/// Give every legacy image its stable id and rewrite report pointers.
///
/// One unit per exam. Image URLs are never changed.
pub fn migrate_pass(db: &Database, config: &PipelineConfig, mode: RunMode) -> Result<PassSummary> {
    let exam_ids: Vec<String> = db.list_exams()?.into_iter().map(|e| e.id).collect();
    let mut summary = PassSummary::new(PassKind::MigrateImages, mode);

    run_units(db, &mut summary, config.batch_size, &exam_ids, Clone::clone, |db, exam_id| {
        migrate_exam(db, exam_id, &config.actor, mode)
    })?;

    Ok(summary)
}

fn migrate_exam(db: &Database, exam_id: &str, actor: &str, mode: RunMode) -> Result<UnitReport> {
    let Some(exam) = db.get_exam(exam_id)? else {
        return Ok(UnitReport::unchanged());
    };
    let images = db.list_images_for_exam(&exam.id)?;
    let mut report = UnitReport::unchanged();

    // Plan: legacy id -> stable id, and legacy rows whose stable id is
    // already stored in this exam.
    let mut renames: Vec<(String, String)> = Vec::new();
    let mut duplicates: Vec<(String, String)> = Vec::new();
    let mut taken: HashSet<String> = images
        .iter()
        .filter(|img| !is_legacy_id(&img.id))
        .map(|img| img.id.clone())
        .collect();

    for image in images.iter().filter(|img| is_legacy_id(&img.id)) {
        let Some(stable) = stable_image_id(&image.url) else {
            report.push(Finding::new(
                FindingKind::Skipped,
                image.id.clone(),
                format!("no stable id in URL {}", image.url),
            ));
            continue;
        };
        if taken.contains(&stable) {
            duplicates.push((image.id.clone(), stable));
        } else if let Some(owner) = db.get_image(&stable)? {
            report.push(Finding::new(
                FindingKind::Skipped,
                image.id.clone(),
                format!("{stable} already belongs to exam {}", owner.exam_id),
            ));
        } else {
            taken.insert(stable.clone());
            renames.push((image.id.clone(), stable));
        }
    }

    let target: HashMap<&str, &str> = renames
        .iter()
        .chain(duplicates.iter())
        .map(|(old, new)| (old.as_str(), new.as_str()))
        .collect();

    // Pointers are resolved against the images as they are now, before
    // any row is renamed or deleted.
    let mut rewrite: Option<(MedicalReport, SelectedImages)> = None;
    if let Some(medical) = db.get_report_for_exam(&exam.id)? {
        let mut selected = medical.selected_images.clone();
        for (eye, pointer) in medical.selected_images.pointers() {
            match resolve_image_reference(pointer, &exam, &images) {
                Ok(image) => {
                    let resolved = target.get(image.id.as_str()).copied().unwrap_or(image.id.as_str());
                    if resolved != pointer {
                        report.push(Finding::new(
                            FindingKind::Applied,
                            medical.id.clone(),
                            format!("{} pointer {pointer} -> {resolved}", eye.as_str()),
                        ));
                        selected.set(eye, resolved.to_string());
                    }
                }
                Err(reason) => report.push(Finding::new(
                    FindingKind::Unresolved,
                    medical.id.clone(),
                    format!("{} pointer {pointer}: {reason}", eye.as_str()),
                )),
            }
        }
        if selected != medical.selected_images {
            rewrite = Some((medical, selected));
        }
    }

    for (old, new) in &renames {
        report.push(Finding::new(FindingKind::Applied, old.clone(), format!("renamed to {new}")));
    }
    for (old, new) in &duplicates {
        report.push(Finding::new(FindingKind::Applied, old.clone(), format!("duplicate of {new} removed")));
    }

    if rewrite.is_none() && renames.is_empty() && duplicates.is_empty() {
        return Ok(report);
    }
    report.outcome = UnitOutcome::Applied;

    if mode.is_execute() {
        if let Some((medical, selected)) = &rewrite {
            db.rewrite_selected_images(medical, selected, MIGRATION_REASON, actor)?;
        }
        for (old, _) in &duplicates {
            db.delete_image(old)?;
        }
        for (old, new) in &renames {
            db.rename_image(old, new)?;
        }
    }
    Ok(report)
}

/// Delete red-free images no report selects.
pub fn prune_pass(db: &Database, config: &PipelineConfig, mode: RunMode) -> Result<PassSummary> {
    let image_ids: Vec<String> = db
        .list_images()?
        .into_iter()
        .filter(|img| img.image_type.is_derived())
        .map(|img| img.id)
        .collect();
    let mut summary = PassSummary::new(PassKind::PruneDerived, mode);

    run_units(db, &mut summary, config.batch_size, &image_ids, Clone::clone, |db, image_id| {
        let Some(image) = db.get_image(image_id)? else {
            return Ok(UnitReport::unchanged());
        };
        if let Some(medical) = db.get_report_for_exam(&image.exam_id)? {
            if medical.selected_images.references(&image.id) {
                return Ok(UnitReport::unchanged().with(Finding::new(
                    FindingKind::Skipped,
                    image.id.clone(),
                    format!("selected by report {}", medical.id),
                )));
            }
        }
        if mode.is_execute() {
            db.delete_image(&image.id)?;
        }
        Ok(UnitReport::applied().with(Finding::new(
            FindingKind::Applied,
            image.id.clone(),
            format!("red-free image of exam {} removed", image.exam_id),
        )))
    })?;

    Ok(summary)
}
