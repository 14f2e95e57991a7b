//! Record merger: plan and apply the merge of one equivalence class.

use std::collections::{BTreeSet, HashMap};

use crate::db::Database;
use crate::identity::EquivalenceClass;
use crate::models::{Exam, MedicalReport, Patient, SelectedImages};
use crate::pipeline::{Finding, FindingKind};
use crate::reconcile::{
    normalize_cpf, FieldReconciler, FieldReport, IncomingSource, PatientFields, Resolution, SourcePriority,
    UnverifiedPolicy,
};
use crate::{ConsolidateError, Result};

/// Reason stored in the audit trail when a pointer follows a removed
/// duplicate image to the surviving copy.
pub const MERGE_REASON: &str = "duplicate image removed during merge";

/// A duplicate exam (same external visit id) folded into the kept one.
#[derive(Debug, Clone)]
pub struct FoldedExam {
    pub duplicate: String,
    pub into: String,
    /// Report moved onto the kept exam, which had none
    pub report: Option<MedicalReport>,
    /// Referral id moved onto the kept exam, which had none
    pub referral: Option<String>,
    pub moved_images: Vec<String>,
    /// (removed image, surviving image with the same URL)
    pub dropped_images: Vec<(String, String)>,
    /// Report as it will be before the rewrite, and its new pointers
    pub pointer_rewrite: Option<(MedicalReport, SelectedImages)>,
}

#[derive(Debug, Clone)]
pub enum ExamAction {
    /// Exam changes owner, nothing else.
    Reparent { exam_id: String },
    Fold(FoldedExam),
}

/// Everything one class merge will write.
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub key: String,
    /// Kept record with reconciled fields
    pub canonical: Patient,
    pub fields_changed: bool,
    pub fields: Vec<FieldReport>,
    pub exams: Vec<ExamAction>,
    /// Patient ids deleted once their exams have moved
    pub removed: Vec<String>,
}

impl MergePlan {
    /// Operator-facing description of the plan.
    pub fn findings(&self) -> Vec<Finding> {
        let subject = &self.canonical.id;
        let mut out = vec![Finding::new(
            FindingKind::Applied,
            subject.clone(),
            format!(
                "merge {} record(s) of '{}' into {}",
                self.removed.len(),
                self.key,
                self.canonical.id
            ),
        )];

        for field in &self.fields {
            let kind = match field.resolution {
                Resolution::Discrepancy => FindingKind::Discrepancy,
                _ => FindingKind::Applied,
            };
            out.push(Finding::new(
                kind,
                subject.clone(),
                format!(
                    "{} {:?}: {} -> {}",
                    field.field,
                    field.resolution,
                    field.before.as_deref().unwrap_or("-"),
                    field.after.as_deref().unwrap_or("-"),
                ),
            ));
        }

        for action in &self.exams {
            let (exam, detail) = match action {
                ExamAction::Reparent { exam_id } => (exam_id.clone(), "re-parented".to_string()),
                ExamAction::Fold(fold) => (
                    fold.duplicate.clone(),
                    format!(
                        "folded into {} (report moved: {}, images moved: {}, duplicate images removed: {})",
                        fold.into,
                        fold.report.is_some(),
                        fold.moved_images.len(),
                        fold.dropped_images.len()
                    ),
                ),
            };
            out.push(Finding::new(FindingKind::Applied, exam, detail));
        }
        out
    }
}

/// Why a class was not merged, or that it needs nothing.
#[derive(Debug, Clone)]
pub enum MergeDecision {
    Merge(MergePlan),
    Ambiguous(String),
    Locked(String),
    /// Fewer than two members are still stored.
    NothingToDo,
}

/// What the kept exam will look like as folds are planned.
struct FoldTarget {
    /// URL -> image id
    urls: HashMap<String, String>,
    report: Option<MedicalReport>,
    has_referral: bool,
}

impl FoldTarget {
    fn load(db: &Database, exam_id: &str) -> Result<Self> {
        let urls = db
            .list_images_for_exam(exam_id)?
            .into_iter()
            .map(|img| (img.url, img.id))
            .collect();
        Ok(Self {
            urls,
            report: db.get_report_for_exam(exam_id)?,
            has_referral: db.get_referral_for_exam(exam_id)?.is_some(),
        })
    }
}

/// Merges duplicate patient records.
#[derive(Debug, Clone)]
pub struct RecordMerger {
    reconciler: FieldReconciler,
    actor: String,
}

impl RecordMerger {
    /// The kept record wins field conflicts; a duplicate only fills gaps.
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            reconciler: FieldReconciler::new(SourcePriority::Existing, UnverifiedPolicy::Keep),
            actor: actor.into(),
        }
    }

    /// Compute the merge of `class` without writing.
    pub fn plan(&self, db: &Database, class: &EquivalenceClass) -> Result<MergeDecision> {
        let mut members = Vec::with_capacity(class.members.len());
        for id in &class.members {
            if let Some(patient) = db.get_patient(id)? {
                members.push(patient);
            }
        }
        if members.len() < 2 {
            return Ok(MergeDecision::NothingToDo);
        }

        let locked = members.iter().filter(|p| p.manually_verified).count();
        if locked > 1 {
            return Ok(MergeDecision::Locked(format!("{locked} manually verified records")));
        }

        let cpfs: BTreeSet<String> = members
            .iter()
            .filter_map(|p| p.cpf.as_deref().and_then(normalize_cpf))
            .collect();
        if cpfs.len() > 1 {
            return Ok(MergeDecision::Ambiguous(format!("{} different national ids", cpfs.len())));
        }

        // Locked record first, then most exams, oldest, smallest id.
        let mut ranked = Vec::with_capacity(members.len());
        for patient in members {
            let exams = db.count_exams_for_patient(&patient.id)?;
            ranked.push((patient, exams));
        }
        ranked.sort_by(|(a, a_exams), (b, b_exams)| {
            b.manually_verified
                .cmp(&a.manually_verified)
                .then(b_exams.cmp(a_exams))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        let mut ranked = ranked.into_iter().map(|(p, _)| p);
        let Some(canonical) = ranked.next() else {
            return Ok(MergeDecision::NothingToDo);
        };
        let removed: Vec<Patient> = ranked.collect();

        // Fields
        let mut merged = canonical.clone();
        let mut fields = Vec::new();
        for other in &removed {
            let result = self
                .reconciler
                .reconcile(&merged, &PatientFields::from(other), IncomingSource::DuplicateRecord);
            fields.extend(result.notable().cloned());
            merged = result.patient;
        }
        let fields_changed = merged != canonical;

        // A locked record takes no values, so deleting a duplicate that
        // carries values it lacks would lose them.
        if canonical.manually_verified {
            let dropped: BTreeSet<&str> = fields
                .iter()
                .filter(|f| f.resolution == Resolution::Discrepancy)
                .map(|f| f.field.as_str())
                .collect();
            if !dropped.is_empty() {
                return Ok(MergeDecision::Locked(format!(
                    "manually verified record {} lacks {} carried by a duplicate; review manually",
                    canonical.id,
                    dropped.into_iter().collect::<Vec<_>>().join(", ")
                )));
            }
        }

        // Exams
        let mut kept_by_visit: HashMap<String, String> = db
            .list_exams_for_patient(&canonical.id)?
            .into_iter()
            .filter_map(|e| e.external_id.map(|ext| (ext, e.id)))
            .collect();
        let mut targets: HashMap<String, FoldTarget> = HashMap::new();
        let mut exams = Vec::new();

        for other in &removed {
            for exam in db.list_exams_for_patient(&other.id)? {
                let into = exam
                    .external_id
                    .as_ref()
                    .and_then(|ext| kept_by_visit.get(ext))
                    .cloned();
                let Some(into) = into else {
                    if let Some(ext) = &exam.external_id {
                        kept_by_visit.insert(ext.clone(), exam.id.clone());
                    }
                    exams.push(ExamAction::Reparent { exam_id: exam.id });
                    continue;
                };

                if !targets.contains_key(&into) {
                    targets.insert(into.clone(), FoldTarget::load(db, &into)?);
                }
                let Some(target) = targets.get_mut(&into) else {
                    continue;
                };
                match fold_exam(db, &exam, &into, target)? {
                    Ok(fold) => exams.push(ExamAction::Fold(fold)),
                    Err(reason) => return Ok(MergeDecision::Ambiguous(reason)),
                }
            }
        }

        Ok(MergeDecision::Merge(MergePlan {
            key: class.key.clone(),
            removed: removed.into_iter().map(|p| p.id).collect(),
            canonical: merged,
            fields_changed,
            fields,
            exams,
        }))
    }

    /// Write a plan. Run inside the class's savepoint.
    ///
    /// Pointers are rewritten before the images they name are deleted, and
    /// exams are re-parented before their former owner is deleted.
    pub fn apply(&self, db: &Database, plan: &MergePlan) -> Result<()> {
        if plan.fields_changed {
            db.update_patient(&plan.canonical)?;
        }

        for action in &plan.exams {
            match action {
                ExamAction::Reparent { exam_id } => {
                    db.reparent_exam(exam_id, &plan.canonical.id)?;
                }
                ExamAction::Fold(fold) => {
                    if let Some(report) = &fold.report {
                        db.move_report(&report.id, &fold.into)?;
                    }
                    if let Some(referral_id) = &fold.referral {
                        db.move_referral(referral_id, &fold.into)?;
                    }
                    if let Some((report, selected)) = &fold.pointer_rewrite {
                        db.rewrite_selected_images(report, selected, MERGE_REASON, &self.actor)?;
                    }
                    for image_id in &fold.moved_images {
                        db.move_image(image_id, &fold.into)?;
                    }
                    for (image_id, _) in &fold.dropped_images {
                        db.delete_image(image_id)?;
                    }
                    if !db.delete_exam(&fold.duplicate)? {
                        return Err(ConsolidateError::Conflict(format!(
                            "exam {} disappeared during merge",
                            fold.duplicate
                        )));
                    }
                }
            }
        }

        for patient_id in &plan.removed {
            if !db.delete_patient(patient_id)? {
                return Err(ConsolidateError::Conflict(format!(
                    "patient {patient_id} disappeared during merge"
                )));
            }
        }

        tracing::debug!(
            canonical = %plan.canonical.id,
            removed = plan.removed.len(),
            exams = plan.exams.len(),
            "class merged"
        );
        Ok(())
    }
}

/// Plan folding `exam` into the kept exam `into`.
///
/// The inner error is the reason the class must stay unmerged.
fn fold_exam(
    db: &Database,
    exam: &Exam,
    into: &str,
    target: &mut FoldTarget,
) -> Result<std::result::Result<FoldedExam, String>> {
    let report = db.get_report_for_exam(&exam.id)?;
    if report.is_some() && target.report.is_some() {
        return Ok(Err(format!("exams {} and {into} both have a report", exam.id)));
    }
    let referral = db.get_referral_for_exam(&exam.id)?;
    if referral.is_some() && target.has_referral {
        return Ok(Err(format!("exams {} and {into} both have a referral", exam.id)));
    }

    let mut moved_images = Vec::new();
    let mut dropped_images = Vec::new();
    for image in db.list_images_for_exam(&exam.id)? {
        match target.urls.get(&image.url) {
            Some(survivor) => dropped_images.push((image.id, survivor.clone())),
            None => {
                target.urls.insert(image.url, image.id.clone());
                moved_images.push(image.id);
            }
        }
    }

    if let Some(moved) = &report {
        target.report = Some(moved.clone());
    }
    target.has_referral |= referral.is_some();

    // Whichever report ends up on the kept exam must not name a removed image.
    let mut pointer_rewrite = None;
    if let Some(current) = target.report.as_mut() {
        let mut selected = current.selected_images.clone();
        for (eye, pointer) in current.selected_images.pointers() {
            if let Some((_, survivor)) = dropped_images.iter().find(|(dropped, _)| dropped == pointer) {
                selected.set(eye, survivor.clone());
            }
        }
        if selected != current.selected_images {
            pointer_rewrite = Some((current.clone(), selected.clone()));
            current.selected_images = selected;
        }
    }

    Ok(Ok(FoldedExam {
        duplicate: exam.id.clone(),
        into: into.to_string(),
        report,
        referral: referral.map(|r| r.id),
        moved_images,
        dropped_images,
        pointer_rewrite,
    }))
}
