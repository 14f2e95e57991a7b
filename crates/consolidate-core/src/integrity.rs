//! Integrity auditor.
//!
//! Read-only. Each category lists the records that need attention; a
//! report with every category empty is clean and lets a migration go on.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::config::PipelineConfig;
use crate::db::{ChainStatus, Database, DbResult};
use crate::identity::basic_key;
use crate::images::{owner_name_from_url, resolve_image_reference};
use crate::models::ExamImage;

/// Image stored under another person's folder.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MisplacedImage {
    pub image_id: String,
    pub exam_id: String,
    pub patient_name: String,
    pub owner_name: String,
}

/// Report pointer with no image behind it in its own exam.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UnresolvedPointer {
    pub report_id: String,
    pub exam_id: String,
    pub eye: String,
    pub pointer: String,
    pub reason: String,
}

/// National id carried by several patients.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DuplicateCpf {
    pub cpf: String,
    pub patient_ids: Vec<String>,
}

/// Findings of one audit run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub misplaced_images: Vec<MisplacedImage>,
    pub unresolved_pointers: Vec<UnresolvedPointer>,
    pub duplicate_cpfs: Vec<DuplicateCpf>,
    pub short_patient_ids: Vec<String>,
    pub derived_images: Vec<String>,
    pub empty_exams: Vec<String>,
    /// Sequence number of the first audit-trail entry that fails to verify
    pub broken_audit_chain: Option<i64>,
}

impl AuditReport {
    /// Count per category, in display order.
    pub fn counts(&self) -> [(&'static str, usize); 7] {
        [
            ("misplaced images", self.misplaced_images.len()),
            ("unresolved pointers", self.unresolved_pointers.len()),
            ("duplicate national ids", self.duplicate_cpfs.len()),
            ("short patient ids", self.short_patient_ids.len()),
            ("derived images", self.derived_images.len()),
            ("exams without images", self.empty_exams.len()),
            ("broken audit chain", usize::from(self.broken_audit_chain.is_some())),
        ]
    }

    pub fn is_clean(&self) -> bool {
        self.counts().iter().all(|(_, n)| *n == 0)
    }
}

impl fmt::Display for AuditReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[audit] {}", if self.is_clean() { "clean" } else { "defects found" })?;
        for (label, count) in self.counts() {
            writeln!(f, "  {label:<22}{count:>6}")?;
        }
        for m in &self.misplaced_images {
            writeln!(
                f,
                "  - misplaced    {} (exam {}): folder of '{}', patient '{}'",
                m.image_id, m.exam_id, m.owner_name, m.patient_name
            )?;
        }
        for p in &self.unresolved_pointers {
            writeln!(f, "  - unresolved   report {} {} {}: {}", p.report_id, p.eye, p.pointer, p.reason)?;
        }
        for d in &self.duplicate_cpfs {
            writeln!(f, "  - cpf          {} shared by {}", d.cpf, d.patient_ids.join(", "))?;
        }
        for id in &self.short_patient_ids {
            writeln!(f, "  - short id     {id}")?;
        }
        for id in &self.derived_images {
            writeln!(f, "  - derived      {id}")?;
        }
        for id in &self.empty_exams {
            writeln!(f, "  - empty exam   {id}")?;
        }
        if let Some(seq) = self.broken_audit_chain {
            writeln!(f, "  - audit trail  fails to verify at entry {seq}")?;
        }
        Ok(())
    }
}

/// Runs every integrity check against the store.
pub struct IntegrityAuditor<'a> {
    db: &'a Database,
    min_patient_id_len: usize,
}

impl<'a> IntegrityAuditor<'a> {
    pub fn new(db: &'a Database, config: &PipelineConfig) -> Self {
        Self {
            db,
            min_patient_id_len: config.min_patient_id_len,
        }
    }

    pub fn run(&self) -> DbResult<AuditReport> {
        let patients = self.db.list_patients()?;
        let exams = self.db.list_exams()?;
        let images = self.db.list_images()?;

        let patient_names: HashMap<&str, &str> =
            patients.iter().map(|p| (p.id.as_str(), p.name.as_str())).collect();
        let mut images_by_exam: HashMap<&str, Vec<&ExamImage>> = HashMap::new();
        for image in &images {
            images_by_exam.entry(image.exam_id.as_str()).or_default().push(image);
        }

        let mut report = AuditReport::default();

        // Misplaced, empty
        for exam in &exams {
            let exam_images = images_by_exam.get(exam.id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            if exam_images.is_empty() {
                report.empty_exams.push(exam.id.clone());
            }
            let Some(patient_name) = patient_names.get(exam.patient_id.as_str()) else {
                continue;
            };
            for image in exam_images {
                let Some(owner) = owner_name_from_url(&image.url) else {
                    continue;
                };
                if basic_key(&owner) != basic_key(patient_name) {
                    report.misplaced_images.push(MisplacedImage {
                        image_id: image.id.clone(),
                        exam_id: exam.id.clone(),
                        patient_name: patient_name.to_string(),
                        owner_name: owner,
                    });
                }
            }
        }

        // Pointers
        let exams_by_id: HashMap<&str, _> = exams.iter().map(|e| (e.id.as_str(), e)).collect();
        for medical in self.db.list_reports()? {
            let Some(exam) = exams_by_id.get(medical.exam_id.as_str()) else {
                continue;
            };
            let exam_images: Vec<ExamImage> = images_by_exam
                .get(exam.id.as_str())
                .map(|imgs| imgs.iter().map(|img| (*img).clone()).collect())
                .unwrap_or_default();
            for (eye, pointer) in medical.selected_images.pointers() {
                if let Err(reason) = resolve_image_reference(pointer, exam, &exam_images) {
                    report.unresolved_pointers.push(UnresolvedPointer {
                        report_id: medical.id.clone(),
                        exam_id: exam.id.clone(),
                        eye: eye.as_str().to_string(),
                        pointer: pointer.to_string(),
                        reason: reason.to_string(),
                    });
                }
            }
        }

        report.duplicate_cpfs = self
            .db
            .list_patients_with_shared_cpf()?
            .into_iter()
            .map(|(cpf, patient_ids)| DuplicateCpf { cpf, patient_ids })
            .collect();

        report.short_patient_ids = patients
            .iter()
            .filter(|p| p.id.chars().count() < self.min_patient_id_len)
            .map(|p| p.id.clone())
            .collect();

        report.derived_images = images
            .iter()
            .filter(|img| img.image_type.is_derived())
            .map(|img| img.id.clone())
            .collect();

        if let ChainStatus::Broken { at_seq } = self.db.verify_audit_chain()? {
            report.broken_audit_chain = Some(at_seq);
        }

        tracing::info!(
            clean = report.is_clean(),
            misplaced = report.misplaced_images.len(),
            unresolved = report.unresolved_pointers.len(),
            duplicate_cpfs = report.duplicate_cpfs.len(),
            short_ids = report.short_patient_ids.len(),
            derived = report.derived_images.len(),
            empty_exams = report.empty_exams.len(),
            "audit finished"
        );
        Ok(report)
    }
}
