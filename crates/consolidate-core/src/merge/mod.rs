//! Record merger.
//!
//! Every duplicate equivalence class from the identity matcher is reduced
//! to one canonical patient. One class is one unit of work: its plan is
//! computed read-only, then applied inside the class's savepoint.

mod merger;

use crate::config::PipelineConfig;
use crate::db::Database;
use crate::identity::{ClassKind, EquivalenceClass, NearMatchReason};
use crate::pipeline::{run_units, Finding, FindingKind, PassKind, PassSummary, RunMode, UnitReport};
use crate::Result;

pub use merger::{ExamAction, FoldedExam, MergeDecision, MergePlan, RecordMerger, MERGE_REASON};

/// Group every patient and merge each duplicate class.
pub fn merge_pass(db: &Database, config: &PipelineConfig, mode: RunMode) -> Result<PassSummary> {
    let patients = db.list_patients()?;
    let report = config.matcher().group(&patients);
    let merger = RecordMerger::new(config.actor.clone());
    let mut summary = PassSummary::new(PassKind::Merge, mode);

    for near in &report.near_matches {
        let reason = match near.reason {
            NearMatchReason::TokenContainment => "token containment",
            NearMatchReason::Similarity => "similarity",
        };
        summary.note(Finding::new(
            FindingKind::NearMatch,
            format!("{} ~ {}", near.left_key, near.right_key),
            format!("{reason} {:.3}; review manually", near.similarity),
        ));
    }

    let classes: Vec<EquivalenceClass> = report
        .classes
        .into_iter()
        .filter(|c| c.kind != ClassKind::Singleton)
        .collect();

    run_units(db, &mut summary, config.batch_size, &classes, class_label, |db, class| {
        if let ClassKind::Ambiguous { reason } = &class.kind {
            return Ok(UnitReport::ambiguous(class_label(class), reason.clone()));
        }

        match merger.plan(db, class)? {
            MergeDecision::NothingToDo => Ok(UnitReport::unchanged()),
            MergeDecision::Ambiguous(reason) => Ok(UnitReport::ambiguous(class_label(class), reason)),
            MergeDecision::Locked(reason) => Ok(UnitReport::locked(class_label(class), reason)),
            MergeDecision::Merge(plan) => {
                if mode.is_execute() {
                    merger.apply(db, &plan)?;
                }
                let mut unit = UnitReport::applied();
                for finding in plan.findings() {
                    unit.push(finding);
                }
                Ok(unit)
            }
        }
    })?;

    Ok(summary)
}

fn class_label(class: &EquivalenceClass) -> String {
    match class.birth_date {
        Some(date) => format!("{} ({date})", class.key),
        None => class.key.clone(),
    }
}
