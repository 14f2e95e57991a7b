//! Undo selected-image pointer changes recorded in the audit trail.
//!
//! A revert is itself a pointer change: it goes through the same audited
//! rewrite, so the trail only ever grows.

use std::collections::BTreeMap;

use super::resolver::resolve_image_reference;
use crate::config::PipelineConfig;
use crate::db::{Database, HistoryEntry};
use crate::models::SelectedImages;
use crate::pipeline::{run_units, Finding, FindingKind, PassKind, PassSummary, RunMode, UnitReport};
use crate::Result;

/// Reason prefix stored in the audit trail for reverted pointers.
pub const REVERT_REASON: &str = "revert of audit entries";

/// Which recorded changes to undo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertSelection {
    /// Every change recorded for one report.
    Report(String),
    /// Every change with a sequence number at or after this one.
    Since(i64),
}

/// Restore each selected report to its pointers before the selected changes.
///
/// One unit per report. A report whose pointers no longer match the last
/// selected entry was changed outside the trail and is left alone.
pub fn revert_pass(
    db: &Database,
    config: &PipelineConfig,
    selection: &RevertSelection,
    mode: RunMode,
) -> Result<PassSummary> {
    let entries = match selection {
        RevertSelection::Report(report_id) => db.list_selected_images_history(report_id)?,
        RevertSelection::Since(seq) => db.list_selected_images_history_since(*seq)?,
    };

    let mut by_report: BTreeMap<String, Vec<HistoryEntry>> = BTreeMap::new();
    for entry in entries {
        by_report.entry(entry.change.report_id.clone()).or_default().push(entry);
    }
    let units: Vec<(String, Vec<HistoryEntry>)> = by_report.into_iter().collect();
    let mut summary = PassSummary::new(PassKind::RevertPointers, mode);

    run_units(
        db,
        &mut summary,
        config.batch_size,
        &units,
        |(report_id, _)| report_id.clone(),
        |db, (report_id, entries)| revert_report(db, report_id, entries, &config.actor, mode),
    )?;

    Ok(summary)
}

fn revert_report(
    db: &Database,
    report_id: &str,
    entries: &[HistoryEntry],
    actor: &str,
    mode: RunMode,
) -> Result<UnitReport> {
    let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
        return Ok(UnitReport::unchanged());
    };
    let Some(medical) = db.get_report(report_id)? else {
        return Ok(UnitReport::ambiguous(report_id, "report no longer exists"));
    };
    if medical.selected_images != last.change.new {
        return Ok(UnitReport::ambiguous(
            report_id,
            format!("pointers changed after audit entry {}", last.seq),
        ));
    }

    let target = &first.change.previous;
    if *target == medical.selected_images {
        return Ok(UnitReport::unchanged());
    }

    // Restored pointers must still name an image of the report's exam.
    let Some(exam) = db.get_exam(&medical.exam_id)? else {
        return Ok(UnitReport::ambiguous(report_id, format!("exam {} no longer exists", medical.exam_id)));
    };
    let images = db.list_images_for_exam(&exam.id)?;
    for (eye, pointer) in target.pointers() {
        if let Err(reason) = resolve_image_reference(pointer, &exam, &images) {
            return Ok(UnitReport::ambiguous(
                report_id,
                format!("restored {} pointer {pointer} would not resolve: {reason}", eye.as_str()),
            ));
        }
    }

    let report = UnitReport::applied().with(Finding::new(
        FindingKind::Applied,
        report_id,
        format!("pointers {} -> {}", describe(&medical.selected_images), describe(target)),
    ));
    if mode.is_execute() {
        let reason = if first.seq == last.seq {
            format!("{REVERT_REASON} {}", first.seq)
        } else {
            format!("{REVERT_REASON} {}..{}", first.seq, last.seq)
        };
        db.rewrite_selected_images(&medical, target, &reason, actor)?;
    }
    Ok(report)
}

fn describe(selected: &SelectedImages) -> String {
    format!(
        "od={} oe={}",
        selected.od.as_deref().unwrap_or("-"),
        selected.oe.as_deref().unwrap_or("-")
    )
}
