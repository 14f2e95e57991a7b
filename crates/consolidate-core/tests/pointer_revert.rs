//! Reverting audited selected-image changes.

mod common;

use consolidate_core::db::ChainStatus;
use consolidate_core::images::{RevertSelection, REVERT_REASON};
use consolidate_core::pipeline::FindingKind;
use consolidate_core::{Pipeline, PipelineConfig, RunMode, SelectedImages};

use common::{db, exam, image, patient, report, uuid};

const VISIT: &str = "697001ce4e429636ed944c10";

fn legacy(n: usize) -> String {
    format!("{VISIT}-{n}")
}

fn stable(n: usize) -> String {
    format!("img-{}.jpg", uuid(n))
}

#[test]
fn test_revert_restores_pointers_and_is_audited() {
    let db = db();
    let p = patient(&db, "Luzia Ferreira", None);
    let e = exam(&db, &p, Some(VISIT));
    image(&db, &e, &stable(0), 0);
    image(&db, &e, &stable(1), 1);
    let r = report(&db, &e, Some(&stable(0)), Some(&stable(1)));

    // A wrong rewrite: both eyes swapped.
    let swapped = SelectedImages {
        od: Some(stable(1)),
        oe: Some(stable(0)),
    };
    db.rewrite_selected_images(&r, &swapped, "manual fix", "ops@clinic").unwrap();

    let pipeline = Pipeline::new(&db, PipelineConfig::default());
    let selection = RevertSelection::Report(r.id.clone());

    let preview = pipeline.revert_pointers(&selection, RunMode::Preview).unwrap();
    assert_eq!(preview.applied, 1);
    assert_eq!(db.get_report(&r.id).unwrap().unwrap().selected_images, swapped);

    let summary = pipeline.revert_pointers(&selection, RunMode::Execute).unwrap();
    assert_eq!(summary.applied, 1);
    assert_eq!(db.get_report(&r.id).unwrap().unwrap().selected_images, r.selected_images);

    let history = db.list_selected_images_history(&r.id).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].change.previous, swapped);
    assert_eq!(history[1].change.reason, format!("{REVERT_REASON} {}", history[0].seq));
    assert_eq!(db.verify_audit_chain().unwrap(), ChainStatus::Intact { entries: 2 });
}

#[test]
fn test_revert_since_undoes_a_migration_run() {
    let db = db();
    let p = patient(&db, "Luzia Ferreira", None);
    let mut reports = Vec::new();
    for visit in 0..2 {
        let e = exam(&db, &p, Some(&format!("{visit:024x}")));
        image(&db, &e, &format!("{visit:024x}-0"), visit);
        reports.push(report(&db, &e, Some(&format!("{visit:024x}-0")), None));
    }
    let pipeline = Pipeline::new(&db, PipelineConfig::default());
    pipeline.migrate_images(RunMode::Execute).unwrap();

    let summary = pipeline
        .revert_pointers(&RevertSelection::Since(1), RunMode::Execute)
        .unwrap();
    assert_eq!(summary.applied, 2);
    for r in &reports {
        let stored = db.get_report(&r.id).unwrap().unwrap();
        assert_eq!(stored.selected_images, r.selected_images);
    }

    // Restored legacy pointers still resolve, so migration can run again.
    let again = pipeline.migrate_images(RunMode::Execute).unwrap();
    assert_eq!(again.applied, 2);
    assert_eq!(again.unresolved, 0);
    assert_eq!(db.verify_audit_chain().unwrap(), ChainStatus::Intact { entries: 6 });
}

#[test]
fn test_revert_skips_report_changed_outside_the_trail() {
    let db = db();
    let p = patient(&db, "Luzia Ferreira", None);
    let e = exam(&db, &p, Some(VISIT));
    image(&db, &e, &stable(0), 0);
    image(&db, &e, &stable(1), 1);
    let r = report(&db, &e, Some(&stable(0)), None);
    let moved = SelectedImages {
        od: Some(stable(1)),
        oe: None,
    };
    db.rewrite_selected_images(&r, &moved, "manual fix", "ops@clinic").unwrap();
    db.update_selected_images(&r.id, &SelectedImages::default()).unwrap();

    let summary = Pipeline::new(&db, PipelineConfig::default())
        .revert_pointers(&RevertSelection::Report(r.id.clone()), RunMode::Execute)
        .unwrap();
    assert_eq!(summary.applied, 0);
    assert_eq!(summary.skipped_ambiguous, 1);
    assert_eq!(
        db.get_report(&r.id).unwrap().unwrap().selected_images,
        SelectedImages::default()
    );
}

#[test]
fn test_revert_refuses_pointer_to_a_missing_image() {
    let db = db();
    let p = patient(&db, "Luzia Ferreira", None);
    let e = exam(&db, &p, Some(VISIT));
    image(&db, &e, &legacy(0), 0);
    let r = report(&db, &e, Some(&legacy(4)), None);
    let fixed = SelectedImages {
        od: Some(legacy(0)),
        oe: None,
    };
    db.rewrite_selected_images(&r, &fixed, "manual fix", "ops@clinic").unwrap();

    let summary = Pipeline::new(&db, PipelineConfig::default())
        .revert_pointers(&RevertSelection::Report(r.id.clone()), RunMode::Execute)
        .unwrap();
    assert_eq!(summary.skipped_ambiguous, 1);
    let ambiguous: Vec<_> = summary.findings_of(FindingKind::Ambiguous).collect();
    assert!(ambiguous[0].detail.contains("would not resolve"), "{}", ambiguous[0].detail);
    assert_eq!(db.get_report(&r.id).unwrap().unwrap().selected_images, fixed);
}

#[test]
fn test_nothing_selected_is_a_no_op() {
    let db = db();
    let summary = Pipeline::new(&db, PipelineConfig::default())
        .revert_pointers(&RevertSelection::Since(1), RunMode::Execute)
        .unwrap();
    assert_eq!(summary.examined, 0);
    assert_eq!(db.verify_audit_chain().unwrap(), ChainStatus::Intact { entries: 0 });
}
