//! Reconciliation and ingest against a feed snapshot.

mod common;

use consolidate_core::identity::{NormalizeMode, DEFAULT_STOPWORDS};
use consolidate_core::pipeline::FindingKind;
use consolidate_core::reconcile::UnverifiedPolicy;
use consolidate_core::{JsonSnapshotFeed, Pipeline, PipelineConfig, RunMode};

use common::{date, db, exam, patient};

fn feed(json: &str) -> JsonSnapshotFeed {
    JsonSnapshotFeed::from_json_str(json).unwrap()
}

#[test]
fn test_feed_silence_on_cpf_is_unverifiable_not_deletion() {
    let db = db();
    let mut p = patient(&db, "Maria Oliveira", None);
    p.cpf = Some("12345678901".into());
    db.update_patient(&p).unwrap();
    let feed = feed(r#"{"v1": {"patient_name": "MARIA OLIVEIRA"}}"#);

    let summary = Pipeline::new(&db, PipelineConfig::default())
        .reconcile(&feed, RunMode::Execute)
        .unwrap();
    assert_eq!(summary.findings_of(FindingKind::Unverifiable).count(), 1);
    assert_eq!(db.get_patient(&p.id).unwrap().unwrap().cpf, Some("12345678901".into()));

    let config = PipelineConfig {
        unverified_policy: UnverifiedPolicy::Clear,
        ..PipelineConfig::default()
    };
    Pipeline::new(&db, config).reconcile(&feed, RunMode::Execute).unwrap();
    assert_eq!(db.get_patient(&p.id).unwrap().unwrap().cpf, None);
}

#[test]
fn test_feed_fills_and_corrects() {
    let db = db();
    let mut p = patient(&db, "Cícero Romão Batista", Some("1950-01-01"));
    p.underlying_diseases.insert("diabetes".into(), true);
    p.gender = Some("masculino".into());
    db.update_patient(&p).unwrap();
    let feed = feed(
        r#"{"exam_details": {"v1": {
            "patient_name": "CICERO ROMAO BATISTA",
            "cpf": "123.456.789-01",
            "birthday": "1950-01-02T03:00:00.000Z",
            "gender": "M",
            "underlying_diseases": {"diabetes": false, "hypertension": true, "smoker": null}
        }}}"#,
    );

    let summary = Pipeline::new(&db, PipelineConfig::default())
        .reconcile(&feed, RunMode::Execute)
        .unwrap();
    assert_eq!(summary.applied, 1);

    let stored = db.get_patient(&p.id).unwrap().unwrap();
    assert_eq!(stored.cpf, Some("12345678901".into()));
    assert_eq!(stored.birth_date, Some(date("1950-01-02")));
    assert_eq!(stored.gender, Some("masculino".into()));
    assert_eq!(stored.underlying_diseases.get("diabetes"), Some(&true));
    assert_eq!(stored.underlying_diseases.get("hypertension"), Some(&true));
    assert!(!stored.underlying_diseases.contains_key("smoker"));

    let again = Pipeline::new(&db, PipelineConfig::default())
        .reconcile(&feed, RunMode::Execute)
        .unwrap();
    assert_eq!(again.applied, 0);
}

#[test]
fn test_locked_patient_is_visited_but_not_written() {
    let db = db();
    let mut p = patient(&db, "Jose Ribamar", Some("1940-02-02"));
    p.manually_verified = true;
    db.update_patient(&p).unwrap();
    let feed = feed(r#"{"v1": {"patient_name": "José Ribamar", "birthday": "1941-02-02", "cpf": "12345678901"}}"#);

    let summary = Pipeline::new(&db, PipelineConfig::default())
        .reconcile(&feed, RunMode::Execute)
        .unwrap();
    assert_eq!(summary.skipped_locked, 1);
    assert_eq!(summary.findings_of(FindingKind::Discrepancy).count(), 2);

    let stored = db.get_patient(&p.id).unwrap().unwrap();
    assert_eq!(stored.birth_date, Some(date("1940-02-02")));
    assert_eq!(stored.cpf, None);
}

#[test]
fn test_disagreeing_feed_visits_make_patient_ambiguous() {
    let db = db();
    let p = patient(&db, "Ana Lima", None);
    let feed = feed(
        r#"{
            "v1": {"patient_name": "ANA LIMA", "birthday": "1980-01-01"},
            "v2": {"patient_name": "Ana Lima", "birthday": "1990-01-01"}
        }"#,
    );

    let summary = Pipeline::new(&db, PipelineConfig::default())
        .reconcile(&feed, RunMode::Execute)
        .unwrap();
    assert_eq!(summary.skipped_ambiguous, 1);
    assert_eq!(db.get_patient(&p.id).unwrap().unwrap().birth_date, None);
}

#[test]
fn test_opaque_location_takes_feed_clinic() {
    let db = db();
    let p = patient(&db, "Ana Lima", None);
    let e = exam(&db, &p, Some("v1"));
    db.update_exam_location(&e.id, "5f3a9c2e8b1d4e6f7a8b9c0d").unwrap();
    let orphan = exam(&db, &p, Some("v-missing"));
    db.update_exam_location(&orphan.id, "aaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
    let feed = feed(r#"{"v1": {"patient_name": "Ana Lima", "clinic_name": "Tauá-CE"}}"#);

    let summary = Pipeline::new(&db, PipelineConfig::default())
        .reconcile(&feed, RunMode::Execute)
        .unwrap();
    assert_eq!(summary.unresolved, 1);
    assert_eq!(db.get_exam(&e.id).unwrap().unwrap().location, Some("Tauá-CE".into()));
    assert_eq!(
        db.get_exam(&orphan.id).unwrap().unwrap().location,
        Some("aaaaaaaaaaaaaaaaaaaaaaaa".into())
    );
}

const INGEST_FEED: &str = r#"{"exam_details": {
    "697001ce4e429636ed944c10": {
        "patient_name": "Francisca das Chagas",
        "cpf": "98765432100",
        "birthday": "1948-11-30",
        "clinic_name": "Crato-CE",
        "exam_date": "2026-01-15",
        "image_list": [
            {"url": "https://cdn.example/raw/uploads/0a1b2c3d-1111-4222-8333-444455556666.jpg", "type": "COLOR"},
            {"uuid": "0a1b2c3d-1111-4222-8333-777788889999", "type": "REDFREE"}
        ]
    }
}}"#;

#[test]
fn test_ingest_creates_patient_exam_and_images_once() {
    let db = db();
    let feed = feed(INGEST_FEED);
    let config = PipelineConfig {
        image_base_url: Some("https://cdn.example/raw/uploads/".into()),
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::new(&db, config);

    let preview = pipeline.ingest(&feed, RunMode::Preview).unwrap();
    assert_eq!(preview.applied, 1);
    assert!(db.list_patients().unwrap().is_empty());

    let summary = pipeline.ingest(&feed, RunMode::Execute).unwrap();
    assert_eq!(summary.applied, 1);

    let patients = db.list_patients().unwrap();
    assert_eq!(patients.len(), 1);
    assert_eq!(patients[0].cpf, Some("98765432100".into()));
    assert_eq!(patients[0].birth_date, Some(date("1948-11-30")));

    let exam = db
        .find_exam_by_external_id("697001ce4e429636ed944c10")
        .unwrap()
        .unwrap();
    assert_eq!(exam.location, Some("Crato-CE".into()));
    assert_eq!(exam.exam_date, "2026-01-15");

    let images = db.list_images_for_exam(&exam.id).unwrap();
    let ids: Vec<_> = images.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            "img-0a1b2c3d-1111-4222-8333-444455556666.jpg",
            "img-0a1b2c3d-1111-4222-8333-777788889999.jpg",
        ]
    );
    assert_eq!(
        images[1].url,
        "https://cdn.example/raw/uploads/0a1b2c3d-1111-4222-8333-777788889999.jpg"
    );

    let again = pipeline.ingest(&feed, RunMode::Execute).unwrap();
    assert_eq!(again.applied, 0);
    assert_eq!(again.unchanged, 1);
}

#[test]
fn test_ingest_attaches_to_existing_patient() {
    let db = db();
    let existing = patient(&db, "FRANCISCA CHAGAS", Some("1948-11-30"));
    let feed = feed(INGEST_FEED);

    Pipeline::new(&db, PipelineConfig::default())
        .ingest(&feed, RunMode::Execute)
        .unwrap();

    assert_eq!(db.list_patients().unwrap().len(), 1);
    assert_eq!(db.count_exams_for_patient(&existing.id).unwrap(), 1);
}

#[test]
fn test_ingest_matches_with_configured_stopwords() {
    let db = db();
    let existing = patient(&db, "Pedro Paulo", None);
    let feed = feed(r#"{"v1": {"patient_name": "Pedro e Paulo", "exam_date": "2026-01-15"}}"#);
    let mut stopwords: Vec<String> = DEFAULT_STOPWORDS.iter().map(|s| s.to_string()).collect();
    stopwords.push("E".into());
    let config = PipelineConfig {
        stopwords,
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::new(&db, config);

    pipeline.ingest(&feed, RunMode::Execute).unwrap();
    assert_eq!(db.list_patients().unwrap().len(), 1);
    assert_eq!(db.count_exams_for_patient(&existing.id).unwrap(), 1);

    let merge = pipeline.merge(RunMode::Execute).unwrap();
    assert_eq!(merge.applied, 0);
}

#[test]
fn test_ingest_in_basic_mode_keeps_stopword_variants_apart() {
    let db = db();
    patient(&db, "FRANCISCA CHAGAS", Some("1948-11-30"));
    let config = PipelineConfig {
        name_mode: NormalizeMode::Basic,
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::new(&db, config);

    pipeline.ingest(&feed(INGEST_FEED), RunMode::Execute).unwrap();
    assert_eq!(db.list_patients().unwrap().len(), 2);
    assert_eq!(pipeline.merge(RunMode::Execute).unwrap().applied, 0);
}

#[test]
fn test_full_run_is_idempotent() {
    let db = db();
    let a = patient(&db, "Francisca das Chagas", None);
    let b = patient(&db, "FRANCISCA DAS CHAGAS", None);
    exam(&db, &a, Some("v-a"));
    exam(&db, &b, Some("v-b"));
    let feed = feed(r#"{"v-a": {"patient_name": "Francisca das Chagas", "birthday": "1948-11-30"}}"#);

    let pipeline = Pipeline::new(&db, PipelineConfig::default());
    let first = pipeline.run(&feed, RunMode::Execute).unwrap();
    assert!(first.passes.iter().any(|p| p.applied > 0));

    let second = pipeline.run(&feed, RunMode::Execute).unwrap();
    for pass in &second.passes {
        assert_eq!(pass.applied, 0, "{pass}");
        assert_eq!(pass.failed, 0, "{pass}");
    }
}
