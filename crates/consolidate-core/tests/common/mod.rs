//! Store fixtures shared by the integration tests.

#![allow(dead_code)]

use chrono::NaiveDate;

use consolidate_core::db::Database;
use consolidate_core::models::{Exam, ExamImage, ImageType, MedicalReport, Patient, SelectedImages};

pub fn db() -> Database {
    Database::open_in_memory().unwrap()
}

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub fn patient(db: &Database, name: &str, birth_date: Option<&str>) -> Patient {
    let mut p = Patient::new(name.to_string());
    p.birth_date = birth_date.map(date);
    db.insert_patient(&p).unwrap();
    p
}

pub fn exam(db: &Database, patient: &Patient, visit: Option<&str>) -> Exam {
    let mut e = Exam::new(patient.id.clone(), "2026-02-05".into());
    e.external_id = visit.map(str::to_string);
    db.insert_exam(&e).unwrap();
    e
}

/// Content id used in the URL of image `n`.
pub fn uuid(n: usize) -> String {
    format!("6f1e2d3c-4b5a-4978-8a6b-{n:012x}")
}

/// Insert image `n` of an exam under `id`; capture order follows `n`.
pub fn image(db: &Database, exam: &Exam, id: &str, n: usize) -> ExamImage {
    let img = ExamImage {
        id: id.to_string(),
        exam_id: exam.id.clone(),
        url: format!("https://cdn.example/raw/uploads/{}.jpg", uuid(n)),
        file_name: format!("{n:02}.jpg"),
        image_type: ImageType::Color,
        uploaded_at: format!("2026-02-05T10:00:{n:02}.000Z"),
    };
    db.insert_image(&img).unwrap();
    img
}

pub fn report(db: &Database, exam: &Exam, od: Option<&str>, oe: Option<&str>) -> MedicalReport {
    let mut r = MedicalReport::new(exam.id.clone(), "Dra. Helena Costa".into());
    r.completed_at = Some("2026-02-06T09:00:00Z".into());
    r.selected_images = SelectedImages {
        od: od.map(str::to_string),
        oe: oe.map(str::to_string),
    };
    db.insert_report(&r).unwrap();
    r
}
