//! Exam and image database operations.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DbError, DbResult};
use crate::models::{Exam, ExamImage, ExamStatus, ImageType};

const EXAM_COLUMNS: &str =
    "id, patient_id, exam_date, location, technician_name, status, external_id, created_at";

const IMAGE_COLUMNS: &str = "id, exam_id, url, file_name, image_type, uploaded_at";

impl Database {
    // =========================================================================
    // Exams
    // =========================================================================

    /// Insert a new exam.
    pub fn insert_exam(&self, exam: &Exam) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO exams (
                id, patient_id, exam_date, location, technician_name,
                status, external_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                exam.id,
                exam.patient_id,
                exam.exam_date,
                exam.location,
                exam.technician_name,
                exam.status.as_str(),
                exam.external_id,
                exam.created_at,
            ],
        )?;
        Ok(())
    }

    /// Get an exam by ID.
    pub fn get_exam(&self, id: &str) -> DbResult<Option<Exam>> {
        self.conn
            .query_row(
                &format!("SELECT {EXAM_COLUMNS} FROM exams WHERE id = ?"),
                [id],
                ExamRow::from_row,
            )
            .optional()?
            .map(Exam::try_from)
            .transpose()
    }

    /// Find the exam imported from an external visit.
    pub fn find_exam_by_external_id(&self, external_id: &str) -> DbResult<Option<Exam>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {EXAM_COLUMNS} FROM exams WHERE external_id = ? ORDER BY created_at, id LIMIT 1"
                ),
                [external_id],
                ExamRow::from_row,
            )
            .optional()?
            .map(Exam::try_from)
            .transpose()
    }

    /// List exams owned by a patient, oldest visit first.
    pub fn list_exams_for_patient(&self, patient_id: &str) -> DbResult<Vec<Exam>> {
        self.query_exams(
            &format!(
                "SELECT {EXAM_COLUMNS} FROM exams WHERE patient_id = ? ORDER BY exam_date, created_at, id"
            ),
            [patient_id],
        )
    }

    /// List every exam.
    pub fn list_exams(&self) -> DbResult<Vec<Exam>> {
        self.query_exams(
            &format!("SELECT {EXAM_COLUMNS} FROM exams ORDER BY patient_id, exam_date, id"),
            [],
        )
    }

    /// Count exams per patient.
    pub fn count_exams_for_patient(&self, patient_id: &str) -> DbResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM exams WHERE patient_id = ?",
            [patient_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Move an exam to another patient.
    pub fn reparent_exam(&self, exam_id: &str, patient_id: &str) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            "UPDATE exams SET patient_id = ? WHERE id = ?",
            [patient_id, exam_id],
        )?;
        Ok(rows_affected > 0)
    }

    /// Replace the exam location.
    pub fn update_exam_location(&self, exam_id: &str, location: &str) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            "UPDATE exams SET location = ? WHERE id = ?",
            [location, exam_id],
        )?;
        Ok(rows_affected > 0)
    }

    /// Delete an exam. Fails while images, a report or a referral still point at it.
    pub fn delete_exam(&self, id: &str) -> DbResult<bool> {
        let rows_affected = self.conn.execute("DELETE FROM exams WHERE id = ?", [id])?;
        Ok(rows_affected > 0)
    }

    fn query_exams<P: rusqlite::Params>(&self, sql: &str, params: P) -> DbResult<Vec<Exam>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, ExamRow::from_row)?;

        let mut exams = Vec::new();
        for row in rows {
            exams.push(row?.try_into()?);
        }
        Ok(exams)
    }

    // =========================================================================
    // Images
    // =========================================================================

    /// Insert a new image.
    pub fn insert_image(&self, image: &ExamImage) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO exam_images (id, exam_id, url, file_name, image_type, uploaded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                image.id,
                image.exam_id,
                image.url,
                image.file_name,
                image.image_type.as_str(),
                image.uploaded_at,
            ],
        )?;
        Ok(())
    }

    /// Get an image by ID.
    pub fn get_image(&self, id: &str) -> DbResult<Option<ExamImage>> {
        self.conn
            .query_row(
                &format!("SELECT {IMAGE_COLUMNS} FROM exam_images WHERE id = ?"),
                [id],
                ImageRow::from_row,
            )
            .optional()?
            .map(ExamImage::try_from)
            .transpose()
    }

    /// List images of an exam in capture order.
    ///
    /// Ordered by upload time, then file name, then id. This is the order
    /// positional references are resolved against; never by id alone.
    pub fn list_images_for_exam(&self, exam_id: &str) -> DbResult<Vec<ExamImage>> {
        self.query_images(
            &format!(
                "SELECT {IMAGE_COLUMNS} FROM exam_images WHERE exam_id = ? ORDER BY uploaded_at, file_name, id"
            ),
            [exam_id],
        )
    }

    /// List every image.
    pub fn list_images(&self) -> DbResult<Vec<ExamImage>> {
        self.query_images(
            &format!("SELECT {IMAGE_COLUMNS} FROM exam_images ORDER BY exam_id, uploaded_at, file_name, id"),
            [],
        )
    }

    /// Find any image stored under a URL.
    pub fn find_image_by_url(&self, url: &str) -> DbResult<Option<ExamImage>> {
        self.conn
            .query_row(
                &format!("SELECT {IMAGE_COLUMNS} FROM exam_images WHERE url = ? ORDER BY id LIMIT 1"),
                [url],
                ImageRow::from_row,
            )
            .optional()?
            .map(ExamImage::try_from)
            .transpose()
    }

    /// Move an image to another exam.
    pub fn move_image(&self, image_id: &str, exam_id: &str) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            "UPDATE exam_images SET exam_id = ? WHERE id = ?",
            [exam_id, image_id],
        )?;
        Ok(rows_affected > 0)
    }

    /// Change an image's primary key. The URL is left untouched.
    pub fn rename_image(&self, old_id: &str, new_id: &str) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            "UPDATE exam_images SET id = ? WHERE id = ?",
            [new_id, old_id],
        )?;
        Ok(rows_affected > 0)
    }

    /// Delete an image row. The stored bytes are not touched.
    pub fn delete_image(&self, id: &str) -> DbResult<bool> {
        let rows_affected = self
            .conn
            .execute("DELETE FROM exam_images WHERE id = ?", [id])?;
        Ok(rows_affected > 0)
    }

    fn query_images<P: rusqlite::Params>(&self, sql: &str, params: P) -> DbResult<Vec<ExamImage>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, ImageRow::from_row)?;

        let mut images = Vec::new();
        for row in rows {
            images.push(row?.try_into()?);
        }
        Ok(images)
    }
}

/// Intermediate row struct for database mapping.
struct ExamRow {
    id: String,
    patient_id: String,
    exam_date: String,
    location: Option<String>,
    technician_name: Option<String>,
    status: String,
    external_id: Option<String>,
    created_at: String,
}

impl ExamRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ExamRow {
            id: row.get(0)?,
            patient_id: row.get(1)?,
            exam_date: row.get(2)?,
            location: row.get(3)?,
            technician_name: row.get(4)?,
            status: row.get(5)?,
            external_id: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

impl TryFrom<ExamRow> for Exam {
    type Error = DbError;

    fn try_from(row: ExamRow) -> Result<Self, Self::Error> {
        let status = ExamStatus::parse(&row.status)
            .ok_or_else(|| DbError::Constraint(format!("Unknown exam status: {}", row.status)))?;

        Ok(Exam {
            id: row.id,
            patient_id: row.patient_id,
            exam_date: row.exam_date,
            location: row.location,
            technician_name: row.technician_name,
            status,
            external_id: row.external_id,
            created_at: row.created_at,
        })
    }
}

struct ImageRow {
    id: String,
    exam_id: String,
    url: String,
    file_name: String,
    image_type: String,
    uploaded_at: String,
}

impl ImageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ImageRow {
            id: row.get(0)?,
            exam_id: row.get(1)?,
            url: row.get(2)?,
            file_name: row.get(3)?,
            image_type: row.get(4)?,
            uploaded_at: row.get(5)?,
        })
    }
}

impl TryFrom<ImageRow> for ExamImage {
    type Error = DbError;

    fn try_from(row: ImageRow) -> Result<Self, Self::Error> {
        let image_type = ImageType::parse(&row.image_type)
            .ok_or_else(|| DbError::Constraint(format!("Unknown image type: {}", row.image_type)))?;

        Ok(ExamImage {
            id: row.id,
            exam_id: row.exam_id,
            url: row.url,
            file_name: row.file_name,
            image_type,
            uploaded_at: row.uploaded_at,
        })
    }
}
