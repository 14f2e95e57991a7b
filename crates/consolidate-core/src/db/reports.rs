//! Medical report and referral database operations.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DbError, DbResult};
use crate::models::{DiseaseFlags, MedicalReport, PatientReferral, SelectedImages, Urgency};

const REPORT_COLUMNS: &str = "id, exam_id, doctor_name, doctor_crm, findings, diagnosis, \
     recommendations, diagnostic_conditions, selected_images, completed_at";

const REFERRAL_COLUMNS: &str =
    "id, exam_id, referred_by, specialty, urgency, notes, status, outcome, created_at";

impl Database {
    // =========================================================================
    // Reports
    // =========================================================================

    /// Insert a new report.
    pub fn insert_report(&self, report: &MedicalReport) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO medical_reports (
                id, exam_id, doctor_name, doctor_crm, findings, diagnosis,
                recommendations, diagnostic_conditions, selected_images, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                report.id,
                report.exam_id,
                report.doctor_name,
                report.doctor_crm,
                report.findings,
                report.diagnosis,
                report.recommendations,
                serde_json::to_string(&report.diagnostic_conditions)?,
                serde_json::to_string(&report.selected_images)?,
                report.completed_at,
            ],
        )?;
        Ok(())
    }

    /// Get a report by id.
    pub fn get_report(&self, id: &str) -> DbResult<Option<MedicalReport>> {
        self.conn
            .query_row(
                &format!("SELECT {REPORT_COLUMNS} FROM medical_reports WHERE id = ?"),
                [id],
                ReportRow::from_row,
            )
            .optional()?
            .map(MedicalReport::try_from)
            .transpose()
    }

    /// Get the report of an exam.
    pub fn get_report_for_exam(&self, exam_id: &str) -> DbResult<Option<MedicalReport>> {
        self.conn
            .query_row(
                &format!("SELECT {REPORT_COLUMNS} FROM medical_reports WHERE exam_id = ?"),
                [exam_id],
                ReportRow::from_row,
            )
            .optional()?
            .map(MedicalReport::try_from)
            .transpose()
    }

    /// List every report.
    pub fn list_reports(&self) -> DbResult<Vec<MedicalReport>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {REPORT_COLUMNS} FROM medical_reports ORDER BY exam_id"))?;
        let rows = stmt.query_map([], ReportRow::from_row)?;

        let mut reports = Vec::new();
        for row in rows {
            reports.push(row?.try_into()?);
        }
        Ok(reports)
    }

    /// Attach a report to another exam.
    pub fn move_report(&self, report_id: &str, exam_id: &str) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            "UPDATE medical_reports SET exam_id = ? WHERE id = ?",
            [exam_id, report_id],
        )?;
        Ok(rows_affected > 0)
    }

    /// Overwrite the selected-image pointers.
    ///
    /// Callers that change pointers on existing data must record the change
    /// with [`Database::append_selected_images_change`] in the same savepoint.
    pub fn update_selected_images(&self, report_id: &str, selected: &SelectedImages) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            "UPDATE medical_reports SET selected_images = ? WHERE id = ?",
            params![serde_json::to_string(selected)?, report_id],
        )?;
        Ok(rows_affected > 0)
    }

    // =========================================================================
    // Referrals
    // =========================================================================

    /// Insert a new referral.
    pub fn insert_referral(&self, referral: &PatientReferral) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO patient_referrals (
                id, exam_id, referred_by, specialty, urgency, notes, status, outcome, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                referral.id,
                referral.exam_id,
                referral.referred_by,
                referral.specialty,
                referral.urgency.as_str(),
                referral.notes,
                referral.status,
                referral.outcome,
                referral.created_at,
            ],
        )?;
        Ok(())
    }

    /// Get the referral of an exam.
    pub fn get_referral_for_exam(&self, exam_id: &str) -> DbResult<Option<PatientReferral>> {
        self.conn
            .query_row(
                &format!("SELECT {REFERRAL_COLUMNS} FROM patient_referrals WHERE exam_id = ?"),
                [exam_id],
                ReferralRow::from_row,
            )
            .optional()?
            .map(PatientReferral::try_from)
            .transpose()
    }

    /// Attach a referral to another exam.
    pub fn move_referral(&self, referral_id: &str, exam_id: &str) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            "UPDATE patient_referrals SET exam_id = ? WHERE id = ?",
            [exam_id, referral_id],
        )?;
        Ok(rows_affected > 0)
    }
}

/// Intermediate row struct for database mapping.
struct ReportRow {
    id: String,
    exam_id: String,
    doctor_name: String,
    doctor_crm: Option<String>,
    findings: Option<String>,
    diagnosis: Option<String>,
    recommendations: Option<String>,
    diagnostic_conditions: String,
    selected_images: String,
    completed_at: Option<String>,
}

impl ReportRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ReportRow {
            id: row.get(0)?,
            exam_id: row.get(1)?,
            doctor_name: row.get(2)?,
            doctor_crm: row.get(3)?,
            findings: row.get(4)?,
            diagnosis: row.get(5)?,
            recommendations: row.get(6)?,
            diagnostic_conditions: row.get(7)?,
            selected_images: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }
}

impl TryFrom<ReportRow> for MedicalReport {
    type Error = DbError;

    fn try_from(row: ReportRow) -> Result<Self, Self::Error> {
        let diagnostic_conditions: DiseaseFlags = serde_json::from_str(&row.diagnostic_conditions)?;
        let selected_images: SelectedImages = serde_json::from_str(&row.selected_images)?;

        Ok(MedicalReport {
            id: row.id,
            exam_id: row.exam_id,
            doctor_name: row.doctor_name,
            doctor_crm: row.doctor_crm,
            findings: row.findings,
            diagnosis: row.diagnosis,
            recommendations: row.recommendations,
            diagnostic_conditions,
            selected_images,
            completed_at: row.completed_at,
        })
    }
}

struct ReferralRow {
    id: String,
    exam_id: String,
    referred_by: String,
    specialty: String,
    urgency: String,
    notes: Option<String>,
    status: String,
    outcome: Option<String>,
    created_at: String,
}

impl ReferralRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ReferralRow {
            id: row.get(0)?,
            exam_id: row.get(1)?,
            referred_by: row.get(2)?,
            specialty: row.get(3)?,
            urgency: row.get(4)?,
            notes: row.get(5)?,
            status: row.get(6)?,
            outcome: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

impl TryFrom<ReferralRow> for PatientReferral {
    type Error = DbError;

    fn try_from(row: ReferralRow) -> Result<Self, Self::Error> {
        let urgency = Urgency::parse(&row.urgency)
            .ok_or_else(|| DbError::Constraint(format!("Unknown urgency: {}", row.urgency)))?;

        Ok(PatientReferral {
            id: row.id,
            exam_id: row.exam_id,
            referred_by: row.referred_by,
            specialty: row.specialty,
            urgency,
            notes: row.notes,
            status: row.status,
            outcome: row.outcome,
            created_at: row.created_at,
        })
    }
}
