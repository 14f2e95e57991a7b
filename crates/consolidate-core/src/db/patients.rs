//! Patient database operations.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DbError, DbResult};
use crate::identity::deep_key;
use crate::models::{DiseaseFlags, Patient};
use crate::reconcile::cpf_digits;

const PATIENT_COLUMNS: &str = "id, name, cpf, birth_date, gender, underlying_diseases, \
     ophthalmic_diseases, manually_verified, created_at, updated_at";

/// How a name query is matched against the stored name key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameQuery {
    Exact,
    Prefix,
    Contains,
}

impl Database {
    /// Insert a new patient.
    ///
    /// `name_key` is always the default deep key, whatever name mode the
    /// pipeline runs with; it serves `find` lookups only. Matching for merge
    /// and ingest recomputes keys with the configured normalizer.
    pub fn insert_patient(&self, patient: &Patient) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO patients (
                id, name, name_key, cpf, birth_date, gender, underlying_diseases,
                ophthalmic_diseases, manually_verified, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                patient.id,
                patient.name,
                deep_key(&patient.name),
                patient.cpf,
                patient.birth_date.map(format_date),
                patient.gender,
                serde_json::to_string(&patient.underlying_diseases)?,
                serde_json::to_string(&patient.ophthalmic_diseases)?,
                patient.manually_verified,
                patient.created_at,
                patient.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Update the demographic and clinical fields of an existing patient.
    pub fn update_patient(&self, patient: &Patient) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            r#"
            UPDATE patients SET
                name = ?2,
                name_key = ?3,
                cpf = ?4,
                birth_date = ?5,
                gender = ?6,
                underlying_diseases = ?7,
                ophthalmic_diseases = ?8,
                manually_verified = ?9,
                updated_at = datetime('now')
            WHERE id = ?1
            "#,
            params![
                patient.id,
                patient.name,
                deep_key(&patient.name),
                patient.cpf,
                patient.birth_date.map(format_date),
                patient.gender,
                serde_json::to_string(&patient.underlying_diseases)?,
                serde_json::to_string(&patient.ophthalmic_diseases)?,
                patient.manually_verified,
            ],
        )?;
        Ok(rows_affected > 0)
    }

    /// Get a patient by ID.
    pub fn get_patient(&self, id: &str) -> DbResult<Option<Patient>> {
        self.conn
            .query_row(
                &format!("SELECT {PATIENT_COLUMNS} FROM patients WHERE id = ?"),
                [id],
                PatientRow::from_row,
            )
            .optional()?
            .map(Patient::try_from)
            .transpose()
    }

    /// List all patients, oldest first.
    pub fn list_patients(&self) -> DbResult<Vec<Patient>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PATIENT_COLUMNS} FROM patients ORDER BY created_at, id"
        ))?;

        let rows = stmt.query_map([], PatientRow::from_row)?;

        let mut patients = Vec::new();
        for row in rows {
            patients.push(row?.try_into()?);
        }
        Ok(patients)
    }

    /// Search patients by normalized name key.
    ///
    /// The query goes through the same normalization as stored names, so
    /// "joão da silva" finds "JOAO  DA SILVA".
    pub fn search_patients_by_name(
        &self,
        query: &str,
        mode: NameQuery,
        limit: usize,
    ) -> DbResult<Vec<Patient>> {
        let key = deep_key(query);
        if key.is_empty() {
            return Ok(Vec::new());
        }

        let escaped = escape_like(&key);
        let (clause, pattern) = match mode {
            NameQuery::Exact => ("name_key = ?1", key),
            NameQuery::Prefix => ("name_key LIKE ?1 ESCAPE '\\'", format!("{escaped}%")),
            NameQuery::Contains => ("name_key LIKE ?1 ESCAPE '\\'", format!("%{escaped}%")),
        };

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PATIENT_COLUMNS} FROM patients WHERE {clause} ORDER BY name_key, created_at LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![pattern, limit as i64], PatientRow::from_row)?;

        let mut patients = Vec::new();
        for row in rows {
            patients.push(row?.try_into()?);
        }
        Ok(patients)
    }

    /// List patients sharing a national ID with at least one other patient.
    ///
    /// IDs compare digits-only; blanks and placeholders are ignored.
    /// Groups are keyed by the digits.
    pub fn list_patients_with_shared_cpf(&self) -> DbResult<Vec<(String, Vec<String>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT cpf, id FROM patients WHERE cpf IS NOT NULL ORDER BY id")?;

        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut by_digits: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in rows {
            let (cpf, id) = row?;
            if let Some(digits) = cpf_digits(&cpf) {
                by_digits.entry(digits).or_default().push(id);
            }
        }
        Ok(by_digits.into_iter().filter(|(_, ids)| ids.len() > 1).collect())
    }

    /// Delete a patient. Fails while the patient still owns exams.
    pub fn delete_patient(&self, id: &str) -> DbResult<bool> {
        let rows_affected = self
            .conn
            .execute("DELETE FROM patients WHERE id = ?", [id])?;
        Ok(rows_affected > 0)
    }

    /// Set or clear the manual-verification flag.
    pub fn set_manually_verified(&self, id: &str, verified: bool) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            "UPDATE patients SET manually_verified = ?, updated_at = datetime('now') WHERE id = ?",
            params![verified, id],
        )?;
        Ok(rows_affected > 0)
    }
}

/// Intermediate row struct for database mapping.
struct PatientRow {
    id: String,
    name: String,
    cpf: Option<String>,
    birth_date: Option<String>,
    gender: Option<String>,
    underlying_diseases: String,
    ophthalmic_diseases: String,
    manually_verified: bool,
    created_at: String,
    updated_at: String,
}

impl PatientRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(PatientRow {
            id: row.get(0)?,
            name: row.get(1)?,
            cpf: row.get(2)?,
            birth_date: row.get(3)?,
            gender: row.get(4)?,
            underlying_diseases: row.get(5)?,
            ophthalmic_diseases: row.get(6)?,
            manually_verified: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }
}

impl TryFrom<PatientRow> for Patient {
    type Error = DbError;

    fn try_from(row: PatientRow) -> Result<Self, Self::Error> {
        let underlying_diseases: DiseaseFlags = serde_json::from_str(&row.underlying_diseases)?;
        let ophthalmic_diseases: DiseaseFlags = serde_json::from_str(&row.ophthalmic_diseases)?;
        let birth_date = row.birth_date.as_deref().map(parse_date).transpose()?;

        Ok(Patient {
            id: row.id,
            name: row.name,
            cpf: row.cpf,
            birth_date,
            gender: row.gender,
            underlying_diseases,
            ophthalmic_diseases,
            manually_verified: row.manually_verified,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_date(s: &str) -> Result<NaiveDate, DbError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| DbError::Constraint(format!("Invalid birth_date '{}': {}", s, e)))
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let db = setup_db();

        let mut patient = Patient::new("Maria José".into());
        patient.cpf = Some("12345678901".into());
        patient.birth_date = NaiveDate::from_ymd_opt(1958, 3, 14);
        patient.underlying_diseases.insert("diabetes".into(), true);

        db.insert_patient(&patient).unwrap();

        let retrieved = db.get_patient(&patient.id).unwrap().unwrap();
        assert_eq!(retrieved.name, "Maria José");
        assert_eq!(retrieved.cpf, Some("12345678901".into()));
        assert_eq!(retrieved.birth_date, NaiveDate::from_ymd_opt(1958, 3, 14));
        assert_eq!(retrieved.underlying_diseases.get("diabetes"), Some(&true));
    }

    #[test]
    fn test_update_patient() {
        let db = setup_db();

        let mut patient = Patient::new("Ana".into());
        db.insert_patient(&patient).unwrap();

        patient.gender = Some("female".into());
        patient.ophthalmic_diseases.insert("glaucoma".into(), true);
        assert!(db.update_patient(&patient).unwrap());

        let retrieved = db.get_patient(&patient.id).unwrap().unwrap();
        assert_eq!(retrieved.gender, Some("female".into()));
        assert_eq!(retrieved.ophthalmic_diseases.get("glaucoma"), Some(&true));
    }

    #[test]
    fn test_search_by_name_modes() {
        let db = setup_db();

        db.insert_patient(&Patient::new("João da Silva".into())).unwrap();
        db.insert_patient(&Patient::new("JOAO SILVA SANTOS".into())).unwrap();
        db.insert_patient(&Patient::new("Maria Silva".into())).unwrap();

        let exact = db.search_patients_by_name("joao silva", NameQuery::Exact, 10).unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].name, "João da Silva");

        let prefix = db.search_patients_by_name("João", NameQuery::Prefix, 10).unwrap();
        assert_eq!(prefix.len(), 2);

        let contains = db.search_patients_by_name("silva", NameQuery::Contains, 10).unwrap();
        assert_eq!(contains.len(), 3);

        assert!(db.search_patients_by_name("  ", NameQuery::Contains, 10).unwrap().is_empty());
    }

    #[test]
    fn test_shared_cpf_groups() {
        let db = setup_db();

        let mut a = Patient::new("Ana".into());
        a.cpf = Some("11122233344".into());
        let mut b = Patient::new("Ana Paula".into());
        b.cpf = Some("11122233344".into());
        let mut c = Patient::new("Carla".into());
        c.cpf = Some("99988877766".into());

        for p in [&a, &b, &c] {
            db.insert_patient(p).unwrap();
        }

        let groups = db.list_patients_with_shared_cpf().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0, "11122233344");
        assert_eq!(groups[0].1.len(), 2);
    }

    #[test]
    fn test_shared_cpf_compares_digits_and_skips_placeholders() {
        let db = setup_db();

        let mut formatted = Patient::new("Ana".into());
        formatted.cpf = Some("123.456.789-01".into());
        let mut bare = Patient::new("Bia".into());
        bare.cpf = Some("12345678901".into());
        let mut pending = Patient::new("Carla".into());
        pending.cpf = Some("PENDENTE".into());
        let mut also_pending = Patient::new("Dora".into());
        also_pending.cpf = Some("pendente".into());
        let mut blank = Patient::new("Edna".into());
        blank.cpf = Some("  ".into());
        let mut also_blank = Patient::new("Fabi".into());
        also_blank.cpf = Some(String::new());

        for p in [&formatted, &bare, &pending, &also_pending, &blank, &also_blank] {
            db.insert_patient(p).unwrap();
        }

        let groups = db.list_patients_with_shared_cpf().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0, "12345678901");
        let mut expected = vec![formatted.id.clone(), bare.id.clone()];
        expected.sort();
        assert_eq!(groups[0].1, expected);
    }

    #[test]
    fn test_manual_verification_flag() {
        let db = setup_db();
        let patient = Patient::new("Francisco".into());
        db.insert_patient(&patient).unwrap();

        assert!(db.set_manually_verified(&patient.id, true).unwrap());
        assert!(db.get_patient(&patient.id).unwrap().unwrap().manually_verified);
    }

    #[test]
    fn test_delete_patient() {
        let db = setup_db();
        let patient = Patient::new("Francisco".into());
        db.insert_patient(&patient).unwrap();

        assert!(db.delete_patient(&patient.id).unwrap());
        assert!(db.get_patient(&patient.id).unwrap().is_none());
        assert!(!db.delete_patient(&patient.id).unwrap());
    }
}
