//! Patient models.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Condition name → present. Keys are kept as captured (e.g. "diabetes").
pub type DiseaseFlags = BTreeMap<String, bool>;

/// A real-world person, possibly duplicated until the merge pass runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Patient {
    /// Primary key
    pub id: String,
    /// Display name as captured at intake (not unique)
    pub name: String,
    /// National ID (CPF), digits only
    pub cpf: Option<String>,
    /// Date of birth
    pub birth_date: Option<NaiveDate>,
    /// Free-text gender as captured
    pub gender: Option<String>,
    /// Systemic conditions (diabetes, hypertension, ...)
    pub underlying_diseases: DiseaseFlags,
    /// Ophthalmic conditions (glaucoma, cataract, ...)
    pub ophthalmic_diseases: DiseaseFlags,
    /// Set by clinical staff; automatic correction never writes to this record
    pub manually_verified: bool,
    /// Creation timestamp
    pub created_at: String,
    /// Last update timestamp
    pub updated_at: String,
}

impl Patient {
    /// Create a new patient with a generated ID.
    pub fn new(name: String) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            cpf: None,
            birth_date: None,
            gender: None,
            underlying_diseases: DiseaseFlags::new(),
            ophthalmic_diseases: DiseaseFlags::new(),
            manually_verified: false,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_patient() {
        let patient = Patient::new("Maria Aparecida".into());
        assert_eq!(patient.name, "Maria Aparecida");
        assert!(!patient.manually_verified);
        assert_eq!(patient.id.len(), 36); // UUID format
        assert_eq!(patient.created_at, patient.updated_at);
    }
}
