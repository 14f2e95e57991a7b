//! Medical report, referral and audit-trail models.

use serde::{Deserialize, Serialize};

use super::DiseaseFlags;

/// Image chosen for the printed report, one per eye.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectedImages {
    /// Right eye (oculus dexter)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub od: Option<String>,
    /// Left eye (olho esquerdo)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oe: Option<String>,
}

/// Which eye a selected-image pointer belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Eye {
    Od,
    Oe,
}

impl Eye {
    pub fn as_str(&self) -> &'static str {
        match self {
            Eye::Od => "od",
            Eye::Oe => "oe",
        }
    }
}

impl SelectedImages {
    pub fn is_empty(&self) -> bool {
        self.od.is_none() && self.oe.is_none()
    }

    /// Non-empty pointers with their eye.
    pub fn pointers(&self) -> Vec<(Eye, &str)> {
        let mut out = Vec::with_capacity(2);
        if let Some(id) = self.od.as_deref() {
            out.push((Eye::Od, id));
        }
        if let Some(id) = self.oe.as_deref() {
            out.push((Eye::Oe, id));
        }
        out
    }

    pub fn get(&self, eye: Eye) -> Option<&str> {
        match eye {
            Eye::Od => self.od.as_deref(),
            Eye::Oe => self.oe.as_deref(),
        }
    }

    pub fn set(&mut self, eye: Eye, id: String) {
        match eye {
            Eye::Od => self.od = Some(id),
            Eye::Oe => self.oe = Some(id),
        }
    }

    /// True when either eye points at `image_id`.
    pub fn references(&self, image_id: &str) -> bool {
        self.od.as_deref() == Some(image_id) || self.oe.as_deref() == Some(image_id)
    }
}

/// Doctor's report for an exam. At most one per exam.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MedicalReport {
    pub id: String,
    pub exam_id: String,
    pub doctor_name: String,
    /// Professional registration (CRM)
    pub doctor_crm: Option<String>,
    pub findings: Option<String>,
    pub diagnosis: Option<String>,
    pub recommendations: Option<String>,
    /// Structured diagnostic flags (retinopathy, maculopathy, ...)
    pub diagnostic_conditions: DiseaseFlags,
    pub selected_images: SelectedImages,
    pub completed_at: Option<String>,
}

impl MedicalReport {
    pub fn new(exam_id: String, doctor_name: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            exam_id,
            doctor_name,
            doctor_crm: None,
            findings: None,
            diagnosis: None,
            recommendations: None,
            diagnostic_conditions: DiseaseFlags::new(),
            selected_images: SelectedImages::default(),
            completed_at: None,
        }
    }
}

/// Urgency of a specialist referral.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Routine,
    Urgent,
    Emergency,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Routine => "routine",
            Urgency::Urgent => "urgent",
            Urgency::Emergency => "emergency",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "routine" => Some(Urgency::Routine),
            "urgent" => Some(Urgency::Urgent),
            "emergency" => Some(Urgency::Emergency),
            _ => None,
        }
    }
}

/// Specialist referral raised from an exam. At most one per exam.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatientReferral {
    pub id: String,
    pub exam_id: String,
    pub referred_by: String,
    pub specialty: String,
    pub urgency: Urgency,
    pub notes: Option<String>,
    /// Tracking status ("pending", "scheduled", "seen", ...)
    pub status: String,
    pub outcome: Option<String>,
    pub created_at: String,
}

impl PatientReferral {
    pub fn new(exam_id: String, referred_by: String, specialty: String, urgency: Urgency) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            exam_id,
            referred_by,
            specialty,
            urgency,
            notes: None,
            status: "pending".into(),
            outcome: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// One entry of the selected-image audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectedImagesChange {
    pub report_id: String,
    pub previous: SelectedImages,
    pub new: SelectedImages,
    pub reason: String,
    pub changed_by: String,
    pub changed_at: String,
}

impl SelectedImagesChange {
    /// Canonical JSON used as the hashed payload (sorted, no whitespace).
    pub fn to_canonical_json(&self) -> Result<String, serde_json::Error> {
        let value = serde_json::to_value(self)?;
        serde_json::to_string(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selected_images_pointers() {
        let mut selected = SelectedImages::default();
        assert!(selected.is_empty());

        selected.set(Eye::Oe, "img-a.jpg".into());
        assert_eq!(selected.pointers(), vec![(Eye::Oe, "img-a.jpg")]);
        assert!(selected.references("img-a.jpg"));
        assert!(!selected.references("img-b.jpg"));
        assert_eq!(selected.get(Eye::Od), None);
    }

    #[test]
    fn test_selected_images_json_shape() {
        let selected = SelectedImages {
            od: Some("x".into()),
            oe: None,
        };
        assert_eq!(serde_json::to_string(&selected).unwrap(), r#"{"od":"x"}"#);

        let parsed: SelectedImages = serde_json::from_str("{}").unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_canonical_json_is_stable() {
        let change = SelectedImagesChange {
            report_id: "r1".into(),
            previous: SelectedImages::default(),
            new: SelectedImages {
                od: Some("img-1.jpg".into()),
                oe: None,
            },
            reason: "test".into(),
            changed_by: "tester".into(),
            changed_at: "2026-01-01T00:00:00Z".into(),
        };
        assert_eq!(
            change.to_canonical_json().unwrap(),
            change.clone().to_canonical_json().unwrap()
        );
    }
}
