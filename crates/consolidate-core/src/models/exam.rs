//! Exam and image models.

use serde::{Deserialize, Serialize};

/// Review lifecycle of an exam.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExamStatus {
    Pending,
    InAnalysis,
    Completed,
}

impl ExamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExamStatus::Pending => "pending",
            ExamStatus::InAnalysis => "in_analysis",
            ExamStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExamStatus::Pending),
            "in_analysis" => Some(ExamStatus::InAnalysis),
            "completed" => Some(ExamStatus::Completed),
            _ => None,
        }
    }
}

/// One clinical visit, owned by exactly one patient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Exam {
    /// Primary key
    pub id: String,
    /// Owning patient
    pub patient_id: String,
    /// Visit date (RFC 3339 or YYYY-MM-DD)
    pub exam_date: String,
    /// Clinic display name, or an opaque source id awaiting resolution
    pub location: Option<String>,
    /// Technician who captured the images
    pub technician_name: Option<String>,
    /// Review status
    pub status: ExamStatus,
    /// Visit id in the external source, used for idempotent import
    pub external_id: Option<String>,
    /// Creation timestamp
    pub created_at: String,
}

impl Exam {
    /// Create a pending exam for a patient.
    pub fn new(patient_id: String, exam_date: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            patient_id,
            exam_date,
            location: None,
            technician_name: None,
            status: ExamStatus::Pending,
            external_id: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Capture modality of an exam image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageType {
    /// Color fundus photo
    Color,
    /// Anterior segment photo
    Anterior,
    /// Red-free photo, derived from the color capture
    RedFree,
}

impl ImageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageType::Color => "COLOR",
            ImageType::Anterior => "ANTERIOR",
            ImageType::RedFree => "REDFREE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "COLOR" => Some(ImageType::Color),
            "ANTERIOR" => Some(ImageType::Anterior),
            "REDFREE" | "RED_FREE" => Some(ImageType::RedFree),
            _ => None,
        }
    }

    /// Derived captures can be regenerated and are eligible for deletion.
    pub fn is_derived(&self) -> bool {
        matches!(self, ImageType::RedFree)
    }
}

/// One captured image belonging to an exam.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExamImage {
    /// Primary key; legacy rows carry positional ids
    pub id: String,
    /// Owning exam
    pub exam_id: String,
    /// Storage URL. Authoritative: never rewritten by any pass.
    pub url: String,
    /// Display filename
    pub file_name: String,
    /// Modality
    pub image_type: ImageType,
    /// Upload timestamp
    pub uploaded_at: String,
}
