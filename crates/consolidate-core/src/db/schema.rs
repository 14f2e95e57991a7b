//! SQLite schema definition.

/// Complete database schema for the screening records store.
pub const SCHEMA: &str = r#"
-- Enable foreign keys
PRAGMA foreign_keys = ON;

-- ============================================================================
-- Patients
-- ============================================================================

CREATE TABLE IF NOT EXISTS patients (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    name_key TEXT NOT NULL DEFAULT '',           -- deep-normalized name for lookups
    cpf TEXT,                                    -- digits only
    birth_date TEXT,                             -- YYYY-MM-DD
    gender TEXT,
    underlying_diseases TEXT NOT NULL DEFAULT '{}',   -- JSON object {condition: bool}
    ophthalmic_diseases TEXT NOT NULL DEFAULT '{}',   -- JSON object {condition: bool}
    manually_verified INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_patients_name_key ON patients(name_key);
CREATE INDEX IF NOT EXISTS idx_patients_cpf ON patients(cpf);

-- ============================================================================
-- Exams
-- ============================================================================

-- No ON DELETE CASCADE anywhere below: deleting a parent that still owns
-- children must fail rather than drop clinical data.
CREATE TABLE IF NOT EXISTS exams (
    id TEXT PRIMARY KEY,
    patient_id TEXT NOT NULL REFERENCES patients(id),
    exam_date TEXT NOT NULL,
    location TEXT,
    technician_name TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'in_analysis', 'completed')),
    external_id TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_exams_patient ON exams(patient_id);
CREATE INDEX IF NOT EXISTS idx_exams_external_id ON exams(external_id);

CREATE TABLE IF NOT EXISTS exam_images (
    id TEXT PRIMARY KEY,
    exam_id TEXT NOT NULL REFERENCES exams(id),
    url TEXT NOT NULL,
    file_name TEXT NOT NULL DEFAULT '',
    image_type TEXT NOT NULL DEFAULT 'COLOR'
        CHECK (image_type IN ('COLOR', 'ANTERIOR', 'REDFREE')),
    uploaded_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_images_exam ON exam_images(exam_id);
CREATE INDEX IF NOT EXISTS idx_images_url ON exam_images(url);

-- ============================================================================
-- Reports and Referrals (at most one per exam)
-- ============================================================================

CREATE TABLE IF NOT EXISTS medical_reports (
    id TEXT PRIMARY KEY,
    exam_id TEXT NOT NULL UNIQUE REFERENCES exams(id),
    doctor_name TEXT NOT NULL,
    doctor_crm TEXT,
    findings TEXT,
    diagnosis TEXT,
    recommendations TEXT,
    diagnostic_conditions TEXT NOT NULL DEFAULT '{}',  -- JSON object {condition: bool}
    selected_images TEXT NOT NULL DEFAULT '{}',        -- JSON object {od, oe}
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS patient_referrals (
    id TEXT PRIMARY KEY,
    exam_id TEXT NOT NULL UNIQUE REFERENCES exams(id),
    referred_by TEXT NOT NULL,
    specialty TEXT NOT NULL,
    urgency TEXT NOT NULL CHECK (urgency IN ('routine', 'urgent', 'emergency')),
    notes TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    outcome TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- ============================================================================
-- Selected-image audit trail (append-only, hash chained)
-- ============================================================================

CREATE TABLE IF NOT EXISTS selected_images_history (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    report_id TEXT NOT NULL,
    payload TEXT NOT NULL,                       -- canonical JSON of the change
    prev_hash TEXT NOT NULL,                     -- entry_hash of the previous row, '' for the first
    entry_hash TEXT NOT NULL UNIQUE,             -- SHA-256(prev_hash || payload)
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_history_report ON selected_images_history(report_id);

CREATE TRIGGER IF NOT EXISTS selected_images_history_no_update
BEFORE UPDATE ON selected_images_history
BEGIN
    SELECT RAISE(ABORT, 'Audit trail is append-only');
END;
"#;
