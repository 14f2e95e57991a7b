//! Consolidate Core Library
//!
//! Patient identity resolution and record consolidation for a retina
//! screening records store.
//!
//! # Architecture
//!
//! ```text
//!   External feed snapshot          Local store (SQLite)
//!            │                               │
//!            └──────────────┬────────────────┘
//!                           ▼
//!                  Name Normalizer  ──► name keys
//!                           │
//!                  Field Reconciler ──► corrected demographics
//!                           │
//!                  Identity Matcher ──► equivalence classes
//!                           │
//!                  Record Merger    ──► one patient per class
//!                           │
//!               Image Identity Resolver ──► stable image ids,
//!                           │               audited pointer rewrites
//!                           ▼
//!                  Integrity Auditor ──► clean / defects
//! ```
//!
//! # Core Principle
//!
//! **Preview first.** Every pass can be computed and reported without
//! writing; execution is a separate opt-in, and each unit of work commits
//! or rolls back on its own.
//!
//! # Modules
//!
//! - [`db`]: SQLite store with savepoint-scoped writes and the audit trail
//! - [`models`]: Domain types (Patient, Exam, ExamImage, MedicalReport, ...)
//! - [`identity`]: Name normalizer and identity matcher
//! - [`reconcile`]: Field reconciler, external feed, location resolution, ingest
//! - [`merge`]: Record merger
//! - [`images`]: Image identity resolver and derived-image pruning
//! - [`integrity`]: Read-only integrity auditor
//! - [`pipeline`]: Pass orchestration and summaries
//! - [`config`]: Pipeline configuration

pub mod config;
pub mod db;
pub mod identity;
pub mod images;
pub mod integrity;
pub mod merge;
pub mod models;
pub mod pipeline;
pub mod reconcile;

// Re-export commonly used types
pub use crate::config::{ConfigError, PipelineConfig};
pub use db::{Database, DbError, NameQuery};
pub use identity::{IdentityMatcher, NameNormalizer, NormalizeMode};
pub use integrity::{AuditReport, IntegrityAuditor};
pub use models::{Exam, ExamImage, MedicalReport, Patient, PatientReferral, SelectedImages};
pub use pipeline::{PassSummary, Pipeline, RunMode, RunReport};
pub use reconcile::{ExternalFeed, FeedError, JsonSnapshotFeed};

use thiserror::Error;

/// Errors surfaced by the passes.
#[derive(Error, Debug)]
pub enum ConsolidateError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A unit found a state it must not write through; its changes roll back.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<rusqlite::Error> for ConsolidateError {
    fn from(err: rusqlite::Error) -> Self {
        ConsolidateError::Db(err.into())
    }
}

pub type Result<T> = std::result::Result<T, ConsolidateError>;
