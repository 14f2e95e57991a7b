//! Reconciliation against the external source-of-truth feed.
//!
//! - [`fields`]: per-field rules shared with the merger
//! - [`feed`]: feed snapshot loading and lookup
//! - [`locations`]: exam location resolution
//! - the reconcile and ingest passes

pub mod feed;
pub mod fields;
mod ingest;
pub mod locations;
mod pass;

pub use feed::{aggregate_visits, ExternalFeed, FeedError, FeedImage, FeedIndex, FeedVisit, JsonSnapshotFeed};
pub use fields::{
    canonical_gender, cpf_digits, merge_flags, normalize_cpf, parse_feed_date, FieldName, FieldReconciler,
    FieldReport, IncomingSource, PatientFields, Reconciliation, Resolution, SourcePriority, UnverifiedPolicy,
};
pub use ingest::ingest_pass;
pub use locations::{LocationOutcome, LocationResolver};
pub use pass::reconcile_pass;
