//! Pass orchestration.
//!
//! Every pass walks its units (one equivalence class, one exam, one
//! patient) in order. In execute mode units are committed in batches of
//! `batch_size`, each batch inside one savepoint and each unit inside a
//! nested one, so a failing unit rolls back alone and the pass continues.
//! In preview mode nothing is written.

use std::fmt;

use serde::Serialize;

use crate::config::PipelineConfig;
use crate::db::Database;
use crate::integrity::{AuditReport, IntegrityAuditor};
use crate::reconcile::ExternalFeed;
use crate::{images, merge, reconcile, ConsolidateError, Result};

/// Whether a pass may write.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Compute and report only.
    #[default]
    Preview,
    /// Apply changes.
    Execute,
}

impl RunMode {
    pub fn from_execute_flag(execute: bool) -> Self {
        if execute {
            RunMode::Execute
        } else {
            RunMode::Preview
        }
    }

    pub fn is_execute(&self) -> bool {
        *self == RunMode::Execute
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunMode::Preview => "preview",
            RunMode::Execute => "execute",
        })
    }
}

/// The passes.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PassKind {
    Ingest,
    Reconcile,
    Merge,
    MigrateImages,
    PruneDerived,
    RevertPointers,
}

impl PassKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassKind::Ingest => "ingest",
            PassKind::Reconcile => "reconcile",
            PassKind::Merge => "merge",
            PassKind::MigrateImages => "migrate-images",
            PassKind::PruneDerived => "prune-derived",
            PassKind::RevertPointers => "revert-pointers",
        }
    }
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Findings and summaries
// ============================================================================

/// Category of a reported item.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    Applied,
    Ambiguous,
    Locked,
    Failed,
    Unresolved,
    Unverifiable,
    Discrepancy,
    NearMatch,
    Skipped,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingKind::Applied => "applied",
            FindingKind::Ambiguous => "ambiguous",
            FindingKind::Locked => "locked",
            FindingKind::Failed => "failed",
            FindingKind::Unresolved => "unresolved",
            FindingKind::Unverifiable => "unverifiable",
            FindingKind::Discrepancy => "discrepancy",
            FindingKind::NearMatch => "near-match",
            FindingKind::Skipped => "skipped",
        }
    }
}

/// One line of pass output meant for an operator.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Finding {
    /// Record the finding is about (patient id, exam id, name key, ...)
    pub subject: String,
    pub kind: FindingKind,
    pub detail: String,
}

impl Finding {
    pub fn new(kind: FindingKind, subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            kind,
            detail: detail.into(),
        }
    }
}

/// How one unit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Applied,
    Unchanged,
    SkippedAmbiguous,
    SkippedLocked,
}

/// What a unit did, returned by the per-pass unit functions.
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub outcome: UnitOutcome,
    /// References left unresolved by this unit
    pub unresolved: usize,
    pub findings: Vec<Finding>,
}

impl UnitReport {
    pub fn new(outcome: UnitOutcome) -> Self {
        Self {
            outcome,
            unresolved: 0,
            findings: Vec::new(),
        }
    }

    pub fn applied() -> Self {
        Self::new(UnitOutcome::Applied)
    }

    pub fn unchanged() -> Self {
        Self::new(UnitOutcome::Unchanged)
    }

    pub fn ambiguous(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(UnitOutcome::SkippedAmbiguous).with(Finding::new(FindingKind::Ambiguous, subject, reason))
    }

    pub fn locked(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(UnitOutcome::SkippedLocked).with(Finding::new(FindingKind::Locked, subject, reason))
    }

    pub fn with(mut self, finding: Finding) -> Self {
        self.push(finding);
        self
    }

    pub fn push(&mut self, finding: Finding) {
        if finding.kind == FindingKind::Unresolved {
            self.unresolved += 1;
        }
        self.findings.push(finding);
    }
}

/// Before/after counts of one pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub pass: PassKind,
    pub mode: RunMode,
    /// Units visited
    pub examined: usize,
    /// Units changed (or that would change, in preview)
    pub applied: usize,
    pub unchanged: usize,
    pub skipped_ambiguous: usize,
    pub skipped_locked: usize,
    /// Units rolled back after an error
    pub failed: usize,
    /// References that could not be resolved
    pub unresolved: usize,
    pub findings: Vec<Finding>,
}

impl PassSummary {
    pub fn new(pass: PassKind, mode: RunMode) -> Self {
        Self {
            pass,
            mode,
            examined: 0,
            applied: 0,
            unchanged: 0,
            skipped_ambiguous: 0,
            skipped_locked: 0,
            failed: 0,
            unresolved: 0,
            findings: Vec::new(),
        }
    }

    /// Count a finished unit.
    pub fn record(&mut self, report: UnitReport) {
        self.examined += 1;
        match report.outcome {
            UnitOutcome::Applied => self.applied += 1,
            UnitOutcome::Unchanged => self.unchanged += 1,
            UnitOutcome::SkippedAmbiguous => self.skipped_ambiguous += 1,
            UnitOutcome::SkippedLocked => self.skipped_locked += 1,
        }
        self.unresolved += report.unresolved;
        self.findings.extend(report.findings);
    }

    /// Count a rolled-back unit.
    pub fn record_failure(&mut self, subject: &str, err: &ConsolidateError) {
        self.examined += 1;
        self.failed += 1;
        self.findings
            .push(Finding::new(FindingKind::Failed, subject, err.to_string()));
    }

    /// Add a finding that is not tied to a unit outcome.
    pub fn note(&mut self, finding: Finding) {
        if finding.kind == FindingKind::Unresolved {
            self.unresolved += 1;
        }
        self.findings.push(finding);
    }

    pub fn findings_of(&self, kind: FindingKind) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.kind == kind)
    }
}

impl fmt::Display for PassSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}] {}", self.pass, self.mode)?;
        writeln!(f, "  examined              {:>6}", self.examined)?;
        writeln!(f, "  applied               {:>6}", self.applied)?;
        writeln!(f, "  unchanged             {:>6}", self.unchanged)?;
        writeln!(f, "  skipped (ambiguous)   {:>6}", self.skipped_ambiguous)?;
        writeln!(f, "  skipped (locked)      {:>6}", self.skipped_locked)?;
        writeln!(f, "  failed (error)        {:>6}", self.failed)?;
        writeln!(f, "  unresolved            {:>6}", self.unresolved)?;
        for finding in &self.findings {
            writeln!(f, "  - {:<12} {}: {}", finding.kind.as_str(), finding.subject, finding.detail)?;
        }
        Ok(())
    }
}

// ============================================================================
// Unit runner
// ============================================================================

/// Run `process` over every unit and tally the results.
///
/// `label` names a unit in logs and failure findings.
pub(crate) fn run_units<U, L, P>(
    db: &Database,
    summary: &mut PassSummary,
    batch_size: usize,
    units: &[U],
    label: L,
    mut process: P,
) -> Result<()>
where
    L: Fn(&U) -> String,
    P: FnMut(&Database, &U) -> Result<UnitReport>,
{
    tracing::info!(pass = %summary.pass, mode = %summary.mode, units = units.len(), "pass started");

    if !summary.mode.is_execute() {
        for unit in units {
            let subject = label(unit);
            match process(db, unit) {
                Ok(report) => log_and_record(summary, &subject, report),
                Err(err) => {
                    tracing::error!(pass = %summary.pass, unit = %subject, error = %err, "unit failed");
                    summary.record_failure(&subject, &err);
                }
            }
        }
    } else {
        for (n, batch) in units.chunks(batch_size.max(1)).enumerate() {
            let batch_name = format!("{}_batch_{n}", summary.pass);
            db.atomically(&batch_name, |db| -> Result<()> {
                for unit in batch {
                    let subject = label(unit);
                    match db.atomically("unit", |db| process(db, unit)) {
                        Ok(report) => log_and_record(summary, &subject, report),
                        Err(err) => {
                            tracing::error!(pass = %summary.pass, unit = %subject, error = %err, "unit rolled back");
                            summary.record_failure(&subject, &err);
                        }
                    }
                }
                Ok(())
            })?;
            tracing::debug!(pass = %summary.pass, batch = n, size = batch.len(), "batch committed");
        }
    }

    tracing::info!(
        pass = %summary.pass,
        mode = %summary.mode,
        examined = summary.examined,
        applied = summary.applied,
        skipped_ambiguous = summary.skipped_ambiguous,
        skipped_locked = summary.skipped_locked,
        failed = summary.failed,
        unresolved = summary.unresolved,
        "pass finished"
    );
    Ok(())
}

fn log_and_record(summary: &mut PassSummary, subject: &str, report: UnitReport) {
    match report.outcome {
        UnitOutcome::Applied => tracing::debug!(pass = %summary.pass, unit = %subject, "applied"),
        UnitOutcome::Unchanged => tracing::trace!(pass = %summary.pass, unit = %subject, "unchanged"),
        UnitOutcome::SkippedAmbiguous => {
            tracing::warn!(pass = %summary.pass, unit = %subject, "skipped: ambiguous")
        }
        UnitOutcome::SkippedLocked => tracing::warn!(pass = %summary.pass, unit = %subject, "skipped: locked"),
    }
    if report.unresolved > 0 {
        tracing::warn!(pass = %summary.pass, unit = %subject, unresolved = report.unresolved, "unresolved references");
    }
    summary.record(report);
}

// ============================================================================
// Pipeline
// ============================================================================

/// Output of a full run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub passes: Vec<PassSummary>,
    pub audit: AuditReport,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.audit.is_clean() && self.passes.iter().all(|p| p.failed == 0)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for pass in &self.passes {
            writeln!(f, "{pass}")?;
        }
        write!(f, "{}", self.audit)
    }
}

/// Entry point tying the store and configuration to the passes.
pub struct Pipeline<'a> {
    db: &'a Database,
    config: PipelineConfig,
}

impl<'a> Pipeline<'a> {
    pub fn new(db: &'a Database, config: PipelineConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Create exams (and patients) for feed visits not yet in the store.
    pub fn ingest(&self, feed: &dyn ExternalFeed, mode: RunMode) -> Result<PassSummary> {
        reconcile::ingest_pass(self.db, feed, &self.config, mode)
    }

    /// Reconcile every patient and exam location against the feed.
    pub fn reconcile(&self, feed: &dyn ExternalFeed, mode: RunMode) -> Result<PassSummary> {
        reconcile::reconcile_pass(self.db, feed, &self.config, mode)
    }

    /// Group patients and merge every duplicate class.
    pub fn merge(&self, mode: RunMode) -> Result<PassSummary> {
        merge::merge_pass(self.db, &self.config, mode)
    }

    /// Give legacy image ids their stable id and rewrite report pointers.
    pub fn migrate_images(&self, mode: RunMode) -> Result<PassSummary> {
        images::migrate_pass(self.db, &self.config, mode)
    }

    /// Delete derived images no report selects.
    pub fn prune_derived(&self, mode: RunMode) -> Result<PassSummary> {
        images::prune_pass(self.db, &self.config, mode)
    }

    /// Undo audited selected-image changes.
    pub fn revert_pointers(&self, selection: &images::RevertSelection, mode: RunMode) -> Result<PassSummary> {
        images::revert_pass(self.db, &self.config, selection, mode)
    }

    /// Read-only integrity audit.
    pub fn audit(&self) -> Result<AuditReport> {
        Ok(IntegrityAuditor::new(self.db, &self.config).run()?)
    }

    /// reconcile → merge → migrate-images → audit.
    ///
    /// In preview mode each pass reports against the unchanged store.
    pub fn run(&self, feed: &dyn ExternalFeed, mode: RunMode) -> Result<RunReport> {
        let passes = vec![
            self.reconcile(feed, mode)?,
            self.merge(mode)?,
            self.migrate_images(mode)?,
        ];
        let audit = self.audit()?;
        Ok(RunReport { passes, audit })
    }
}
