//! Selected-image audit trail.
//!
//! Append-only and hash chained: each entry stores
//! `entry_hash = SHA-256(prev_hash || payload)`, so editing or deleting a
//! past row breaks every hash after it.

use rusqlite::{params, OptionalExtension, ToSql};
use sha2::{Digest, Sha256};

use super::{Database, DbResult};
use crate::models::{MedicalReport, SelectedImages, SelectedImagesChange};

/// A stored audit entry.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub seq: i64,
    pub change: SelectedImagesChange,
    pub prev_hash: String,
    pub entry_hash: String,
}

/// Outcome of re-hashing the whole trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStatus {
    Intact { entries: usize },
    Broken { at_seq: i64 },
}

impl Database {
    /// Append a pointer change. Returns the new entry hash.
    pub fn append_selected_images_change(&self, change: &SelectedImagesChange) -> DbResult<String> {
        let payload = change.to_canonical_json()?;
        let prev_hash = self.last_history_hash()?.unwrap_or_default();
        let entry_hash = chain_hash(&prev_hash, &payload);

        self.conn.execute(
            r#"
            INSERT INTO selected_images_history (report_id, payload, prev_hash, entry_hash)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![change.report_id, payload, prev_hash, entry_hash],
        )?;
        Ok(entry_hash)
    }

    /// Replace a report's pointers and record the change in the trail.
    ///
    /// Call inside the unit's savepoint so both writes land together.
    pub fn rewrite_selected_images(
        &self,
        report: &MedicalReport,
        new: &SelectedImages,
        reason: &str,
        actor: &str,
    ) -> DbResult<String> {
        let change = SelectedImagesChange {
            report_id: report.id.clone(),
            previous: report.selected_images.clone(),
            new: new.clone(),
            reason: reason.to_string(),
            changed_by: actor.to_string(),
            changed_at: chrono::Utc::now().to_rfc3339(),
        };
        let entry_hash = self.append_selected_images_change(&change)?;
        self.update_selected_images(&report.id, new)?;
        Ok(entry_hash)
    }

    /// History of one report, oldest first.
    pub fn list_selected_images_history(&self, report_id: &str) -> DbResult<Vec<HistoryEntry>> {
        self.query_history("WHERE report_id = ?", report_id)
    }

    /// Every entry with `seq >= since`, oldest first.
    pub fn list_selected_images_history_since(&self, since: i64) -> DbResult<Vec<HistoryEntry>> {
        self.query_history("WHERE seq >= ?", since)
    }

    fn query_history(&self, filter: &str, param: impl ToSql) -> DbResult<Vec<HistoryEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT seq, payload, prev_hash, entry_hash FROM selected_images_history {filter} ORDER BY seq"
        ))?;
        let rows = stmt.query_map([param], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (seq, payload, prev_hash, entry_hash) = row?;
            entries.push(HistoryEntry {
                seq,
                change: serde_json::from_str(&payload)?,
                prev_hash,
                entry_hash,
            });
        }
        Ok(entries)
    }

    /// Re-hash the whole trail and report the first inconsistent entry.
    pub fn verify_audit_chain(&self) -> DbResult<ChainStatus> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, payload, prev_hash, entry_hash FROM selected_images_history ORDER BY seq",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut expected_prev = String::new();
        let mut entries = 0;
        for row in rows {
            let (seq, payload, prev_hash, entry_hash) = row?;
            if prev_hash != expected_prev || chain_hash(&prev_hash, &payload) != entry_hash {
                return Ok(ChainStatus::Broken { at_seq: seq });
            }
            expected_prev = entry_hash;
            entries += 1;
        }
        Ok(ChainStatus::Intact { entries })
    }

    fn last_history_hash(&self) -> DbResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT entry_hash FROM selected_images_history ORDER BY seq DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }
}

/// SHA-256 over the previous hash followed by the payload, hex encoded.
pub fn chain_hash(prev_hash: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}
