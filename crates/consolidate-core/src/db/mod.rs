//! Database layer for the screening records store.

mod schema;
mod patients;
mod exams;
mod reports;
mod history;

pub use schema::*;
#[allow(unused_imports)]
pub use patients::*;
#[allow(unused_imports)]
pub use exams::*;
#[allow(unused_imports)]
pub use reports::*;
pub use history::*;

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database connection wrapper.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open database at path, creating if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Create in-memory database (for testing).
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Initialize schema.
    fn initialize(&self) -> DbResult<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Get raw connection (for advanced queries).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside a named savepoint.
    ///
    /// On `Ok` the savepoint is released; on `Err` every write made inside it
    /// is rolled back and the error is returned. Savepoints nest, so a unit of
    /// work can fail and roll back alone inside an enclosing batch.
    pub fn atomically<T, E, F>(&self, name: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(&Database) -> Result<T, E>,
        E: From<DbError>,
    {
        let name = savepoint_name(name);
        self.conn
            .execute_batch(&format!("SAVEPOINT {name}"))
            .map_err(DbError::from)?;

        match f(self) {
            Ok(value) => {
                self.conn
                    .execute_batch(&format!("RELEASE {name}"))
                    .map_err(DbError::from)?;
                Ok(value)
            }
            Err(err) => {
                // ROLLBACK TO leaves the savepoint open; RELEASE closes it.
                let rollback = format!("ROLLBACK TO {name}; RELEASE {name}");
                if let Err(rollback_err) = self.conn.execute_batch(&rollback) {
                    tracing::error!(savepoint = %name, error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

/// Savepoint names are identifiers; keep only `[A-Za-z0-9_]`.
fn savepoint_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("sp_{cleaned}")
}
