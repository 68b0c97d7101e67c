//! Error types for the reconciliation core.
//!
//! Failures are scoped as narrowly as possible:
//!
//! * [`MergeError`]: one subject or one student cannot be merged. Subject
//!   level errors are turned into `SKIP` actions by the merge engine, student
//!   level errors into failure rows by the batch orchestrator.
//! * [`StoreError`]: what a record store collaborator reports. Only
//!   [`StoreError::NotFound`] means "no record yet".
//! * [`BatchError`]: the only error that stops a whole batch, raised before
//!   any student is touched.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MergeError {
    #[error("malformed subject: {reason}")]
    MalformedSubject { reason: String },

    #[error("invalid student id '{id}': expected 8-15 letters/digits with at least one digit")]
    InvalidStudentId { id: String },

    #[error("invalid academic period: {reason}")]
    InvalidPeriod { reason: String },

    /// The stored record belongs to another student or academic period.
    #[error("record mismatch: expected {expected}, found {found}")]
    RecordMismatch { expected: String, found: String },
}

impl MergeError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        MergeError::MalformedSubject {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("record store unavailable: {0}")]
    Unavailable(String),

    #[error("record store error: {0}")]
    Backend(String),

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("record store unavailable before batch start: {0}")]
    StoreUnavailable(#[source] StoreError),
}
