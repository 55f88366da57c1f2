//! Crate-wide error taxonomy.
//!
//! Storage-layer code threads `anyhow::Result` internally the way the
//! engine's iterators and builders always have; at the public API boundary
//! (engine, query executor, cache) errors are converted into
//! [`SerengetiError`] so callers can match on a closed set of variants
//! instead of parsing messages, per the taxonomy in the design spec.

use std::io;

use thiserror::Error;

/// The crate-wide result alias.
pub type Result<T> = std::result::Result<T, SerengetiError>;

#[derive(Error, Debug)]
pub enum SerengetiError {
    /// SSTable footer, WAL header, or block checksum failed to validate.
    /// Fatal to the affected read; the engine is marked read-only.
    #[error("corrupt data: {0}")]
    CorruptData(String),

    /// Transient read/write failure. Retried with backoff in background
    /// tasks; surfaced directly for synchronous callers.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A query allocation exceeded its budget and no spill manager was
    /// registered for the operator.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// External sort / hash join spill I/O failed.
    #[error("spill error: {0}")]
    Spill(String),

    /// Query text could not be parsed.
    #[error("parse error at position {position}: {message}")]
    Parse { message: String, position: usize },

    /// The parsed statement could not be planned.
    #[error("plan error: {message}")]
    Plan { message: String },

    /// The query's cancellation token was signaled.
    #[error("cancelled")]
    Cancelled,

    /// The query exceeded its configured wall-clock timeout.
    #[error("timeout")]
    Timeout,

    /// A schema lookup (database, table, index, column) failed.
    #[error("not found: {0}")]
    NotFound(String),

    /// A create operation collided with an existing name.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The engine was marked read-only after a persistent flush failure.
    #[error("engine is read-only: {0}")]
    ReadOnly(String),
}

impl SerengetiError {
    /// A generic, client-safe message. Per the error-handling design, no
    /// internal detail (paths, stack context) crosses the query response
    /// boundary; the original error is logged instead via `tracing::error!`.
    pub fn client_message(&self) -> String {
        match self {
            SerengetiError::Parse { message, position } => {
                format!("parse error at position {position}: {message}")
            }
            SerengetiError::Plan { message } => format!("plan error: {message}"),
            SerengetiError::NotFound(what) => format!("not found: {what}"),
            SerengetiError::AlreadyExists(what) => format!("already exists: {what}"),
            SerengetiError::Cancelled => "query cancelled".to_string(),
            SerengetiError::Timeout => "query timed out".to_string(),
            SerengetiError::OutOfMemory(_) => "query exceeded its memory budget".to_string(),
            SerengetiError::Spill(_) => "query failed while spilling to disk".to_string(),
            SerengetiError::ReadOnly(_) => "storage engine is read-only".to_string(),
            SerengetiError::CorruptData(_) | SerengetiError::Io(_) => {
                "internal storage error".to_string()
            }
        }
    }
}

impl From<anyhow::Error> for SerengetiError {
    fn from(e: anyhow::Error) -> Self {
        SerengetiError::CorruptData(e.to_string())
    }
}
