use thiserror::Error;

use crate::history::PatchStatus;

/// Extract the full error message from a tokio_postgres::Error,
/// including the underlying DbError details that Display hides.
pub fn format_db_error(e: &tokio_postgres::Error) -> String {
    if let Some(db_err) = e.as_db_error() {
        let mut msg = db_err.message().to_string();
        if let Some(detail) = db_err.detail() {
            msg.push_str(&format!("\n  Detail: {}", detail));
        }
        if let Some(hint) = db_err.hint() {
            msg.push_str(&format!("\n  Hint: {}", hint));
        }
        if let Some(position) = db_err.position() {
            msg.push_str(&format!("\n  Position: {:?}", position));
        }
        return msg;
    }
    let mut msg = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(s) = source {
        msg.push_str(&format!(": {}", s));
        source = s.source();
    }
    msg
}

/// Render any error for storage in the history table.
///
/// Database errors carry their server-side detail; everything else uses Display.
pub fn error_message(e: &DriftError) -> String {
    match e {
        DriftError::DatabaseError(db) => format_db_error(db),
        other => other.to_string(),
    }
}

#[derive(Error, Debug)]
pub enum DriftError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {}", format_db_error(.0))]
    DatabaseError(#[from] tokio_postgres::Error),

    /// A catalog or row query failed while building a snapshot.
    #[error("Introspection of {object} failed: {reason}")]
    IntrospectionError { object: String, reason: String },

    /// Duplicate history rows, malformed patch files, conflicting registrations.
    #[error("Integrity error: {0}")]
    IntegrityError(String),

    #[error("Patch {version} ({name}) is in status {status}. Use --replay to apply it again.")]
    PatchStateError {
        version: String,
        name: String,
        status: PatchStatus,
    },

    #[error("Patch {version} ({name}) failed in block '{label}': {reason}")]
    ExecutionError {
        version: String,
        name: String,
        label: String,
        reason: String,
    },

    #[error("Failed to acquire advisory lock: {0}")]
    LockError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DriftError {
    /// Wrap a failed catalog query, naming the object being read.
    pub fn introspection(object: impl Into<String>, e: tokio_postgres::Error) -> Self {
        DriftError::IntrospectionError {
            object: object.into(),
            reason: format_db_error(&e),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriftError>;
