//! # Error Handling
//!
//! Error types shared by the job store, dispatcher and executor. Database
//! failures carry the operation that failed so a log line alone is enough to
//! locate the query.

use sea_orm::DbErr;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the optimization job store.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("database operation failed ({context}): {source}")]
    Database {
        context: &'static str,
        #[source]
        source: DbErr,
    },
    #[error("optimization job {0} not found")]
    NotFound(Uuid),
}

/// Logs a database failure with its context and wraps it.
pub fn map_db_err(context: &'static str, err: DbErr) -> JobStoreError {
    tracing::error!(error = ?err, context, "Database operation failed");
    JobStoreError::Database {
        context,
        source: err,
    }
}

/// Truncates upstream bodies before they are stored or logged.
pub fn body_snippet(body: &str, max_chars: usize) -> String {
    if body.chars().count() > max_chars {
        let truncated: String = body.chars().take(max_chars).collect();
        format!("{}...", truncated)
    } else {
        body.to_string()
    }
}
