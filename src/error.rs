//! Application error taxonomy.
//!
//! Permission errors are returned synchronously to API callers and never
//! retried. Fetch errors are transient: the poll cycle that hit one is
//! aborted and retried after its interval, with previous cached state
//! retained. Data errors (a malformed record, an unresolvable reference)
//! affect only the item that produced them.

use std::io;

use crate::maillog::WalkError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("permission denied: caller {caller:?} does not match served user {served:?}")]
    Permission { caller: String, served: String },

    #[error("fetch error: {0}")]
    Fetch(String),

    #[error("mail log error: {0}")]
    MailLog(#[from] WalkError),

    #[error("reference not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether this error marks a missing upstream reference (deleted
    /// repository, issue, or comment). Such items are skipped, not fatal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }
}
