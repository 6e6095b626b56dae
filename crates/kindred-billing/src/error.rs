//! Unified error handling for kindred-billing
//!
//! Expected billing outcomes (insufficient credits, quota denials, queueing)
//! are NOT errors - they are typed results returned by the services. Only
//! datastore failures and ledger corruption surface here.

use thiserror::Error;

/// Core error type for kindred-billing
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Account {0} is frozen; writes are halted pending reconciliation")]
    AccountFrozen(String),

    #[error(
        "Ledger inconsistency for account {account_id}: transaction fold is {ledger_total} \
         but cached balance is {cached_total}"
    )]
    LedgerInconsistency {
        account_id: String,
        ledger_total: i64,
        cached_total: i64,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for kindred-billing
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

// Convert to String for app-backend command returns
impl From<Error> for String {
    fn from(err: Error) -> Self {
        err.to_string()
    }
}
