//! Bond Store Error Types

use bond_core::LedgerError;
use thiserror::Error;

/// Store Result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Backend failure, before it is folded into the ledger taxonomy
#[derive(Debug, Error)]
pub enum StoreError {
    /// Statement failed in the database
    #[error("Database error: {message}")]
    Database {
        message: String,
        /// SQLSTATE when the backend reported one
        code: Option<String>,
    },

    /// Pool or socket failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// COMMIT whose outcome is unknown to the client. The transaction may
    /// already be durable, so it is never re-run automatically.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Row could not be mapped to a ledger type
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// SQLSTATE serialization_failure
pub const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE deadlock_detected
pub const SQLSTATE_DEADLOCK: &str = "40P01";
/// SQLSTATE unique_violation
pub const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";

impl StoreError {
    pub fn database(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Database {
            message: message.into(),
            code,
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::Database { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Serialization failures, deadlocks and pool timeouts may succeed on a
    /// fresh attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database { code, .. } => matches!(
                code.as_deref(),
                Some(SQLSTATE_SERIALIZATION_FAILURE) | Some(SQLSTATE_DEADLOCK)
            ),
            Self::Connection(_) => true,
            Self::Transaction(_) | Self::Serialization(_) => false,
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        let retryable = err.is_retryable();
        LedgerError::storage(err.to_string(), retryable)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => {
                Self::database(db.message().to_string(), db.code().map(|c| c.into_owned()))
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Connection(err.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
                Self::Serialization(err.to_string())
            }
            other => Self::database(other.to_string(), None),
        }
    }
}

#[cfg(feature = "postgres")]
impl StoreError {
    /// Classify a failed COMMIT.
    ///
    /// A SQLSTATE means the server answered and rolled the transaction back,
    /// so the usual classification applies. Anything else (lost socket,
    /// closed pool) leaves the outcome unknown.
    pub fn from_commit(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(_) => Self::from(err),
            other => Self::Transaction(format!("commit outcome unknown: {}", other)),
        }
    }
}
