//! Store-level errors and their mapping onto [`lbp_error::ErrorCode`].
//! Store errors are mapped to the shared taxonomy at this boundary, before
//! propagating further up.

use lbp_error::{ErrorCode, LbpError};

/// An error raised by a [`crate::Store`] operation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The addressed entity was not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// A unique constraint was violated.
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    /// A foreign key constraint was violated.
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),
    /// A not-null constraint was violated.
    #[error("not-null violation: {0}")]
    NotNullViolation(String),
    /// A check constraint was violated.
    #[error("check violation: {0}")]
    CheckViolation(String),
    /// Some other constraint was violated.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    /// Commit or rollback failed.
    #[error("transaction failed: {0}")]
    TxFailed(String),
    /// The store detected a deadlock.
    #[error("deadlock: {0}")]
    Deadlock(String),
    /// The store reported a serialization failure (retriable).
    #[error("serialization failure: {0}")]
    SerializationFailure(String),
    /// A lock could not be acquired (retriable).
    #[error("lock not available: {0}")]
    LockNotAvailable(String),
    /// The query was canceled (retriable).
    #[error("query canceled: {0}")]
    QueryCanceled(String),
    /// Data truncation (programmer error).
    #[error("data truncation: {0}")]
    DataTruncation(String),
    /// Numeric value out of range (programmer error).
    #[error("numeric out of range: {0}")]
    NumericOutOfRange(String),
    /// Invalid input syntax (programmer error).
    #[error("invalid input syntax: {0}")]
    InvalidInputSyntax(String),
    /// Undefined column (programmer error).
    #[error("undefined column: {0}")]
    UndefinedColumn(String),
    /// Undefined table (programmer error).
    #[error("undefined table: {0}")]
    UndefinedTable(String),
    /// Operation attempted by a non-owning leaser.
    #[error("lease mismatch: {0}")]
    LeaseMismatch(String),
    /// Catch-all for connectivity and other operational failures not
    /// otherwise classified; treated as retriable.
    #[error("operational failure: {0}")]
    Operational(String),
}

impl StoreError {
    /// Map this store error onto the unified [`ErrorCode`] taxonomy.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::UniqueViolation(_) => ErrorCode::UniqueViolation,
            Self::ForeignKeyViolation(_) => ErrorCode::ForeignKeyViolation,
            Self::NotNullViolation(_) => ErrorCode::NotNullViolation,
            Self::CheckViolation(_) => ErrorCode::CheckViolation,
            Self::ConstraintViolation(_) => ErrorCode::ConstraintViolation,
            Self::TxFailed(_) => ErrorCode::TxFailed,
            Self::Deadlock(_) => ErrorCode::Deadlock,
            Self::SerializationFailure(_) => ErrorCode::SerializationFailure,
            Self::LockNotAvailable(_) => ErrorCode::LockNotAvailable,
            Self::QueryCanceled(_) => ErrorCode::QueryCanceled,
            Self::DataTruncation(_) => ErrorCode::DataTruncation,
            Self::NumericOutOfRange(_) => ErrorCode::NumericOutOfRange,
            Self::InvalidInputSyntax(_) => ErrorCode::InvalidInputSyntax,
            Self::UndefinedColumn(_) => ErrorCode::UndefinedColumn,
            Self::UndefinedTable(_) => ErrorCode::UndefinedTable,
            Self::LeaseMismatch(_) => ErrorCode::LeaseMismatch,
            // Unclassified operational failures retry the same as the
            // named operational kinds.
            Self::Operational(_) => ErrorCode::QueryCanceled,
        }
    }
}

impl From<StoreError> for LbpError {
    fn from(err: StoreError) -> Self {
        let code = err.code();
        LbpError::new(code, err.to_string())
    }
}

/// Map a raw `sqlx::Error` onto [`StoreError`] by inspecting the
/// SQLSTATE-derived database error code
pub fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound("row not found".into()),
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_string();
            match db_err.code().as_deref() {
                Some("23505") => StoreError::UniqueViolation(message),
                Some("23503") => StoreError::ForeignKeyViolation(message),
                Some("23502") => StoreError::NotNullViolation(message),
                Some("23514") => StoreError::CheckViolation(message),
                Some(c) if c.starts_with("23") => StoreError::ConstraintViolation(message),
                Some("40P01") => StoreError::Deadlock(message),
                Some("40001") => StoreError::SerializationFailure(message),
                Some("55P03") => StoreError::LockNotAvailable(message),
                Some("57014") => StoreError::QueryCanceled(message),
                Some("22001") => StoreError::DataTruncation(message),
                Some("22003") => StoreError::NumericOutOfRange(message),
                Some("22P02") => StoreError::InvalidInputSyntax(message),
                Some("42703") => StoreError::UndefinedColumn(message),
                Some("42P01") => StoreError::UndefinedTable(message),
                _ => StoreError::Operational(message),
            }
        }
        sqlx::Error::PoolTimedOut => StoreError::Operational("pool timed out".into()),
        sqlx::Error::Io(e) => StoreError::Operational(format!("io error: {e}")),
        other => StoreError::Operational(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_not_found_code() {
        assert_eq!(StoreError::NotFound("x".into()).code(), ErrorCode::NotFound);
    }

    #[test]
    fn lease_mismatch_maps_to_lease_category() {
        let err = StoreError::LeaseMismatch("wrong leaser".into());
        assert_eq!(err.code(), ErrorCode::LeaseMismatch);
        assert!(!err.code().is_breaker_relevant());
    }

    #[test]
    fn deadlock_is_retriable() {
        assert!(StoreError::Deadlock("x".into()).code().is_retriable());
    }

    #[test]
    fn data_truncation_is_not_retriable() {
        assert!(!StoreError::DataTruncation("x".into()).code().is_retriable());
    }

    #[test]
    fn into_lbp_error_preserves_code_and_message() {
        let store_err = StoreError::UniqueViolation("backend.name".into());
        let lbp_err: LbpError = store_err.into();
        assert_eq!(lbp_err.code, ErrorCode::UniqueViolation);
        assert!(lbp_err.message.contains("backend.name"));
    }
}
