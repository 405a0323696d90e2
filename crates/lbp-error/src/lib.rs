//! Unified error taxonomy with stable error codes for the LLM Backplane.
//!
//! Every error that crosses a crate boundary carries an [`ErrorCode`] (a
//! machine-readable, stable string tag), a human-readable message, an
//! optional cause chain, and arbitrary key-value context. Use the builder
//! returned by [`LbpError::new`] to construct errors fluently.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Addressed entity does not exist.
    NotFound,
    /// Store-level invariant breach (unique/FK/not-null/check/constraint).
    StoreConstraint,
    /// Store transaction bookkeeping failed.
    StoreTransaction,
    /// Store operational failure, generally retriable.
    StoreOperational,
    /// Programmer error surfaced by the store (bad SQL, bad types).
    StoreProgrammer,
    /// Upstream LLM vendor/backend failure.
    Upstream,
    /// Capability negotiation / resolution failure.
    Capability,
    /// Finish-reason mapping failure from an upstream completion.
    Completion,
    /// Circuit breaker refused to invoke a task this tick.
    Breaker,
    /// Job lease ownership violation.
    Lease,
    /// Validation failure at a public operation boundary.
    Validation,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::StoreConstraint => "store_constraint",
            Self::StoreTransaction => "store_transaction",
            Self::StoreOperational => "store_operational",
            Self::StoreProgrammer => "store_programmer",
            Self::Upstream => "upstream",
            Self::Capability => "capability",
            Self::Completion => "completion",
            Self::Breaker => "breaker",
            Self::Lease => "lease",
            Self::Validation => "validation",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Addressed entity absent.
    NotFound,
    /// Store unique constraint violated.
    UniqueViolation,
    /// Store foreign-key constraint violated.
    ForeignKeyViolation,
    /// Store not-null constraint violated.
    NotNullViolation,
    /// Store check constraint violated.
    CheckViolation,
    /// Store constraint violated (unspecified kind).
    ConstraintViolation,
    /// Commit or rollback failed; transaction itself is resolved.
    TxFailed,
    /// Store reported a deadlock.
    Deadlock,
    /// Store reported a serialization failure.
    SerializationFailure,
    /// Store reported a lock could not be acquired.
    LockNotAvailable,
    /// Store query was canceled.
    QueryCanceled,
    /// Store reported data truncation (programmer error).
    DataTruncation,
    /// Store reported a numeric value out of range (programmer error).
    NumericOutOfRange,
    /// Store reported invalid input syntax (programmer error).
    InvalidInputSyntax,
    /// Store reported an undefined column (programmer error).
    UndefinedColumn,
    /// Store reported an undefined table (programmer error).
    UndefinedTable,
    /// LLM client could not reach the upstream backend.
    UpstreamUnavailable,
    /// LLM client timed out waiting on the upstream backend.
    UpstreamTimeout,
    /// LLM client received an unparsable or structurally invalid response.
    UpstreamInvalidResponse,
    /// Requested capability not offered by the chosen provider.
    CapabilityUnsupported,
    /// Resolver found no provider satisfying the request.
    NoSatisfyingProvider,
    /// Upstream finish-reason mapped to a token-limit failure.
    TokenLimitReached,
    /// Upstream finish-reason mapped to content filtering.
    ContentFiltered,
    /// Upstream finish-reason mapped to an unexpected completion shape.
    UnexpectedCompletion,
    /// Runner refused to invoke the task this tick (breaker open).
    BreakerOpen,
    /// Job operation attempted by a non-owning leaser.
    LeaseMismatch,
    /// Validation failure at a public operation boundary.
    InvalidInput,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound => ErrorCategory::NotFound,

            Self::UniqueViolation
            | Self::ForeignKeyViolation
            | Self::NotNullViolation
            | Self::CheckViolation
            | Self::ConstraintViolation => ErrorCategory::StoreConstraint,

            Self::TxFailed => ErrorCategory::StoreTransaction,

            Self::Deadlock
            | Self::SerializationFailure
            | Self::LockNotAvailable
            | Self::QueryCanceled => ErrorCategory::StoreOperational,

            Self::DataTruncation
            | Self::NumericOutOfRange
            | Self::InvalidInputSyntax
            | Self::UndefinedColumn
            | Self::UndefinedTable => ErrorCategory::StoreProgrammer,

            Self::UpstreamUnavailable | Self::UpstreamTimeout | Self::UpstreamInvalidResponse => {
                ErrorCategory::Upstream
            }

            Self::CapabilityUnsupported | Self::NoSatisfyingProvider => ErrorCategory::Capability,

            Self::TokenLimitReached | Self::ContentFiltered | Self::UnexpectedCompletion => {
                ErrorCategory::Completion
            }

            Self::BreakerOpen => ErrorCategory::Breaker,
            Self::LeaseMismatch => ErrorCategory::Lease,
            Self::InvalidInput => ErrorCategory::Validation,
        }
    }

    /// Stable `&'static str` representation (e.g. `"NOT_FOUND"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::UniqueViolation => "UNIQUE_VIOLATION",
            Self::ForeignKeyViolation => "FOREIGN_KEY_VIOLATION",
            Self::NotNullViolation => "NOT_NULL_VIOLATION",
            Self::CheckViolation => "CHECK_VIOLATION",
            Self::ConstraintViolation => "CONSTRAINT_VIOLATION",
            Self::TxFailed => "TX_FAILED",
            Self::Deadlock => "DEADLOCK",
            Self::SerializationFailure => "SERIALIZATION_FAILURE",
            Self::LockNotAvailable => "LOCK_NOT_AVAILABLE",
            Self::QueryCanceled => "QUERY_CANCELED",
            Self::DataTruncation => "DATA_TRUNCATION",
            Self::NumericOutOfRange => "NUMERIC_OUT_OF_RANGE",
            Self::InvalidInputSyntax => "INVALID_INPUT_SYNTAX",
            Self::UndefinedColumn => "UNDEFINED_COLUMN",
            Self::UndefinedTable => "UNDEFINED_TABLE",
            Self::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            Self::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            Self::UpstreamInvalidResponse => "UPSTREAM_INVALID_RESPONSE",
            Self::CapabilityUnsupported => "CAPABILITY_UNSUPPORTED",
            Self::NoSatisfyingProvider => "NO_SATISFYING_PROVIDER",
            Self::TokenLimitReached => "TOKEN_LIMIT_REACHED",
            Self::ContentFiltered => "CONTENT_FILTERED",
            Self::UnexpectedCompletion => "UNEXPECTED_COMPLETION",
            Self::BreakerOpen => "BREAKER_OPEN",
            Self::LeaseMismatch => "LEASE_MISMATCH",
            Self::InvalidInput => "INVALID_INPUT",
        }
    }

    /// Whether the runner's retry helper should retry an operation that
    /// failed with this code propagation policy: only
    /// `{Deadlock, SerializationFailure, LockNotAvailable,
    /// UpstreamUnavailable, UpstreamTimeout}` are retried.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Deadlock
                | Self::SerializationFailure
                | Self::LockNotAvailable
                | Self::UpstreamUnavailable
                | Self::UpstreamTimeout
        )
    }

    /// Whether a failure with this code counts toward a circuit breaker
    /// trip, per `{UpstreamUnavailable, UpstreamTimeout, store
    /// operational}` count; `{NotFound, InvalidInput, LeaseMismatch}` never
    /// do.
    #[must_use]
    pub fn is_breaker_relevant(&self) -> bool {
        match self.category() {
            ErrorCategory::Upstream | ErrorCategory::StoreOperational => true,
            ErrorCategory::NotFound | ErrorCategory::Validation | ErrorCategory::Lease => false,
            _ => false,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// LbpError
// ---------------------------------------------------------------------------

/// Unified Backplane error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Examples
///
/// ```
/// use lbp_error::{ErrorCode, LbpError};
///
/// let err = LbpError::new(ErrorCode::UpstreamTimeout, "timed out after 30s")
///     .with_context("backend", "ollama-local")
///     .with_context("timeout_ms", 30_000);
/// assert_eq!(err.code, ErrorCode::UpstreamTimeout);
/// ```
pub struct LbpError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl LbpError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Shorthand for `self.code.is_retriable()`.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        self.code.is_retriable()
    }

    /// Shorthand for `self.code.is_breaker_relevant()`.
    #[must_use]
    pub fn is_breaker_relevant(&self) -> bool {
        self.code.is_breaker_relevant()
    }
}

impl fmt::Debug for LbpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("LbpError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for LbpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for LbpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Serialisable snapshot of an [`LbpError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LbpErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&LbpError> for LbpErrorDto {
    fn from(err: &LbpError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}
