//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the control layer returns a `BayouError`
//! carrying an [`ErrorKind`] drawn from the wire taxonomy. Kinds are never
//! collapsed on the way up: wrapping may add context but must preserve the
//! original kind (see the propagation policy in the crate docs).

use std::fmt;

use crate::storage::StoreError;

/// Stable wire-visible error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller supplied a malformed argument (bad revision, malformed path…).
    BadValue,
    /// Requested revision is not (or no longer) present in the log.
    RevisionNotAvailable,
    /// Conditional append lost the race; internal retry signal.
    PathNotEmpty,
    /// Storage or wait operation exceeded its deadline.
    TimedOut,
    /// Caller cancelled the operation.
    Aborted,
    /// Retry loop exceeded its backoff budget.
    TooManyRetries,
    /// An existing change failed to decode or violated an invariant on read.
    StorageCorrupt,
    /// A delta-algebra law was violated (e.g. compose result isn't a document).
    InvariantViolation,
    /// `caretId` has no live session.
    UnknownSession,
    /// `caretId` is live but bound to a different author.
    WrongAuthor,
    /// Storage transaction was aborted by the store (not a conflict).
    TransactionAborted,
}

impl ErrorKind {
    /// The string code used on the wire (§6 of the design).
    pub fn as_wire_code(self) -> &'static str {
        match self {
            ErrorKind::BadValue => "bad_value",
            ErrorKind::RevisionNotAvailable => "revision_not_available",
            ErrorKind::PathNotEmpty => "path_not_empty",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::Aborted => "aborted",
            ErrorKind::TooManyRetries => "too_many_retries",
            ErrorKind::StorageCorrupt => "storage_corrupt",
            ErrorKind::InvariantViolation => "invariant_violation",
            ErrorKind::UnknownSession => "unknown_session",
            ErrorKind::WrongAuthor => "wrong_author",
            ErrorKind::TransactionAborted => "transaction_aborted",
        }
    }

    /// Whether this kind marks the owning `DocComplex` as permanently failed.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::StorageCorrupt | ErrorKind::InvariantViolation)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire_code())
    }
}

/// The crate's error type. Carries a kind (never discarded by wrapping),
/// a human-readable message, and an optional underlying cause.
#[derive(Debug)]
pub struct BayouError {
    pub kind: ErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl BayouError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), source: None }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self { kind, message: message.into(), source: Some(Box::new(source)) }
    }

    pub fn bad_value(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadValue, message)
    }

    pub fn revision_not_available(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RevisionNotAvailable, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TimedOut, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Aborted, message)
    }

    pub fn too_many_retries(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TooManyRetries, message)
    }

    pub fn storage_corrupt(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StorageCorrupt, message)
    }

    pub fn invariant_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvariantViolation, message)
    }

    pub fn unknown_session(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownSession, message)
    }

    pub fn wrong_author(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::WrongAuthor, message)
    }
}

impl fmt::Display for BayouError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for BayouError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Maps storage-layer error kinds onto the core taxonomy without discarding
/// the distinction between a lost-race conflict and a genuine failure.
impl From<StoreError> for BayouError {
    fn from(e: StoreError) -> Self {
        let kind = match &e {
            StoreError::PathNotEmpty(_) => ErrorKind::PathNotEmpty,
            StoreError::PathHashMismatch(_) => ErrorKind::PathNotEmpty,
            StoreError::TimedOut => ErrorKind::TimedOut,
            StoreError::TransactionAborted(_) => ErrorKind::TransactionAborted,
            StoreError::NotFound(_) => ErrorKind::BadValue,
            StoreError::Database(_)
            | StoreError::Serialization(_)
            | StoreError::Deserialization(_)
            | StoreError::Compression(_)
            | StoreError::Io(_) => ErrorKind::StorageCorrupt,
        };
        let message = e.to_string();
        BayouError::with_source(kind, message, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_match_taxonomy() {
        assert_eq!(ErrorKind::PathNotEmpty.as_wire_code(), "path_not_empty");
        assert_eq!(ErrorKind::TooManyRetries.as_wire_code(), "too_many_retries");
    }

    #[test]
    fn fatal_kinds_are_exactly_corruption_and_invariant() {
        assert!(ErrorKind::StorageCorrupt.is_fatal());
        assert!(ErrorKind::InvariantViolation.is_fatal());
        assert!(!ErrorKind::TimedOut.is_fatal());
        assert!(!ErrorKind::BadValue.is_fatal());
    }

    #[test]
    fn store_error_conflict_maps_to_path_not_empty() {
        let err: BayouError = StoreError::PathNotEmpty("/body/change/3".into()).into();
        assert_eq!(err.kind, ErrorKind::PathNotEmpty);
    }
}
