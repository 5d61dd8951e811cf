use crate::models::ListingStatus;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("`{operation}` failed ({kind:?}): {message}")]
pub struct LifecycleError {
    operation: &'static str,
    message: String,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Unauthorized,
    NotFound,
    InvalidTransition,
    ConcurrencyConflict,
    MediaLimitExceeded,
    InvalidStateForMediaChange,
    PriceChangeRejected,
    Security,
    Storage,
    StorageRejected,
    Internal,
}

impl ErrorKind {
    /// Only infrastructure failures are worth another attempt. Contention and
    /// rule violations are reported to the caller as-is.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Storage)
    }

    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_failed",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::ConcurrencyConflict => "concurrency_conflict",
            ErrorKind::MediaLimitExceeded => "media_limit_exceeded",
            ErrorKind::InvalidStateForMediaChange => "invalid_state_for_media_change",
            ErrorKind::PriceChangeRejected => "price_change_rejected",
            ErrorKind::Security => "security_violation",
            ErrorKind::Storage => "storage_unavailable",
            ErrorKind::StorageRejected => "storage_rejected",
            ErrorKind::Internal => "internal_error",
        }
    }
}

impl LifecycleError {
    fn new(operation: &'static str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
            kind,
        }
    }

    pub fn validation(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(operation, ErrorKind::Validation, message)
    }

    pub fn unauthorized(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(operation, ErrorKind::Unauthorized, message)
    }

    pub fn not_found(operation: &'static str, entity: &str, id: impl std::fmt::Display) -> Self {
        Self::new(operation, ErrorKind::NotFound, format!("{entity} {id} not found"))
    }

    pub fn invalid_transition(
        operation: &'static str,
        from: ListingStatus,
        to: ListingStatus,
    ) -> Self {
        Self::new(
            operation,
            ErrorKind::InvalidTransition,
            format!("cannot move listing from {from} to {to}"),
        )
    }

    pub fn conflict(operation: &'static str, listing_id: u64) -> Self {
        Self::new(
            operation,
            ErrorKind::ConcurrencyConflict,
            format!("listing {listing_id} was modified concurrently; re-read and retry"),
        )
    }

    pub fn media_limit(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(operation, ErrorKind::MediaLimitExceeded, message)
    }

    pub fn invalid_media_state(operation: &'static str, status: ListingStatus) -> Self {
        Self::new(
            operation,
            ErrorKind::InvalidStateForMediaChange,
            format!("cannot modify media when listing status is {status}"),
        )
    }

    pub fn price_rejected(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(operation, ErrorKind::PriceChangeRejected, message)
    }

    pub fn security(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(operation, ErrorKind::Security, message)
    }

    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(operation, ErrorKind::Storage, message)
    }

    pub fn storage_rejected(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(operation, ErrorKind::StorageRejected, message)
    }

    pub fn internal(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(operation, ErrorKind::Internal, message)
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
