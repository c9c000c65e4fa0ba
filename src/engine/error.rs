use ulid::Ulid;

use crate::store::StoreError;

/// Which booking rule a request collided with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConflictKind {
    #[error("member already booked this facility on this day")]
    DuplicateBooking,
    #[error("member already holds overlapping reservation {0}")]
    MemberOverlap(Ulid),
    #[error("facility already reserved by {0} at that time")]
    FacilityOverlap(Ulid),
    #[error("trainer already runs template {0} at that time")]
    TemplateOverlap(Ulid),
    #[error("member already registered as {0}")]
    AlreadyRegistered(Ulid),
    #[error("session {0} is canceled")]
    SessionCanceled(Ulid),
    #[error("template {0} is inactive")]
    TemplateInactive(Ulid),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed input, rejected before any transaction opened.
    #[error("invalid request: {0}")]
    Validation(&'static str),
    #[error("conflict: {0}")]
    Conflict(ConflictKind),
    #[error("session {session} is full ({capacity} seats)")]
    CapacityExceeded { session: Ulid, capacity: u32 },
    #[error("member {member} already holds {limit} upcoming reservations")]
    QuotaExceeded { member: Ulid, limit: usize },
    /// A concurrent transaction won. Safe to retry the whole operation.
    #[error("concurrent update, retry the operation")]
    SerializationRetry,
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("storage: {0}")]
    Storage(#[source] StoreError),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::SerializationRetry)
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SerializationFailure => EngineError::SerializationRetry,
            other => EngineError::Storage(other),
        }
    }
}

impl From<ConflictKind> for EngineError {
    fn from(kind: ConflictKind) -> Self {
        EngineError::Conflict(kind)
    }
}
