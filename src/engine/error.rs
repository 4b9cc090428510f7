use thiserror::Error;
use ulid::Ulid;

use crate::db::StoreError;
use crate::model::Span;

/// Caller input rejected before any side effect.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("invalid time range: end must be after start")]
    EmptyRange,
    #[error("malformed timestamp {0:?}")]
    MalformedTimestamp(String),
    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),
    #[error("local time {0} does not exist in the requested timezone")]
    NonexistentLocalTime(String),
    #[error("timestamp out of range")]
    TimestampOutOfRange,
    #[error("span too wide")]
    SpanTooWide,
    #[error("weight {0} outside [1, 5]")]
    WeightOutOfRange(u8),
    #[error("max price must be positive")]
    NonPositivePrice,
    #[error("coordinates out of range")]
    InvalidCoordinates,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("availability index not loaded")]
    NotLoaded,
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("user {user} does not own {entity}")]
    NotOwner { user: Ulid, entity: Ulid },
    #[error("booking {0} has already started")]
    AlreadyStarted(Ulid),
    #[error("booking {0} is not active")]
    NotActive(Ulid),
    #[error("request {0} is not in a state that allows this transition")]
    InvalidTransition(Ulid),
    #[error("window [{}, {}) overlaps existing availability or bookings", .0.start, .0.end)]
    Overlap(Span),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}
