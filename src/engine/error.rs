use thiserror::Error;
use ulid::Ulid;

use crate::model::{AppointmentStatus, DayKey};

/// Why a booking request or an offered day was refused. Expected and recoverable:
/// the caller re-prompts for another date or time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("{day} is outside the booking window ({earliest} to {latest})")]
    OutsideHorizon {
        day: DayKey,
        earliest: DayKey,
        latest: DayKey,
    },
    #[error("bookings need at least {lead_minutes} minutes notice")]
    TooSoon { lead_minutes: i64 },
    #[error("closed on {0}")]
    Closed(DayKey),
    #[error("requested time is outside business hours")]
    OutsideBusinessHours,
    #[error("requested time does not start on a bookable slot")]
    NotOnSlotBoundary,
    #[error("online payments are disabled")]
    PaymentsDisabled,
    #[error("proposed end must be after its start")]
    EmptyInterval,
    #[error("payment deadline must be in the future")]
    DeadlineInPast,
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed settings or service definition. Surfaced to the operator, never defaulted.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("policy rejection: {0}")]
    Policy(#[from] PolicyViolation),
    #[error("conflict with appointment: {0}")]
    Conflict(Ulid),
    #[error("illegal transition for {id}: cannot {action} from {from}")]
    IllegalTransition {
        id: Ulid,
        from: AppointmentStatus,
        action: &'static str,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    /// Journal write failed or timed out. Nothing was applied.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl EngineError {
    pub fn not_found(id: impl ToString) -> Self {
        EngineError::NotFound(id.to_string())
    }

    /// Stable machine-readable kind, used on the wire and as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Configuration(_) => "configuration",
            EngineError::Policy(_) => "policy",
            EngineError::Conflict(_) => "conflict",
            EngineError::IllegalTransition { .. } => "illegal_transition",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::StoreUnavailable(_) => "store_unavailable",
        }
    }

    /// Actionable message for end users. Integration errors stay generic.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Conflict(_) => {
                "this time is no longer available, please choose another".to_string()
            }
            EngineError::Policy(v) => format!("{v}, please choose another date or time"),
            EngineError::Configuration(msg) => format!("invalid settings: {msg}"),
            EngineError::NotFound(what) => format!("{what} was not found"),
            EngineError::LimitExceeded(what) => format!("request rejected: {what}"),
            EngineError::StoreUnavailable(_) => {
                "the calendar is temporarily unavailable, nothing was changed; try again".to_string()
            }
            EngineError::IllegalTransition { .. } | EngineError::AlreadyExists(_) => {
                "this request could not be processed".to_string()
            }
        }
    }
}
