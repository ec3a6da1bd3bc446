use ulid::Ulid;

use crate::model::Ms;

/// Caller-correctable scheduling failures. Nothing is mutated when one is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Unknown slot id.
    NotFound(Ulid),
    /// The slot is booked, or held by another customer.
    SlotUnavailable(Ulid),
    AlreadyQueued { provider_id: Ulid, customer_id: Ulid },
    NotQueued { provider_id: Ulid, customer_id: Ulid },
    NoCustomerInProgress(Ulid),
    CustomerInProgress { provider_id: Ulid, customer_id: Ulid },
    HoldNotOwned(Ulid),
    HoldExpired { slot_id: Ulid, expired_at: Ms },
    NotHeld(Ulid),
    InvalidRange(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::SlotUnavailable(_) => "slot_unavailable",
            EngineError::AlreadyQueued { .. } => "already_queued",
            EngineError::NotQueued { .. } => "not_queued",
            EngineError::NoCustomerInProgress(_) => "no_customer_in_progress",
            EngineError::CustomerInProgress { .. } => "customer_in_progress",
            EngineError::HoldNotOwned(_) => "hold_not_owned",
            EngineError::HoldExpired { .. } => "hold_expired",
            EngineError::NotHeld(_) => "not_held",
            EngineError::InvalidRange(_) => "invalid_range",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "slot not found: {id}"),
            EngineError::SlotUnavailable(id) => write!(f, "slot {id} is not available"),
            EngineError::AlreadyQueued { provider_id, customer_id } => {
                write!(f, "customer {customer_id} is already queued for provider {provider_id}")
            }
            EngineError::NotQueued { provider_id, customer_id } => {
                write!(f, "customer {customer_id} is not queued for provider {provider_id}")
            }
            EngineError::NoCustomerInProgress(provider_id) => {
                write!(f, "no customer in progress for provider {provider_id}")
            }
            EngineError::CustomerInProgress { provider_id, customer_id } => {
                write!(f, "provider {provider_id} is already serving customer {customer_id}")
            }
            EngineError::HoldNotOwned(id) => write!(f, "hold on slot {id} belongs to another customer"),
            EngineError::HoldExpired { slot_id, expired_at } => {
                write!(f, "hold on slot {slot_id} expired at {expired_at}")
            }
            EngineError::NotHeld(id) => write!(f, "slot {id} is not held"),
            EngineError::InvalidRange(msg) => write!(f, "invalid range: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
