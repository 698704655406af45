use crate::model::{ActionKind, BookingId, ClientId, ServiceId, SlotId, format_ts};

#[derive(Debug)]
pub enum EngineError {
    SlotNotFound(SlotId),
    /// Another booking already holds the slot. Expected under concurrency;
    /// the caller should re-query free slots.
    SlotTaken(SlotId),
    SlotInPast(SlotId),
    /// Slot deletion rejected while bookings reference it.
    SlotInUse(SlotId),
    BookingNotFound(BookingId),
    /// Operation requires a confirmed booking; this one is still tentative.
    BookingNotConfirmed(BookingId),
    ClientNotFound(ClientId),
    ServiceNotFound(ServiceId),
    /// Service deletion rejected while bookings reference it.
    ServiceInUse(ServiceId),
    /// Modification window closed: less than the lead time remains.
    TooLate { slot_at: i64 },
    QuotaExceeded(ActionKind),
    /// Row lock not acquired within the bounded wait. Retryable.
    Conflict,
    /// More than one confirmed booking observed on a slot. A bug, not a
    /// user error; the operation aborts and the alert counter fires.
    IntegrityViolated(SlotId),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// True for errors the caller may retry verbatim.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SlotNotFound(id) => write!(f, "slot not found: {id}"),
            EngineError::SlotTaken(id) => write!(f, "slot already taken: {id}"),
            EngineError::SlotInPast(id) => write!(f, "slot is in the past: {id}"),
            EngineError::SlotInUse(id) => {
                write!(f, "cannot remove slot {id}: bookings reference it")
            }
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::BookingNotConfirmed(id) => {
                write!(f, "booking {id} is not confirmed yet")
            }
            EngineError::ClientNotFound(id) => write!(f, "client not found: {id}"),
            EngineError::ServiceNotFound(id) => write!(f, "service not found: {id}"),
            EngineError::ServiceInUse(id) => {
                write!(f, "cannot remove service {id}: bookings reference it")
            }
            EngineError::TooLate { slot_at } => write!(
                f,
                "too late to modify a booking at {}",
                format_ts(*slot_at)
            ),
            EngineError::QuotaExceeded(kind) => {
                let action = match kind {
                    ActionKind::Cancel => "cancel",
                    ActionKind::Reschedule => "reschedule",
                };
                write!(f, "monthly {action} quota exceeded")
            }
            EngineError::Conflict => write!(f, "row lock contention, retry"),
            EngineError::IntegrityViolated(id) => {
                write!(f, "multiple confirmed bookings on slot {id}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
