//! Monthly action quota: the lazy reset-on-month-change rule.
//!
//! Counters live on the client row and are only read or written while the
//! client row lock is held, inside the same transaction as the booking
//! mutation they guard. `check` never mutates; the increment happens in
//! event application (`charge`) so live execution and WAL replay share one
//! code path.

use crate::model::{ActionKind, ClientState, MonthIdx};

use super::EngineError;

/// Zero both counters if the calendar month moved on since the last action.
pub(super) fn roll_over(client: &mut ClientState, month: MonthIdx) {
    if client.last_action_month != month {
        client.reschedules_this_month = 0;
        client.cancels_this_month = 0;
        client.last_action_month = month;
    }
}

/// Would one more `kind` action in `month` stay within `limit`?
pub(super) fn check(
    client: &ClientState,
    kind: ActionKind,
    limit: u32,
    month: MonthIdx,
) -> Result<(), EngineError> {
    // A month change means the counters are logically zero even though the
    // reset itself is deferred to the charge.
    let spent = if client.last_action_month != month {
        0
    } else {
        match kind {
            ActionKind::Cancel => client.cancels_this_month,
            ActionKind::Reschedule => client.reschedules_this_month,
        }
    };
    if spent >= limit {
        return Err(EngineError::QuotaExceeded(kind));
    }
    Ok(())
}

/// Apply the rollover and consume one action. Callers have already passed
/// `check` under the same lock.
pub(super) fn charge(client: &mut ClientState, kind: ActionKind, month: MonthIdx) {
    roll_over(client, month);
    match kind {
        ActionKind::Cancel => client.cancels_this_month += 1,
        ActionKind::Reschedule => client.reschedules_this_month += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn client(reschedules: u32, cancels: u32, month: MonthIdx) -> ClientState {
        ClientState {
            id: Ulid::new(),
            external_ref: "ref".into(),
            profile: Default::default(),
            reschedules_this_month: reschedules,
            cancels_this_month: cancels,
            last_action_month: month,
        }
    }

    #[test]
    fn check_rejects_at_limit() {
        let c = client(0, 1, 500);
        assert!(matches!(
            check(&c, ActionKind::Cancel, 1, 500),
            Err(EngineError::QuotaExceeded(ActionKind::Cancel))
        ));
        // The other counter is independent.
        assert!(check(&c, ActionKind::Reschedule, 1, 500).is_ok());
    }

    #[test]
    fn check_treats_new_month_as_zero() {
        let c = client(1, 1, 500);
        assert!(check(&c, ActionKind::Cancel, 1, 501).is_ok());
        assert!(check(&c, ActionKind::Reschedule, 1, 501).is_ok());
    }

    #[test]
    fn charge_rolls_over_then_increments() {
        let mut c = client(1, 1, 500);
        charge(&mut c, ActionKind::Cancel, 501);
        assert_eq!(c.cancels_this_month, 1);
        assert_eq!(c.reschedules_this_month, 0);
        assert_eq!(c.last_action_month, 501);
    }

    #[test]
    fn charge_within_month_accumulates() {
        let mut c = client(0, 0, 500);
        charge(&mut c, ActionKind::Reschedule, 500);
        charge(&mut c, ActionKind::Reschedule, 500);
        assert_eq!(c.reschedules_this_month, 2);
        assert_eq!(c.cancels_this_month, 0);
    }

    #[test]
    fn configurable_limit_above_one() {
        let c = client(1, 0, 500);
        assert!(check(&c, ActionKind::Reschedule, 2, 500).is_ok());
        let c = client(2, 0, 500);
        assert!(check(&c, ActionKind::Reschedule, 2, 500).is_err());
    }

    #[test]
    fn roll_over_is_idempotent_within_month() {
        let mut c = client(1, 0, 500);
        roll_over(&mut c, 500);
        assert_eq!(c.reschedules_this_month, 1);
        roll_over(&mut c, 501);
        roll_over(&mut c, 501);
        assert_eq!(c.reschedules_this_month, 0);
        assert_eq!(c.last_action_month, 501);
    }
}
