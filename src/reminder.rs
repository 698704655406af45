//! Reminder scheduler: periodic passes that collect due bookings for each
//! lead time and deliver them one at a time.

use std::sync::Arc;
use std::time::Duration;

use crate::engine::{Engine, ReminderOutcome};
use crate::model::{Ms, ReminderLead, now_ms};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassOutcome {
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// One scheduler pass at `now`. Collection runs without locks; every hit is
/// re-verified by `send_due_reminder` under the slot lock before delivery.
pub async fn run_pass(engine: &Engine, now: Ms) -> PassOutcome {
    let mut outcome = PassOutcome::default();
    for lead in ReminderLead::ALL {
        for booking_id in engine.collect_due_reminders(lead, now) {
            match engine.send_due_reminder(booking_id, lead, now).await {
                Ok(ReminderOutcome::Sent) => outcome.sent += 1,
                Ok(ReminderOutcome::Skipped) => outcome.skipped += 1,
                Ok(ReminderOutcome::Failed) => outcome.failed += 1,
                Err(e) => {
                    outcome.failed += 1;
                    tracing::warn!(booking = %booking_id, error = %e, "reminder pass error");
                }
            }
        }
    }
    outcome
}

/// Single long-running scheduler task. One task means passes are serialized:
/// a slow pass delays the next tick instead of overlapping it.
pub async fn run_reminder_loop(engine: Arc<Engine>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let outcome = run_pass(&engine, now_ms()).await;
        if outcome.sent > 0 || outcome.failed > 0 {
            tracing::info!(
                sent = outcome.sent,
                failed = outcome.failed,
                "reminder pass complete"
            );
        }
    }
}
