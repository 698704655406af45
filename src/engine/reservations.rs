//! Booking lifecycle: reserve, tentative flow, cancel, reschedule, reminders.
//!
//! Every mutation follows the same shape: resolve the rows, take the slot
//! lock(s) then the client lock, validate under the locks, then `commit` a
//! single event. Slot locks always come before the client lock, and two slot
//! locks are taken in id order, so writers can never deadlock.

use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::{Engine, EngineError, quota};

/// How a client settles a tentative booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TentativeAction {
    Confirm,
    Cancel,
}

/// Result of one reminder delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderOutcome {
    Sent,
    /// No longer due: booking gone, cancelled, or already flagged.
    Skipped,
    /// Transport failure. The flag stays clear, so the next pass retries.
    Failed,
}

/// A booking id dangling from the reverse index means the booking is gone;
/// report it as such rather than leaking the slot lookup.
fn missing_as_booking(e: EngineError, booking_id: BookingId) -> EngineError {
    match e {
        EngineError::SlotNotFound(_) => EngineError::BookingNotFound(booking_id),
        other => other,
    }
}

impl Engine {
    /// Reserve a slot outright: the booking is confirmed immediately if the
    /// slot has no confirmed booking yet.
    pub async fn reserve(
        &self,
        slot_id: SlotId,
        client_id: ClientId,
        service_id: ServiceId,
        now: Ms,
    ) -> Result<BookingInfo, EngineError> {
        let info = self
            .create_booking(slot_id, client_id, service_id, true, now)
            .await?;
        metrics::counter!(observability::RESERVATIONS_TOTAL).increment(1);
        tracing::info!(booking = %info.id, slot = %slot_id, "booking confirmed");

        let text = format!(
            "Booked: {} on {}",
            self.service_name(service_id),
            format_ts(info.at)
        );
        self.notify_client(client_id, &text).await;
        Ok(info)
    }

    /// Reserve a slot tentatively: the booking exists but does not hold the
    /// slot until confirmed via `resolve_tentative`.
    pub async fn reserve_tentative(
        &self,
        slot_id: SlotId,
        client_id: ClientId,
        service_id: ServiceId,
        now: Ms,
    ) -> Result<BookingInfo, EngineError> {
        let info = self
            .create_booking(slot_id, client_id, service_id, false, now)
            .await?;
        tracing::info!(booking = %info.id, slot = %slot_id, "tentative booking created");

        let text = format!(
            "Request received: {} on {}",
            self.service_name(service_id),
            format_ts(info.at)
        );
        self.notify_client(client_id, &text).await;
        Ok(info)
    }

    async fn create_booking(
        &self,
        slot_id: SlotId,
        client_id: ClientId,
        service_id: ServiceId,
        confirmed: bool,
        now: Ms,
    ) -> Result<BookingInfo, EngineError> {
        let _gate = self.hold_mutation_gate().await;
        if !self.clients.contains_key(&client_id) {
            return Err(EngineError::ClientNotFound(client_id));
        }
        if !self.services.contains_key(&service_id) {
            return Err(EngineError::ServiceNotFound(service_id));
        }

        let mut guard = self.lock_slot(&slot_id).await?;
        // The slot may have been removed while we waited for its lock.
        if !self.slots.contains_key(&slot_id) {
            return Err(EngineError::SlotNotFound(slot_id));
        }
        if guard.at <= now {
            return Err(EngineError::SlotInPast(slot_id));
        }
        if self.confirmed_booking(&guard)?.is_some() {
            metrics::counter!(observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::SlotTaken(slot_id));
        }

        let row = BookingRow {
            id: Ulid::new(),
            client_id,
            service_id,
            confirmed,
            reminder_24h_sent: false,
            reminder_3h_sent: false,
            created_at: now,
        };
        let event = Event::BookingCreated {
            slot_id,
            row: row.clone(),
        };
        self.commit(&event, &mut guard, None, None).await?;
        Ok(BookingInfo::from_row(&row, slot_id, guard.at))
    }

    /// Settle a tentative booking. Confirm re-checks the slot, since another
    /// booking may have won it in the meantime. Cancel on a still-tentative
    /// booking withdraws it for free; if the booking was confirmed in the
    /// meantime, the full cancel rules (window, quota) apply.
    pub async fn resolve_tentative(
        &self,
        booking_id: BookingId,
        client_id: ClientId,
        action: TentativeAction,
        now: Ms,
    ) -> Result<BookingInfo, EngineError> {
        let _gate = self.hold_mutation_gate().await;
        let slot_id = self
            .booking_slot
            .get(&booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let mut guard = self
            .lock_slot(&slot_id)
            .await
            .map_err(|e| missing_as_booking(e, booking_id))?;

        let row = guard
            .booking(booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?
            .clone();
        if row.client_id != client_id {
            return Err(EngineError::BookingNotFound(booking_id));
        }
        let at = guard.at;

        match action {
            TentativeAction::Confirm => {
                if row.confirmed {
                    return Ok(BookingInfo::from_row(&row, slot_id, at));
                }
                if at <= now {
                    return Err(EngineError::SlotInPast(slot_id));
                }
                if self.confirmed_booking(&guard)?.is_some() {
                    metrics::counter!(observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
                    return Err(EngineError::SlotTaken(slot_id));
                }

                let event = Event::BookingConfirmed {
                    id: booking_id,
                    slot_id,
                };
                self.commit(&event, &mut guard, None, None).await?;
                metrics::counter!(observability::RESERVATIONS_TOTAL).increment(1);
                tracing::info!(booking = %booking_id, slot = %slot_id, "tentative booking confirmed");
                drop(guard);

                let text = format!(
                    "Confirmed: {} on {}",
                    self.service_name(row.service_id),
                    format_ts(at)
                );
                self.notify_client(client_id, &text).await;

                let mut info = BookingInfo::from_row(&row, slot_id, at);
                info.confirmed = true;
                Ok(info)
            }
            TentativeAction::Cancel => {
                // A booking confirmed since the request goes through the same
                // checks as `cancel`; only a still-tentative one is free.
                if row.confirmed {
                    if at - now <= self.config.modify_lead_ms {
                        return Err(EngineError::TooLate { slot_at: at });
                    }
                    let mut client_guard = self.lock_client(&client_id).await?;
                    let month = month_index(now);
                    self.check_quota(&client_guard, ActionKind::Cancel, month)?;

                    let event = Event::BookingCancelled {
                        id: booking_id,
                        slot_id,
                        client_id,
                        month,
                    };
                    self.commit(&event, &mut guard, None, Some(&mut client_guard))
                        .await?;
                    tracing::info!(booking = %booking_id, slot = %slot_id, "booking cancelled");
                } else {
                    let event = Event::BookingWithdrawn {
                        id: booking_id,
                        slot_id,
                    };
                    self.commit(&event, &mut guard, None, None).await?;
                    tracing::info!(booking = %booking_id, "tentative booking withdrawn");
                }
                Ok(BookingInfo::from_row(&row, slot_id, at))
            }
        }
    }

    /// Cancel a booking. A confirmed one requires the eligibility window to
    /// be open and one unspent cancel in the client's monthly quota; a
    /// tentative one is withdrawn with neither check.
    pub async fn cancel(
        &self,
        booking_id: BookingId,
        client_id: ClientId,
        now: Ms,
    ) -> Result<(), EngineError> {
        let _gate = self.hold_mutation_gate().await;
        let slot_id = self
            .booking_slot
            .get(&booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let mut slot_guard = self
            .lock_slot(&slot_id)
            .await
            .map_err(|e| missing_as_booking(e, booking_id))?;

        let row = slot_guard
            .booking(booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        if row.client_id != client_id {
            return Err(EngineError::BookingNotFound(booking_id));
        }
        if !row.confirmed {
            let event = Event::BookingWithdrawn {
                id: booking_id,
                slot_id,
            };
            self.commit(&event, &mut slot_guard, None, None).await?;
            tracing::info!(booking = %booking_id, "tentative booking withdrawn");
            return Ok(());
        }
        if slot_guard.at - now <= self.config.modify_lead_ms {
            return Err(EngineError::TooLate {
                slot_at: slot_guard.at,
            });
        }

        let mut client_guard = self.lock_client(&client_id).await?;
        let month = month_index(now);
        self.check_quota(&client_guard, ActionKind::Cancel, month)?;

        let event = Event::BookingCancelled {
            id: booking_id,
            slot_id,
            client_id,
            month,
        };
        self.commit(&event, &mut slot_guard, None, Some(&mut client_guard))
            .await?;
        tracing::info!(booking = %booking_id, slot = %slot_id, "booking cancelled");
        Ok(())
    }

    /// Move a booking to another slot atomically: the old booking is deleted
    /// and a fresh confirmed one created in a single transaction, so no
    /// moment exists where the client holds zero or two slots on disk.
    pub async fn reschedule(
        &self,
        booking_id: BookingId,
        client_id: ClientId,
        new_slot_id: SlotId,
        now: Ms,
    ) -> Result<BookingInfo, EngineError> {
        let _gate = self.hold_mutation_gate().await;
        let old_slot_id = self
            .booking_slot
            .get(&booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        if !self.slots.contains_key(&new_slot_id) {
            return Err(EngineError::SlotNotFound(new_slot_id));
        }

        // Both slot locks in id order; the same slot twice is a self-conflict
        // and only needs the one lock for the checks before rejection.
        let (mut old_guard, new_guard) = if new_slot_id == old_slot_id {
            let og = self
                .lock_slot(&old_slot_id)
                .await
                .map_err(|e| missing_as_booking(e, booking_id))?;
            (og, None)
        } else if old_slot_id < new_slot_id {
            let og = self
                .lock_slot(&old_slot_id)
                .await
                .map_err(|e| missing_as_booking(e, booking_id))?;
            let ng = self.lock_slot(&new_slot_id).await?;
            (og, Some(ng))
        } else {
            let ng = self.lock_slot(&new_slot_id).await?;
            let og = self
                .lock_slot(&old_slot_id)
                .await
                .map_err(|e| missing_as_booking(e, booking_id))?;
            (og, Some(ng))
        };

        let service_id = {
            let row = old_guard
                .booking(booking_id)
                .ok_or(EngineError::BookingNotFound(booking_id))?;
            if row.client_id != client_id {
                return Err(EngineError::BookingNotFound(booking_id));
            }
            // Only a confirmed booking moves; rescheduling must never turn a
            // tentative booking into a confirmed one.
            if !row.confirmed {
                return Err(EngineError::BookingNotConfirmed(booking_id));
            }
            row.service_id
        };
        if old_guard.at - now <= self.config.modify_lead_ms {
            return Err(EngineError::TooLate {
                slot_at: old_guard.at,
            });
        }

        let mut client_guard = self.lock_client(&client_id).await?;
        let month = month_index(now);
        self.check_quota(&client_guard, ActionKind::Reschedule, month)?;

        let Some(mut new_guard) = new_guard else {
            metrics::counter!(observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::SlotTaken(new_slot_id));
        };
        if new_guard.at <= now {
            return Err(EngineError::SlotInPast(new_slot_id));
        }
        if self.confirmed_booking(&new_guard)?.is_some() {
            metrics::counter!(observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::SlotTaken(new_slot_id));
        }

        let new_row = BookingRow {
            id: Ulid::new(),
            client_id,
            service_id,
            confirmed: true,
            reminder_24h_sent: false,
            reminder_3h_sent: false,
            created_at: now,
        };
        let new_at = new_guard.at;
        let event = Event::BookingRescheduled {
            old_id: booking_id,
            old_slot_id,
            new_row: new_row.clone(),
            new_slot_id,
            month,
        };
        self.commit(
            &event,
            &mut old_guard,
            Some(&mut new_guard),
            Some(&mut client_guard),
        )
        .await?;
        metrics::counter!(observability::RESERVATIONS_TOTAL).increment(1);
        tracing::info!(
            booking = %booking_id,
            from = %old_slot_id,
            to = %new_slot_id,
            "booking rescheduled"
        );
        drop(old_guard);
        drop(new_guard);
        drop(client_guard);

        let text = format!(
            "Moved: {} now on {}",
            self.service_name(service_id),
            format_ts(new_at)
        );
        self.notify_client(client_id, &text).await;
        Ok(BookingInfo::from_row(&new_row, new_slot_id, new_at))
    }

    /// Deliver one due reminder, then mark the flag. Send-before-mark gives
    /// at-least-once delivery: a crash between the two repeats the message,
    /// never drops it.
    pub async fn send_due_reminder(
        &self,
        booking_id: BookingId,
        lead: ReminderLead,
        now: Ms,
    ) -> Result<ReminderOutcome, EngineError> {
        let _gate = self.hold_mutation_gate().await;
        let Some(slot_id) = self.booking_slot.get(&booking_id).map(|e| *e.value()) else {
            return Ok(ReminderOutcome::Skipped);
        };
        let mut guard = match self.lock_slot(&slot_id).await {
            Ok(g) => g,
            Err(EngineError::SlotNotFound(_)) => return Ok(ReminderOutcome::Skipped),
            Err(e) => return Err(e),
        };

        // Re-verify due-ness under the lock; the scan ran without it.
        let at = guard.at;
        let (client_id, service_id) = {
            let Some(row) = guard.booking(booking_id) else {
                return Ok(ReminderOutcome::Skipped);
            };
            if !row.confirmed || row.reminder_sent(lead) {
                return Ok(ReminderOutcome::Skipped);
            }
            (row.client_id, row.service_id)
        };
        let lead_ms = self.config.reminder_leads[lead.index()];
        if hour_bucket(at) != hour_bucket(now + lead_ms) {
            return Ok(ReminderOutcome::Skipped);
        }
        let Some(client) = self.client(&client_id) else {
            return Ok(ReminderOutcome::Skipped);
        };
        let recipient = client.read().await.external_ref.clone();

        let name = self.service_name(service_id);
        let text = match lead {
            ReminderLead::H24 => {
                format!("Reminder: {name} tomorrow, {}", format_ts(at))
            }
            ReminderLead::H3 => {
                format!("Reminder: {name} today, {}", format_ts(at))
            }
        };
        if let Err(e) = self.notifier.send(&recipient, &text).await {
            metrics::counter!(observability::REMINDER_FAILURES_TOTAL).increment(1);
            tracing::warn!(booking = %booking_id, error = %e, "reminder delivery failed");
            return Ok(ReminderOutcome::Failed);
        }

        let event = Event::ReminderMarked {
            booking_id,
            slot_id,
            lead,
        };
        self.commit(&event, &mut guard, None, None).await?;
        metrics::counter!(observability::REMINDERS_SENT_TOTAL).increment(1);
        Ok(ReminderOutcome::Sent)
    }

    fn check_quota(
        &self,
        client: &ClientState,
        kind: ActionKind,
        month: MonthIdx,
    ) -> Result<(), EngineError> {
        if let Err(e) = quota::check(client, kind, self.config.monthly_action_limit, month) {
            metrics::counter!(observability::QUOTA_REJECTIONS_TOTAL).increment(1);
            return Err(e);
        }
        Ok(())
    }

    fn service_name(&self, id: ServiceId) -> String {
        match self.services.get(&id) {
            Some(s) => s.name.clone(),
            None => {
                // Only reachable if a booking outlived its service, which
                // `remove_service` is supposed to prevent.
                tracing::warn!(service = %id, "booking references a missing service");
                "appointment".to_string()
            }
        }
    }

    /// Fire-and-forget message to a client. Delivery failure is logged and
    /// never fails the operation that triggered it.
    async fn notify_client(&self, client_id: ClientId, text: &str) {
        let Some(client) = self.client(&client_id) else {
            return;
        };
        let recipient = client.read().await.external_ref.clone();
        if let Err(e) = self.notifier.send(&recipient, text).await {
            tracing::warn!(%recipient, error = %e, "notification delivery failed");
        }
    }
}
