//! Read-only queries. Scans snapshot the row Arcs first so no DashMap shard
//! guard is ever held across an await.

use chrono::NaiveDate;

use crate::model::*;

use super::{Engine, EngineError, SharedClient, SharedSlot};

impl Engine {
    fn slot_snapshot(&self) -> Vec<SharedSlot> {
        self.slots.iter().map(|e| e.value().clone()).collect()
    }

    /// All slots in `[start, end)`, booked or not, sorted by time. Operator
    /// view of the calendar.
    pub fn list_future_slots(&self, start: Ms, end: Ms) -> Vec<SlotInfo> {
        let mut slots: Vec<SlotInfo> = self
            .slots_by_time
            .iter()
            .filter(|e| (start..end).contains(e.key()))
            .map(|e| SlotInfo {
                id: *e.value(),
                at: *e.key(),
            })
            .collect();
        slots.sort_by_key(|s| s.at);
        slots
    }

    /// Slots on `day` that are still bookable: in the future and with no
    /// confirmed booking. Tentative bookings do not hide a slot.
    pub async fn list_free_slots(
        &self,
        day: NaiveDate,
        now: Ms,
    ) -> Result<Vec<SlotInfo>, EngineError> {
        let (start, end) = day_bounds(day);
        let candidates = self.list_future_slots(start.max(now + 1), end);

        let mut free = Vec::with_capacity(candidates.len());
        for info in candidates {
            let Some(slot) = self.slot(&info.id) else {
                continue;
            };
            let guard = slot.read().await;
            if self.confirmed_booking(&guard)?.is_none() {
                free.push(info);
            }
        }
        Ok(free)
    }

    /// A client's upcoming bookings, confirmed and tentative, sorted by time.
    pub async fn list_client_bookings(
        &self,
        client_id: ClientId,
        now: Ms,
    ) -> Result<Vec<BookingInfo>, EngineError> {
        if !self.clients.contains_key(&client_id) {
            return Err(EngineError::ClientNotFound(client_id));
        }

        let mut bookings = Vec::new();
        for slot in self.slot_snapshot() {
            let guard = slot.read().await;
            if guard.at < now {
                continue;
            }
            for row in guard.bookings.iter().filter(|b| b.client_id == client_id) {
                bookings.push(BookingInfo::from_row(row, guard.id, guard.at));
            }
        }
        bookings.sort_by_key(|b| b.at);
        Ok(bookings)
    }

    pub async fn get_booking(&self, booking_id: BookingId) -> Option<BookingInfo> {
        let slot_id = *self.booking_slot.get(&booking_id)?;
        let slot = self.slot(&slot_id)?;
        let guard = slot.read().await;
        guard
            .booking(booking_id)
            .map(|row| BookingInfo::from_row(row, slot_id, guard.at))
    }

    pub fn get_service(&self, id: ServiceId) -> Option<ServiceRow> {
        self.services.get(&id).map(|e| e.value().clone())
    }

    pub fn list_services(&self) -> Vec<ServiceRow> {
        let mut services: Vec<ServiceRow> =
            self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    pub fn client_by_ref(&self, external_ref: &str) -> Option<ClientId> {
        self.clients_by_ref.get(external_ref).map(|e| *e.value())
    }

    pub async fn client_info(&self, client_id: ClientId) -> Option<ClientInfo> {
        let client: SharedClient = self.client(&client_id)?;
        let guard = client.read().await;
        Some(ClientInfo {
            id: guard.id,
            external_ref: guard.external_ref.clone(),
            profile: guard.profile.clone(),
            reschedules_this_month: guard.reschedules_this_month,
            cancels_this_month: guard.cancels_this_month,
            last_action_month: guard.last_action_month,
        })
    }

    /// Every feedback entry, newest first.
    pub fn list_feedbacks(&self) -> Vec<FeedbackRow> {
        let mut rows: Vec<FeedbackRow> =
            self.feedbacks.iter().map(|e| e.value().clone()).collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows
    }

    /// Bookings due a `lead` reminder around `now`: confirmed, flag clear,
    /// slot in the same hour bucket as `now + lead`. Runs lock-free with
    /// `try_read`; a row busy this pass is picked up on the next one, and
    /// the sender re-verifies everything under the lock anyway.
    pub fn collect_due_reminders(&self, lead: ReminderLead, now: Ms) -> Vec<BookingId> {
        let lead_ms = self.config.reminder_leads[lead.index()];
        let target = hour_bucket(now + lead_ms);

        let mut due = Vec::new();
        for entry in self.slots.iter() {
            let Ok(guard) = entry.value().try_read() else {
                continue;
            };
            if hour_bucket(guard.at) != target {
                continue;
            }
            for row in &guard.bookings {
                if row.confirmed && !row.reminder_sent(lead) {
                    due.push(row.id);
                }
            }
        }
        due
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}
