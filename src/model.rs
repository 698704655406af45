use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub type SlotId = Ulid;
pub type BookingId = Ulid;
pub type ClientId = Ulid;
pub type ServiceId = Ulid;
pub type FeedbackId = Ulid;

/// Calendar month as `year * 12 + month0`. Quota counters reset when it changes.
pub type MonthIdx = i32;

const HOUR_MS: Ms = 3_600_000;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

fn to_datetime(t: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(t).unwrap_or(DateTime::UNIX_EPOCH)
}

pub fn month_index(t: Ms) -> MonthIdx {
    let dt = to_datetime(t);
    dt.year() * 12 + dt.month0() as MonthIdx
}

/// Reminder due-ness is matched on whole hours, like the original scheduler:
/// a booking is due when its slot falls in the same hour bucket as `now + lead`.
pub fn hour_bucket(t: Ms) -> i64 {
    t.div_euclid(HOUR_MS)
}

/// Half-open `[start, end)` millisecond range covering a calendar day.
pub fn day_bounds(day: NaiveDate) -> (Ms, Ms) {
    let start = day.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
    let end = match day.succ_opt() {
        Some(next) => next.and_time(NaiveTime::MIN).and_utc().timestamp_millis(),
        None => Ms::MAX,
    };
    (start, end)
}

/// Wall-clock rendering for user-facing messages, `dd.mm.yyyy HH:MM`.
pub fn format_ts(t: Ms) -> String {
    to_datetime(t).format("%d.%m.%Y %H:%M").to_string()
}

// ── Rows ─────────────────────────────────────────────────────────

/// Quota-consuming booking action, for error reporting and quota bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    Cancel,
    Reschedule,
}

/// The two fixed reminder lead times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReminderLead {
    H24,
    H3,
}

impl ReminderLead {
    pub const ALL: [ReminderLead; 2] = [ReminderLead::H24, ReminderLead::H3];

    pub fn index(self) -> usize {
        match self {
            ReminderLead::H24 => 0,
            ReminderLead::H3 => 1,
        }
    }
}

/// One booking record. Lives inside its slot's row so the slot lock covers
/// the whole confirmed set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRow {
    pub id: BookingId,
    pub client_id: ClientId,
    pub service_id: ServiceId,
    pub confirmed: bool,
    pub reminder_24h_sent: bool,
    pub reminder_3h_sent: bool,
    pub created_at: Ms,
}

impl BookingRow {
    pub fn reminder_sent(&self, lead: ReminderLead) -> bool {
        match lead {
            ReminderLead::H24 => self.reminder_24h_sent,
            ReminderLead::H3 => self.reminder_3h_sent,
        }
    }

    pub fn set_reminder_sent(&mut self, lead: ReminderLead) {
        match lead {
            ReminderLead::H24 => self.reminder_24h_sent = true,
            ReminderLead::H3 => self.reminder_3h_sent = true,
        }
    }
}

/// One published slot plus every booking referencing it.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub id: SlotId,
    /// Slot timestamp; immutable once published, unique across the catalog.
    pub at: Ms,
    pub bookings: Vec<BookingRow>,
}

impl SlotState {
    pub fn new(id: SlotId, at: Ms) -> Self {
        Self {
            id,
            at,
            bookings: Vec::new(),
        }
    }

    pub fn booking(&self, id: BookingId) -> Option<&BookingRow> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: BookingId) -> Option<&mut BookingRow> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    pub fn remove_booking(&mut self, id: BookingId) -> Option<BookingRow> {
        if let Some(pos) = self.bookings.iter().position(|b| b.id == id) {
            Some(self.bookings.remove(pos))
        } else {
            None
        }
    }
}

/// Contact details the driver collects after registration. All optional;
/// the engine only stores and echoes them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProfile {
    pub display_name: Option<String>,
    pub phone: Option<String>,
}

/// Per-client quota counters. `last_action_month` drives the lazy reset.
#[derive(Debug, Clone)]
pub struct ClientState {
    pub id: ClientId,
    pub external_ref: String,
    pub profile: ClientProfile,
    pub reschedules_this_month: u32,
    pub cancels_this_month: u32,
    pub last_action_month: MonthIdx,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRow {
    pub id: ServiceId,
    pub name: String,
    /// Display text, not an amount — the driver renders it verbatim.
    pub price: String,
    pub description: Option<String>,
}

/// One piece of client feedback, append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRow {
    pub id: FeedbackId,
    pub client_id: ClientId,
    pub text: String,
    /// 1 to 5 inclusive.
    pub rating: u8,
    pub created_at: Ms,
}

// ── WAL events ───────────────────────────────────────────────────

/// One event per logical transaction. Multi-row transactions (cancel,
/// reschedule) are single events so replay can never observe half of one.
/// Events carry every value replay needs, including the calendar month a
/// quota was charged in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotPublished {
        id: SlotId,
        at: Ms,
    },
    SlotRemoved {
        id: SlotId,
    },
    /// Full client snapshot: live registration writes zeroed counters and an
    /// empty profile, compaction writes the current ones.
    ClientRegistered {
        id: ClientId,
        external_ref: String,
        profile: ClientProfile,
        reschedules_this_month: u32,
        cancels_this_month: u32,
        last_action_month: MonthIdx,
    },
    ClientProfileUpdated {
        id: ClientId,
        profile: ClientProfile,
    },
    ServiceAdded {
        row: ServiceRow,
    },
    ServiceUpdated {
        row: ServiceRow,
    },
    ServiceRemoved {
        id: ServiceId,
    },
    /// Full booking row snapshot, same reasoning as `ClientRegistered`.
    BookingCreated {
        slot_id: SlotId,
        row: BookingRow,
    },
    BookingConfirmed {
        id: BookingId,
        slot_id: SlotId,
    },
    /// Owner cancelled a never-confirmed booking; no quota charged.
    BookingWithdrawn {
        id: BookingId,
        slot_id: SlotId,
    },
    BookingCancelled {
        id: BookingId,
        slot_id: SlotId,
        client_id: ClientId,
        month: MonthIdx,
    },
    BookingRescheduled {
        old_id: BookingId,
        old_slot_id: SlotId,
        new_row: BookingRow,
        new_slot_id: SlotId,
        month: MonthIdx,
    },
    ReminderMarked {
        booking_id: BookingId,
        slot_id: SlotId,
        lead: ReminderLead,
    },
    FeedbackLeft {
        row: FeedbackRow,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: SlotId,
    pub at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: BookingId,
    pub slot_id: SlotId,
    pub client_id: ClientId,
    pub service_id: ServiceId,
    pub at: Ms,
    pub confirmed: bool,
    pub created_at: Ms,
}

impl BookingInfo {
    pub fn from_row(row: &BookingRow, slot_id: SlotId, at: Ms) -> Self {
        Self {
            id: row.id,
            slot_id,
            client_id: row.client_id,
            service_id: row.service_id,
            at,
            confirmed: row.confirmed,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub external_ref: String,
    pub profile: ClientProfile,
    pub reschedules_this_month: u32,
    pub cancels_this_month: u32,
    pub last_action_month: MonthIdx,
}

/// Outcome of a `publish_slots` batch. Partial success is the normal case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub created: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}
