mod catalog;
mod error;
mod queries;
mod quota;
mod reservations;

pub use error::EngineError;
pub use reservations::{ReminderOutcome, TentativeAction};

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};

use crate::model::*;
use crate::notify::Notifier;
use crate::wal::Wal;

pub type SharedSlot = Arc<RwLock<SlotState>>;
pub type SharedClient = Arc<RwLock<ClientState>>;

const HOUR_MS: Ms = 3_600_000;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cap on cancels and reschedules per client per calendar month.
    pub monthly_action_limit: u32,
    /// Minimum lead time for cancel/reschedule (the eligibility window).
    pub modify_lead_ms: Ms,
    /// Reminder lead times, indexed by `ReminderLead`.
    pub reminder_leads: [Ms; 2],
    /// Bounded wait for a row lock; timeout surfaces as retryable `Conflict`.
    pub lock_wait: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            monthly_action_limit: 1,
            modify_lead_ms: 24 * HOUR_MS,
            reminder_leads: [24 * HOUR_MS, 3 * HOUR_MS],
            lock_wait: Duration::from_secs(2),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// Block on the first append, drain whatever else is immediately available,
/// fsync once for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush what we have, then handle the non-append command.
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even after an append error, so partially buffered bytes
    // don't leak into the next batch (these callers were told it failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

/// The reservation core: slot catalog, booking ledger and client quota
/// counters, all mutated under row locks and journalled to the WAL.
pub struct Engine {
    slots: DashMap<SlotId, SharedSlot>,
    /// Unique-timestamp index. A timestamp is claimed here before the slot
    /// row exists, which is what makes `publish_slots` dedup atomic.
    slots_by_time: DashMap<Ms, SlotId>,
    clients: DashMap<ClientId, SharedClient>,
    clients_by_ref: DashMap<String, ClientId>,
    services: DashMap<ServiceId, ServiceRow>,
    feedbacks: DashMap<FeedbackId, FeedbackRow>,
    /// Reverse lookup: booking id → owning slot row.
    booking_slot: DashMap<BookingId, SlotId>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Shared by every mutating operation, exclusive during WAL compaction,
    /// so a snapshot can never miss a commit whose append precedes the
    /// rewrite in the writer channel.
    mutation_gate: RwLock<()>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        wal_path: &Path,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            slots: DashMap::new(),
            slots_by_time: DashMap::new(),
            clients: DashMap::new(),
            clients_by_ref: DashMap::new(),
            services: DashMap::new(),
            feedbacks: DashMap::new(),
            booking_slot: DashMap::new(),
            wal_tx,
            mutation_gate: RwLock::new(()),
            notifier,
            config,
        };

        for event in &events {
            engine.apply_replayed(event);
        }

        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Every mutating operation holds this for its duration; compaction
    /// takes it exclusively to quiesce the append stream.
    pub(super) async fn hold_mutation_gate(&self) -> tokio::sync::RwLockReadGuard<'_, ()> {
        self.mutation_gate.read().await
    }

    /// Write an event through the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then mutate the locked rows. The single commit point for
    /// every booking transaction; callers hold the locks.
    pub(super) async fn commit(
        &self,
        event: &Event,
        slot: &mut SlotState,
        second_slot: Option<&mut SlotState>,
        client: Option<&mut ClientState>,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_locked(event, slot, second_slot, client);
        Ok(())
    }

    // ── Row access ───────────────────────────────────────

    fn slot(&self, id: &SlotId) -> Option<SharedSlot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    fn client(&self, id: &ClientId) -> Option<SharedClient> {
        self.clients.get(id).map(|e| e.value().clone())
    }

    /// Lock a slot row for writing, waiting at most `config.lock_wait`.
    pub(super) async fn lock_slot(
        &self,
        id: &SlotId,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<SlotState>, EngineError> {
        let slot = self.slot(id).ok_or(EngineError::SlotNotFound(*id))?;
        match tokio::time::timeout(self.config.lock_wait, slot.write_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
                Err(EngineError::Conflict)
            }
        }
    }

    pub(super) async fn lock_client(
        &self,
        id: &ClientId,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<ClientState>, EngineError> {
        let client = self.client(id).ok_or(EngineError::ClientNotFound(*id))?;
        match tokio::time::timeout(self.config.lock_wait, client.write_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => Err(EngineError::Conflict),
        }
    }

    /// The confirmed booking on a slot, if any. Seeing more than one is an
    /// integrity failure: abort, log, and trip the alert counter.
    pub(super) fn confirmed_booking<'a>(
        &self,
        slot: &'a SlotState,
    ) -> Result<Option<&'a BookingRow>, EngineError> {
        let mut confirmed = slot.bookings.iter().filter(|b| b.confirmed);
        let first = confirmed.next();
        if confirmed.next().is_some() {
            metrics::counter!(crate::observability::INTEGRITY_VIOLATIONS_TOTAL).increment(1);
            tracing::error!(slot = %slot.id, "multiple confirmed bookings on one slot");
            return Err(EngineError::IntegrityViolated(slot.id));
        }
        Ok(first)
    }

    // ── Event application ────────────────────────────────

    fn insert_booking(&self, slot: &mut SlotState, row: BookingRow) {
        self.booking_slot.insert(row.id, slot.id);
        slot.bookings.push(row);
    }

    fn delete_booking(&self, slot: &mut SlotState, id: BookingId) {
        slot.remove_booking(id);
        self.booking_slot.remove(&id);
    }

    /// Mutate locked rows for a booking event. For reschedules `slot` is the
    /// old slot and `second_slot` the new one. Shared between the live commit
    /// path and replay so the two can never drift apart.
    fn apply_locked(
        &self,
        event: &Event,
        slot: &mut SlotState,
        second_slot: Option<&mut SlotState>,
        client: Option<&mut ClientState>,
    ) {
        match event {
            Event::BookingCreated { row, .. } => {
                self.insert_booking(slot, row.clone());
            }
            Event::BookingConfirmed { id, .. } => {
                if let Some(b) = slot.booking_mut(*id) {
                    b.confirmed = true;
                }
            }
            Event::BookingWithdrawn { id, .. } => {
                self.delete_booking(slot, *id);
            }
            Event::BookingCancelled { id, month, .. } => {
                self.delete_booking(slot, *id);
                if let Some(c) = client {
                    quota::charge(c, ActionKind::Cancel, *month);
                }
            }
            Event::BookingRescheduled {
                old_id,
                new_row,
                month,
                ..
            } => {
                self.delete_booking(slot, *old_id);
                if let Some(new_slot) = second_slot {
                    self.insert_booking(new_slot, new_row.clone());
                }
                if let Some(c) = client {
                    quota::charge(c, ActionKind::Reschedule, *month);
                }
            }
            Event::ReminderMarked { booking_id, lead, .. } => {
                if let Some(b) = slot.booking_mut(*booking_id) {
                    b.set_reminder_sent(*lead);
                }
            }
            // Table-level events never reach here; their operations mutate
            // the maps directly, as replay does below.
            _ => {}
        }
    }

    /// Rebuild state from one replayed event. We are the sole owner of every
    /// row Arc during replay, so try_read/try_write always succeed instantly.
    fn apply_replayed(&self, event: &Event) {
        match event {
            Event::SlotPublished { id, at } => {
                self.slots
                    .insert(*id, Arc::new(RwLock::new(SlotState::new(*id, *at))));
                self.slots_by_time.insert(*at, *id);
            }
            Event::SlotRemoved { id } => {
                if let Some((_, slot)) = self.slots.remove(id) {
                    let at = slot.try_read().expect("replay: uncontended read").at;
                    self.slots_by_time.remove(&at);
                }
            }
            Event::ClientRegistered {
                id,
                external_ref,
                profile,
                reschedules_this_month,
                cancels_this_month,
                last_action_month,
            } => {
                self.clients.insert(
                    *id,
                    Arc::new(RwLock::new(ClientState {
                        id: *id,
                        external_ref: external_ref.clone(),
                        profile: profile.clone(),
                        reschedules_this_month: *reschedules_this_month,
                        cancels_this_month: *cancels_this_month,
                        last_action_month: *last_action_month,
                    })),
                );
                self.clients_by_ref.insert(external_ref.clone(), *id);
            }
            Event::ClientProfileUpdated { id, profile } => {
                if let Some(client) = self.client(id) {
                    let mut guard = client.try_write().expect("replay: uncontended write");
                    guard.profile = profile.clone();
                }
            }
            Event::ServiceAdded { row } | Event::ServiceUpdated { row } => {
                self.services.insert(row.id, row.clone());
            }
            Event::ServiceRemoved { id } => {
                self.services.remove(id);
            }
            Event::FeedbackLeft { row } => {
                self.feedbacks.insert(row.id, row.clone());
            }
            Event::BookingCreated { slot_id, .. }
            | Event::BookingConfirmed { slot_id, .. }
            | Event::BookingWithdrawn { slot_id, .. }
            | Event::ReminderMarked { slot_id, .. } => {
                if let Some(slot) = self.slot(slot_id) {
                    let mut guard = slot.try_write().expect("replay: uncontended write");
                    self.apply_locked(event, &mut guard, None, None);
                }
            }
            Event::BookingCancelled {
                slot_id, client_id, ..
            } => {
                if let Some(slot) = self.slot(slot_id) {
                    let mut sg = slot.try_write().expect("replay: uncontended write");
                    match self.client(client_id) {
                        Some(client) => {
                            let mut cg =
                                client.try_write().expect("replay: uncontended write");
                            self.apply_locked(event, &mut sg, None, Some(&mut cg));
                        }
                        None => self.apply_locked(event, &mut sg, None, None),
                    }
                }
            }
            Event::BookingRescheduled {
                old_slot_id,
                new_slot_id,
                new_row,
                ..
            } => {
                let (Some(old_slot), Some(new_slot)) =
                    (self.slot(old_slot_id), self.slot(new_slot_id))
                else {
                    return;
                };
                let mut og = old_slot.try_write().expect("replay: uncontended write");
                let mut ng = new_slot.try_write().expect("replay: uncontended write");
                match self.client(&new_row.client_id) {
                    Some(client) => {
                        let mut cg = client.try_write().expect("replay: uncontended write");
                        self.apply_locked(event, &mut og, Some(&mut ng), Some(&mut cg));
                    }
                    None => self.apply_locked(event, &mut og, Some(&mut ng), None),
                }
            }
        }
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL as the minimal event set recreating current state:
    /// one snapshot event per slot, booking, client, service and feedback.
    ///
    /// The mutation gate is held exclusively while the snapshot is collected
    /// and the rewrite enqueued, so no acknowledged commit can land between
    /// the two; appends enqueued after the gate drops follow the rewrite in
    /// the writer channel and land in the new file.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let rx = {
            let _quiesce = self.mutation_gate.write().await;
            let mut events = Vec::new();

            // Row locks are free of writers while the gate is held.
            let slot_rows: Vec<SharedSlot> =
                self.slots.iter().map(|e| e.value().clone()).collect();
            for slot in slot_rows {
                let guard = slot.read().await;
                events.push(Event::SlotPublished {
                    id: guard.id,
                    at: guard.at,
                });
                for row in &guard.bookings {
                    events.push(Event::BookingCreated {
                        slot_id: guard.id,
                        row: row.clone(),
                    });
                }
            }

            let client_rows: Vec<SharedClient> =
                self.clients.iter().map(|e| e.value().clone()).collect();
            for client in client_rows {
                let guard = client.read().await;
                events.push(Event::ClientRegistered {
                    id: guard.id,
                    external_ref: guard.external_ref.clone(),
                    profile: guard.profile.clone(),
                    reschedules_this_month: guard.reschedules_this_month,
                    cancels_this_month: guard.cancels_this_month,
                    last_action_month: guard.last_action_month,
                });
            }

            for service in self.services.iter() {
                events.push(Event::ServiceAdded {
                    row: service.value().clone(),
                });
            }
            for feedback in self.feedbacks.iter() {
                events.push(Event::FeedbackLeft {
                    row: feedback.value().clone(),
                });
            }

            let (tx, rx) = oneshot::channel();
            self.wal_tx
                .send(WalCommand::Compact {
                    events,
                    response: tx,
                })
                .await
                .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
            rx
        };
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
