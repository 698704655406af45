//! Catalog mutations: the slot inventory, client registry and service list.
//! These are table-level operations; none of them touches a booking row.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Publish a batch of slots. Per-entry failures (past timestamps, WAL
    /// errors) land in the outcome; duplicates of existing timestamps are
    /// counted as skipped. One bad entry never aborts the rest.
    pub async fn publish_slots(&self, times: &[Ms], now: Ms) -> Result<PublishOutcome, EngineError> {
        let _gate = self.hold_mutation_gate().await;
        if times.len() > limits::MAX_PUBLISH_BATCH {
            return Err(EngineError::LimitExceeded("publish batch too large"));
        }
        if self.slots.len() + times.len() > limits::MAX_SLOTS {
            return Err(EngineError::LimitExceeded("slot catalog full"));
        }

        let mut outcome = PublishOutcome::default();
        for &at in times {
            if !(limits::MIN_VALID_TIMESTAMP_MS..=limits::MAX_VALID_TIMESTAMP_MS).contains(&at) {
                outcome
                    .errors
                    .push(format!("timestamp out of range: {at}"));
                continue;
            }
            if at <= now {
                outcome
                    .errors
                    .push(format!("slot is in the past: {}", format_ts(at)));
                continue;
            }

            // Claim the timestamp before the WAL write; the entry guard makes
            // the uniqueness check and the claim one step.
            let id = Ulid::new();
            match self.slots_by_time.entry(at) {
                Entry::Occupied(_) => {
                    outcome.skipped += 1;
                    continue;
                }
                Entry::Vacant(v) => {
                    v.insert(id);
                }
            }

            match self.wal_append(&Event::SlotPublished { id, at }).await {
                Ok(()) => {
                    self.slots
                        .insert(id, Arc::new(RwLock::new(SlotState::new(id, at))));
                    outcome.created += 1;
                }
                Err(e) => {
                    self.slots_by_time.remove(&at);
                    outcome.errors.push(format!("{}: {e}", format_ts(at)));
                }
            }
        }
        Ok(outcome)
    }

    /// Remove a slot. Rejected while any booking, confirmed or tentative,
    /// still references it.
    pub async fn remove_slot(&self, id: SlotId) -> Result<(), EngineError> {
        let _gate = self.hold_mutation_gate().await;
        let guard = self.lock_slot(&id).await?;
        if !guard.bookings.is_empty() {
            return Err(EngineError::SlotInUse(id));
        }
        self.wal_append(&Event::SlotRemoved { id }).await?;
        self.slots_by_time.remove(&guard.at);
        self.slots.remove(&id);
        Ok(())
    }

    /// Register a client by its external ref (messenger id, phone, whatever
    /// the driver uses). Idempotent: a known ref returns the existing id.
    pub async fn register_client(&self, external_ref: &str) -> Result<ClientId, EngineError> {
        let _gate = self.hold_mutation_gate().await;
        if external_ref.is_empty() || external_ref.len() > limits::MAX_REF_LEN {
            return Err(EngineError::LimitExceeded("client ref length"));
        }
        if self.clients.len() >= limits::MAX_CLIENTS {
            return Err(EngineError::LimitExceeded("client registry full"));
        }

        let id = Ulid::new();
        match self.clients_by_ref.entry(external_ref.to_string()) {
            Entry::Occupied(e) => return Ok(*e.get()),
            Entry::Vacant(v) => {
                v.insert(id);
            }
        }

        let event = Event::ClientRegistered {
            id,
            external_ref: external_ref.to_string(),
            profile: ClientProfile::default(),
            reschedules_this_month: 0,
            cancels_this_month: 0,
            last_action_month: 0,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.clients_by_ref.remove(external_ref);
            return Err(e);
        }
        self.clients.insert(
            id,
            Arc::new(RwLock::new(ClientState {
                id,
                external_ref: external_ref.to_string(),
                profile: ClientProfile::default(),
                reschedules_this_month: 0,
                cancels_this_month: 0,
                last_action_month: 0,
            })),
        );
        Ok(id)
    }

    /// Store the contact details the driver collected after registration.
    pub async fn update_client_profile(
        &self,
        client_id: ClientId,
        profile: ClientProfile,
    ) -> Result<(), EngineError> {
        let _gate = self.hold_mutation_gate().await;
        if let Some(name) = &profile.display_name
            && name.len() > limits::MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("display name length"));
        }
        if let Some(phone) = &profile.phone
            && phone.len() > limits::MAX_PHONE_LEN
        {
            return Err(EngineError::LimitExceeded("phone length"));
        }

        let mut guard = self.lock_client(&client_id).await?;
        self.wal_append(&Event::ClientProfileUpdated {
            id: client_id,
            profile: profile.clone(),
        })
        .await?;
        guard.profile = profile;
        Ok(())
    }

    /// Record one piece of client feedback in the append-only ledger.
    pub async fn leave_feedback(
        &self,
        client_id: ClientId,
        text: &str,
        rating: u8,
        now: Ms,
    ) -> Result<FeedbackId, EngineError> {
        let _gate = self.hold_mutation_gate().await;
        if !self.clients.contains_key(&client_id) {
            return Err(EngineError::ClientNotFound(client_id));
        }
        if text.is_empty() || text.len() > limits::MAX_FEEDBACK_LEN {
            return Err(EngineError::LimitExceeded("feedback text length"));
        }
        if !(1..=5).contains(&rating) {
            return Err(EngineError::LimitExceeded("feedback rating out of range"));
        }
        if self.feedbacks.len() >= limits::MAX_FEEDBACKS {
            return Err(EngineError::LimitExceeded("feedback ledger full"));
        }

        let row = FeedbackRow {
            id: Ulid::new(),
            client_id,
            text: text.to_string(),
            rating,
            created_at: now,
        };
        self.wal_append(&Event::FeedbackLeft { row: row.clone() })
            .await?;
        let id = row.id;
        self.feedbacks.insert(id, row);
        Ok(id)
    }

    /// Send `text` to every registered client. Per-recipient failures are
    /// logged and skipped; returns the delivered count. Nothing is
    /// journalled, messages are not state.
    pub async fn broadcast(&self, text: &str) -> usize {
        let recipients: Vec<super::SharedClient> =
            self.clients.iter().map(|e| e.value().clone()).collect();
        let mut delivered = 0;
        for client in recipients {
            let recipient = client.read().await.external_ref.clone();
            match self.notifier.send(&recipient, text).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(%recipient, error = %e, "broadcast delivery failed");
                }
            }
        }
        delivered
    }

    pub async fn add_service(
        &self,
        name: &str,
        price: &str,
        description: Option<&str>,
    ) -> Result<ServiceId, EngineError> {
        let _gate = self.hold_mutation_gate().await;
        if name.is_empty() || name.len() > limits::MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("service name length"));
        }
        if self.services.len() >= limits::MAX_SERVICES {
            return Err(EngineError::LimitExceeded("service list full"));
        }

        let row = ServiceRow {
            id: Ulid::new(),
            name: name.to_string(),
            price: price.to_string(),
            description: description.map(str::to_string),
        };
        self.wal_append(&Event::ServiceAdded { row: row.clone() })
            .await?;
        let id = row.id;
        self.services.insert(id, row);
        Ok(id)
    }

    /// Replace every field of a service. Existing bookings keep pointing at
    /// the same id and pick up the new name in future messages.
    pub async fn update_service(
        &self,
        id: ServiceId,
        name: &str,
        price: &str,
        description: Option<&str>,
    ) -> Result<(), EngineError> {
        let _gate = self.hold_mutation_gate().await;
        if name.is_empty() || name.len() > limits::MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("service name length"));
        }
        if !self.services.contains_key(&id) {
            return Err(EngineError::ServiceNotFound(id));
        }

        let row = ServiceRow {
            id,
            name: name.to_string(),
            price: price.to_string(),
            description: description.map(str::to_string),
        };
        self.wal_append(&Event::ServiceUpdated { row: row.clone() })
            .await?;
        self.services.insert(id, row);
        Ok(())
    }

    /// Remove a service. Rejected while any booking references it, so a
    /// dangling service id can never appear in a reminder.
    pub async fn remove_service(&self, id: ServiceId) -> Result<(), EngineError> {
        let _gate = self.hold_mutation_gate().await;
        if !self.services.contains_key(&id) {
            return Err(EngineError::ServiceNotFound(id));
        }

        let slot_rows: Vec<super::SharedSlot> =
            self.slots.iter().map(|e| e.value().clone()).collect();
        for slot in slot_rows {
            let guard = slot.read().await;
            if guard.bookings.iter().any(|b| b.service_id == id) {
                return Err(EngineError::ServiceInUse(id));
            }
        }

        self.wal_append(&Event::ServiceRemoved { id }).await?;
        self.services.remove(&id);
        Ok(())
    }
}
