//! Slot reservation and booking lifecycle engine for a single-provider
//! appointment business.
//!
//! The core invariant is at most one confirmed booking per slot, enforced by
//! a per-slot row lock around every booking mutation. State lives in memory
//! and is journalled to an append-only WAL; recovery replays the log. Cancel
//! and reschedule draw from per-client monthly quotas and close 24 hours
//! before the slot; a background scheduler sends 24h and 3h reminders with
//! at-least-once delivery.

pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reminder;
pub mod service;
pub mod wal;
