use crate::model::Ms;

pub const MAX_SLOTS: usize = 100_000;
pub const MAX_CLIENTS: usize = 100_000;
pub const MAX_SERVICES: usize = 1_000;

/// Upper bound on one `publish_slots` batch.
pub const MAX_PUBLISH_BATCH: usize = 500;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REF_LEN: usize = 128;
pub const MAX_PHONE_LEN: usize = 32;

pub const MAX_FEEDBACKS: usize = 100_000;
pub const MAX_FEEDBACK_LEN: usize = 500;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z — anything later is a caller bug.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
