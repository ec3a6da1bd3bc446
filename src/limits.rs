use crate::model::{DAY_MS, Ms};

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_SLOT_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_SLOTS_PER_GENERATE: usize = 10_000;
pub const MAX_GENERATE_WINDOW_MS: Ms = 366 * DAY_MS;

pub const MAX_HOLD_TTL_MS: Ms = DAY_MS;

/// Active (WAITING + IN_PROGRESS) entries per provider.
pub const MAX_QUEUE_LEN: usize = 1_000;
