use crate::model::{DAY, Ms};

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_RENTAL_DURATION_MS: Ms = 90 * DAY;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY;

pub const MAX_NOTE_LEN: usize = 2_000;
pub const MAX_REASON_LEN: usize = 500;
pub const MAX_PHOTO_REF_LEN: usize = 1_024;
pub const MAX_TRANSACTION_ID_LEN: usize = 128;

pub const MAX_UPCOMING_LIMIT: usize = 1_000;
