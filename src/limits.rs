use crate::model::Ms;

pub const MAX_ROOMS_PER_TENANT: usize = 100_000;
pub const MAX_BOOKINGS_PER_ROOM: usize = 50_000;
pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 4_096;
pub const MAX_PURPOSE_LEN: usize = 4_096;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single booking may not exceed 90 days.
pub const MAX_BOOKING_DURATION_MS: Ms = 90 * 24 * 3_600_000;
/// Free-window queries may not span more than a year.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

/// Per-user inbox bound; oldest notices are dropped first.
pub const MAX_NOTICES_PER_USER: usize = 500;
