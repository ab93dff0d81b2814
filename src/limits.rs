//! Hard limits on sizes accepted from the outside world.

/// Upper bound for `bookingMaxDays`.
pub const MAX_BOOKING_DAYS: i64 = 366;

/// Upper bound for `bookingMinLeadMinutes` (one week).
pub const MAX_LEAD_MINUTES: i64 = 7 * 24 * 60;

/// Service durations and slot intervals must fit inside one day.
pub const MAX_DURATION_MINUTES: i64 = 24 * 60;

pub const MAX_SERVICES: usize = 1_000;

pub const MAX_NAME_LEN: usize = 256;

pub const MAX_NOTES_LEN: usize = 4_096;

pub const MAX_USER_ID_LEN: usize = 128;

/// Appointments stored on a single day shard, including cancelled ones.
pub const MAX_APPOINTMENTS_PER_DAY: usize = 10_000;

/// Maximum length of one protocol line.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Live-query channels a single connection may listen on.
pub const MAX_LISTENS_PER_CONNECTION: usize = 64;
