use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;

/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking or released window may not exceed one year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_WINDOWS_PER_SPOT: usize = 10_000;

/// Upper bound on either side of the batch cost matrix.
pub const MAX_BATCH_REQUESTS: usize = 5_000;
pub const MAX_BATCH_SPOTS: usize = 5_000;

pub const MAX_SEARCH_RESULTS: usize = 200;

/// Priority scores outside this range are logged; cost ordering is still exact.
pub const PRIORITY_SCORE_EXPECTED_MAX: i64 = 1_000;

/// Longest DST jump searched past when a local time does not exist.
pub const MAX_DST_GAP_MINUTES: i64 = 180;
