use crate::model::Ms;

/// 1970-01-01. Earlier timestamps are rejected.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;

/// 2200-01-01.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// About ten years; the widest span a single record may cover.
pub const MAX_SPAN_DURATION_MS: Ms = 10 * 366 * 24 * 3_600_000;

/// Records per subject timeline.
pub const MAX_RECORDS_PER_SUBJECT: usize = 100_000;

/// External reference sources registered on one engine.
pub const MAX_REFERENCE_SOURCES: usize = 64;
