// Metric names. Recorded through the `metrics` facade; whichever recorder the
// embedding process installs receives them.

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: upserts attempted. Labels: outcome.
pub const UPSERTS_TOTAL: &str = "presence_upserts_total";

/// Histogram: consolidation latency in seconds, excluding the sweep.
pub const UPSERT_DURATION_SECONDS: &str = "presence_upsert_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Counter: intervals deleted by sweeps.
pub const INTERVALS_EVICTED_TOTAL: &str = "presence_intervals_evicted_total";

/// Gauge: intervals in the pool.
pub const INTERVALS_LIVE: &str = "presence_intervals_live";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "presence_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "presence_wal_flush_batch_size";

/// Counter: WAL compactions performed by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "presence_wal_compactions_total";
